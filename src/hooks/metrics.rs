//! Derived metrics. Pure functions of the merged data; a zero, negative or
//! non-finite denominator yields `0.0`, never NaN.

use serde::Serialize;

use crate::api::types::{Event, EventStats, MemberStats, Pledge, PledgeStats};

fn percent(numerator: f64, denominator: f64) -> f64 {
  if !denominator.is_finite() || denominator <= 0.0 || !numerator.is_finite() {
    return 0.0;
  }
  numerator / denominator * 100.0
}

/// Percentage change between two periods.
pub fn growth_rate(current: u64, previous: u64) -> f64 {
  percent(current as f64 - previous as f64, previous as f64)
}

pub fn retention_rate(active: u64, total: u64) -> f64 {
  percent(active as f64, total as f64)
}

pub fn pledge_completion_rate(received: f64, pledged: f64) -> f64 {
  percent(received, pledged)
}

pub fn capacity_utilisation(registrations: u64, capacity: u64) -> f64 {
  percent(registrations as f64, capacity as f64)
}

/// Utilisation over the events that declare a capacity.
pub fn events_capacity_utilisation(events: &[Event]) -> f64 {
  let (registrations, capacity) = events
    .iter()
    .filter_map(|e| e.max_capacity.map(|cap| (e.registration_count, cap)))
    .fold((0, 0), |(r, c), (er, ec)| (r + er, c + ec));
  capacity_utilisation(registrations, capacity)
}

pub fn average_pledge(pledges: &[Pledge]) -> f64 {
  if pledges.is_empty() {
    return 0.0;
  }
  let total: f64 = pledges.iter().map(|p| p.amount).filter(|a| a.is_finite()).sum();
  total / pledges.len() as f64
}

/// Metrics shown next to the dashboard and report figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
  pub member_growth_rate: f64,
  pub retention_rate: f64,
  pub pledge_completion_rate: f64,
  pub capacity_utilisation: f64,
  pub average_pledge: f64,
}

impl Metrics {
  pub fn from_stats(
    members: Option<&MemberStats>,
    events: Option<&EventStats>,
    pledges: Option<&PledgeStats>,
  ) -> Self {
    let mut metrics = Metrics::default();

    if let Some(m) = members {
      metrics.member_growth_rate = growth_rate(m.new_members_this_month, m.new_members_last_month);
      metrics.retention_rate = retention_rate(m.active_members, m.total_members);
    }
    if let Some(e) = events {
      metrics.capacity_utilisation = capacity_utilisation(e.total_registrations, e.total_capacity);
    }
    if let Some(p) = pledges {
      metrics.pledge_completion_rate =
        pledge_completion_rate(p.total_received_amount, p.total_pledged_amount);
      metrics.average_pledge = if p.average_pledge_amount > 0.0 {
        p.average_pledge_amount
      } else if p.total_pledges > 0 {
        p.total_pledged_amount / p.total_pledges as f64
      } else {
        0.0
      };
    }
    metrics
  }
}
