//! Reports: period statistics for every family, only for users who may see
//! reports.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::watch;

use super::aggregate::{AggregateHook, AggregatedResult, Constituent, LoadMode};
use super::metrics::Metrics;
use crate::api::resources::{StatsPeriod, EVENTS, MEMBERS, PLEDGES};
use crate::api::types::{EventStats, MemberStats, PledgeStats};
use crate::api::FlockApi;
use crate::auth::Permission;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportsData {
  pub period: StatsPeriod,
  pub member_stats: Option<MemberStats>,
  pub event_stats: Option<EventStats>,
  pub pledge_stats: Option<PledgeStats>,
}

impl ReportsData {
  pub fn metrics(&self) -> Metrics {
    Metrics::from_stats(
      self.member_stats.as_ref(),
      self.event_stats.as_ref(),
      self.pledge_stats.as_ref(),
    )
  }
}

pub struct ReportsHook {
  api: FlockApi,
  period: Mutex<StatsPeriod>,
  engine: AggregateHook<ReportsData>,
}

impl ReportsHook {
  pub fn new(api: FlockApi, period: StatsPeriod) -> Self {
    let engine = AggregateHook::new(api.auth().clone(), api.cache().clone());
    Self {
      api,
      period: Mutex::new(period),
      engine,
    }
  }

  fn period(&self) -> StatsPeriod {
    *self.period.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  /// Switch period and reload. The previous period's figures are cleared.
  pub async fn set_period(&self, period: StatsPeriod) {
    *self.period.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = period;
    self.load(LoadMode::Initial).await;
  }

  pub async fn load(&self, mode: LoadMode) {
    let api = &self.api;
    let period = self.period();

    let constituents = vec![
      Constituent::new(
        "member_statistics",
        Some(Permission::ViewReports),
        api.get_member_statistics(Some(period)),
        |d: &mut ReportsData, stats| d.member_stats = Some(stats),
      ),
      Constituent::new(
        "event_statistics",
        Some(Permission::ViewReports),
        api.get_event_statistics(Some(period)),
        |d: &mut ReportsData, stats| d.event_stats = Some(stats),
      ),
      Constituent::new(
        "pledge_statistics",
        Some(Permission::ViewReports),
        api.get_pledge_statistics(Some(period)),
        |d: &mut ReportsData, stats| d.pledge_stats = Some(stats),
      ),
    ];

    if self.engine.state().data.period != period {
      self.engine.reset(ReportsData {
        period,
        ..ReportsData::default()
      });
    }
    self
      .engine
      .run(mode, &[MEMBERS, EVENTS, PLEDGES], constituents)
      .await;
  }

  pub fn state(&self) -> AggregatedResult<ReportsData> {
    self.engine.state()
  }

  pub fn subscribe(&self) -> watch::Receiver<AggregatedResult<ReportsData>> {
    self.engine.subscribe()
  }
}
