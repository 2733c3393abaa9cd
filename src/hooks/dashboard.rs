//! Dashboard: statistics for all three families plus the latest members and
//! the next events, fetched together.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::aggregate::{AggregateHook, AggregatedResult, AutoRefresh, Constituent, LoadMode, Refreshable};
use super::metrics::{events_capacity_utilisation, Metrics};
use crate::api::resources::{EVENTS, MEMBERS, PLEDGES};
use crate::api::types::{Event, EventStats, Member, MemberStats, PledgeStats};
use crate::api::FlockApi;
use crate::auth::Permission;
use crate::config::DashboardConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardData {
  pub member_stats: Option<MemberStats>,
  pub event_stats: Option<EventStats>,
  pub pledge_stats: Option<PledgeStats>,
  pub recent_members: Vec<Member>,
  pub upcoming_events: Vec<Event>,
}

impl DashboardData {
  pub fn metrics(&self) -> Metrics {
    let mut metrics = Metrics::from_stats(
      self.member_stats.as_ref(),
      self.event_stats.as_ref(),
      self.pledge_stats.as_ref(),
    );
    if self.event_stats.is_none() {
      metrics.capacity_utilisation = events_capacity_utilisation(&self.upcoming_events);
    }
    metrics
  }
}

struct DashboardLoader {
  api: FlockApi,
  config: DashboardConfig,
  engine: AggregateHook<DashboardData>,
}

impl DashboardLoader {
  fn constituents(&self) -> Vec<Constituent<'_, DashboardData>> {
    let api = &self.api;
    vec![
      Constituent::new(
        "member_statistics",
        Some(Permission::ViewMembers),
        api.get_member_statistics(None),
        |d: &mut DashboardData, stats| d.member_stats = Some(stats),
      ),
      Constituent::new(
        "event_statistics",
        Some(Permission::ViewEvents),
        api.get_event_statistics(None),
        |d: &mut DashboardData, stats| d.event_stats = Some(stats),
      ),
      Constituent::new(
        "pledge_statistics",
        Some(Permission::ViewPledges),
        api.get_pledge_statistics(None),
        |d: &mut DashboardData, stats| d.pledge_stats = Some(stats),
      ),
      Constituent::new(
        "recent_members",
        Some(Permission::ViewMembers),
        api.get_recent_members(self.config.recent_members_limit),
        |d: &mut DashboardData, members| d.recent_members = members,
      ),
      Constituent::new(
        "upcoming_events",
        Some(Permission::ViewEvents),
        api.get_upcoming_events(self.config.upcoming_events_limit),
        |d: &mut DashboardData, events| d.upcoming_events = events,
      ),
    ]
  }
}

#[async_trait]
impl Refreshable for DashboardLoader {
  async fn reload(&self, mode: LoadMode) {
    self
      .engine
      .run(mode, &[MEMBERS, EVENTS, PLEDGES], self.constituents())
      .await;
  }
}

/// Owns the dashboard state. Dropping it stops the auto-refresh task.
pub struct DashboardHook {
  loader: Arc<DashboardLoader>,
  auto_refresh: Option<AutoRefresh>,
}

impl DashboardHook {
  pub fn new(api: FlockApi, config: DashboardConfig) -> Self {
    let engine = AggregateHook::new(api.auth().clone(), api.cache().clone());
    Self {
      loader: Arc::new(DashboardLoader { api, config, engine }),
      auto_refresh: None,
    }
  }

  pub async fn load(&self) {
    self.loader.reload(LoadMode::Initial).await;
  }

  /// Drop the cached dashboard reads and load again with `loading` shown.
  pub async fn refresh(&self) {
    self.loader.reload(LoadMode::Manual).await;
  }

  pub async fn refresh_silently(&self) {
    self.loader.reload(LoadMode::Background).await;
  }

  /// Refresh silently every `dashboard.auto_refresh_secs` while this hook lives.
  pub fn start_auto_refresh(&mut self) {
    let period = Duration::from_secs(self.loader.config.auto_refresh_secs);
    self.auto_refresh = Some(AutoRefresh::spawn(&self.loader, period));
  }

  pub fn stop_auto_refresh(&mut self) {
    self.auto_refresh = None;
  }

  pub fn state(&self) -> AggregatedResult<DashboardData> {
    self.loader.engine.state()
  }

  pub fn subscribe(&self) -> watch::Receiver<AggregatedResult<DashboardData>> {
    self.loader.engine.subscribe()
  }

  pub fn metrics(&self) -> Metrics {
    self.state().data.metrics()
  }
}
