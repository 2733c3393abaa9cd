//! Recent activity across members, events and pledges.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::aggregate::{AggregateHook, AggregatedResult, AutoRefresh, Constituent, LoadMode, Refreshable};
use crate::api::resources::{EVENTS, MEMBERS, PLEDGES};
use crate::api::types::{Event, Member, Pledge};
use crate::api::FlockApi;
use crate::auth::Permission;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecentActivity {
  pub members: Vec<Member>,
  pub events: Vec<Event>,
  pub pledges: Vec<Pledge>,
}

impl RecentActivity {
  pub fn is_empty(&self) -> bool {
    self.members.is_empty() && self.events.is_empty() && self.pledges.is_empty()
  }
}

struct RecentLoader {
  api: FlockApi,
  limit: u32,
  engine: AggregateHook<RecentActivity>,
}

#[async_trait]
impl Refreshable for RecentLoader {
  async fn reload(&self, mode: LoadMode) {
    let api = &self.api;
    let constituents = vec![
      Constituent::new(
        "recent_members",
        Some(Permission::ViewMembers),
        api.get_recent_members(self.limit),
        |d: &mut RecentActivity, members| d.members = members,
      ),
      Constituent::new(
        "upcoming_events",
        Some(Permission::ViewEvents),
        api.get_upcoming_events(self.limit),
        |d: &mut RecentActivity, events| d.events = events,
      ),
      Constituent::new(
        "recent_pledges",
        Some(Permission::ViewPledges),
        api.get_recent_pledges(self.limit),
        |d: &mut RecentActivity, pledges| d.pledges = pledges,
      ),
    ];
    self
      .engine
      .run(mode, &[MEMBERS, EVENTS, PLEDGES], constituents)
      .await;
  }
}

pub struct RecentActivityHook {
  loader: Arc<RecentLoader>,
  auto_refresh: Option<AutoRefresh>,
}

impl RecentActivityHook {
  pub fn new(api: FlockApi, limit: u32) -> Self {
    let engine = AggregateHook::new(api.auth().clone(), api.cache().clone());
    Self {
      loader: Arc::new(RecentLoader { api, limit, engine }),
      auto_refresh: None,
    }
  }

  pub async fn load(&self) {
    self.loader.reload(LoadMode::Initial).await;
  }

  pub async fn refresh(&self) {
    self.loader.reload(LoadMode::Manual).await;
  }

  pub fn start_auto_refresh(&mut self, period: Duration) {
    self.auto_refresh = Some(AutoRefresh::spawn(&self.loader, period));
  }

  pub fn state(&self) -> AggregatedResult<RecentActivity> {
    self.loader.engine.state()
  }

  pub fn subscribe(&self) -> watch::Receiver<AggregatedResult<RecentActivity>> {
    self.loader.engine.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::resources::testing::api_with_role;
  use crate::api::transport::testing::ScriptedBackend;
  use serde_json::json;

  #[tokio::test]
  async fn test_recent_activity_with_limit() {
    let backend = ScriptedBackend::new();
    backend.ok("GET members/recent/", json!([{"id": 1}, {"id": 2}]));
    backend.ok("GET events/upcoming/", json!([{"id": 5}]));
    backend.ok("GET pledges/recent/", json!({"count": 0, "results": []}));
    let hook = RecentActivityHook::new(api_with_role(backend.clone(), Some("readonly")).await, 3);

    hook.load().await;

    let state = hook.state();
    assert_eq!(state.error, None);
    assert_eq!(state.data.members.len(), 2);
    assert_eq!(state.data.events.len(), 1);
    assert!(state.data.pledges.is_empty());

    let request = backend
      .requests()
      .into_iter()
      .find(|r| r.url.path().ends_with("/members/recent/"))
      .unwrap();
    assert_eq!(request.url.query(), Some("limit=3"));
  }

  #[tokio::test]
  async fn test_signed_out_issues_nothing() {
    let backend = ScriptedBackend::new();
    let hook = RecentActivityHook::new(api_with_role(backend.clone(), None).await, 5);

    hook.load().await;

    let state = hook.state();
    assert!(state.data.is_empty());
    assert_eq!(state.error, None);
    assert!(backend.requests().is_empty());
  }
}
