//! Typed access to the backend's resources with caching and invalidation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::client::{decode, ApiClient};
use super::error::{ApiError, ApiResult};
use super::transport::RequestSpec;
use super::types::{
  Event, EventStats, Member, MemberStats, NewEvent, NewMember, NewPledge, Page, Pledge,
  PledgeStats,
};
use crate::auth::{AuthManager, Permission};
use crate::cache::{family_prefix, RequestDescriptor, ResponseCache};
use crate::config::{ApiConfig, CacheConfig};

pub const MEMBERS: &str = "members";
pub const EVENTS: &str = "events";
pub const PLEDGES: &str = "pledges";

/// TTLs per kind of data.
#[derive(Debug, Clone)]
pub struct CacheTtls {
  pub list: Duration,
  pub statistics: Duration,
  pub recent: Duration,
  pub reference: Duration,
}

impl From<&CacheConfig> for CacheTtls {
  fn from(config: &CacheConfig) -> Self {
    Self {
      list: Duration::from_secs(config.list_ttl_secs),
      statistics: Duration::from_secs(config.statistics_ttl_secs),
      recent: Duration::from_secs(config.recent_ttl_secs),
      reference: Duration::from_secs(config.reference_ttl_secs),
    }
  }
}

impl Default for CacheTtls {
  fn default() -> Self {
    Self::from(&CacheConfig::default())
  }
}

/// Reporting window for statistics endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPeriod {
  #[default]
  Month,
  Quarter,
  Year,
}

impl StatsPeriod {
  pub fn as_str(self) -> &'static str {
    match self {
      StatsPeriod::Month => "month",
      StatsPeriod::Quarter => "quarter",
      StatsPeriod::Year => "year",
    }
  }
}

impl std::str::FromStr for StatsPeriod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "month" => Ok(StatsPeriod::Month),
      "quarter" => Ok(StatsPeriod::Quarter),
      "year" => Ok(StatsPeriod::Year),
      other => Err(format!("Unknown period: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberQuery {
  pub search: Option<String>,
  pub status: Option<String>,
  pub ordering: Option<String>,
  pub page: Option<u32>,
  pub page_size: Option<u32>,
}

impl MemberQuery {
  fn descriptor(&self) -> RequestDescriptor {
    RequestDescriptor::new("members/")
      .param_opt("search", self.search.as_deref().filter(|s| !s.trim().is_empty()))
      .param_opt("status", self.status.as_deref())
      .param_opt("ordering", self.ordering.as_deref())
      .param_opt("page", self.page)
      .param_opt("page_size", self.page_size)
      .requires(Permission::ViewMembers)
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
  pub status: Option<String>,
  pub is_public: Option<bool>,
  pub search: Option<String>,
  pub page: Option<u32>,
  pub page_size: Option<u32>,
}

impl EventQuery {
  /// Published events visible on the public site.
  pub fn public() -> Self {
    Self {
      status: Some("published".to_string()),
      is_public: Some(true),
      ..Self::default()
    }
  }

  fn descriptor(&self) -> RequestDescriptor {
    let descriptor = RequestDescriptor::new("events/")
      .param_opt("status", self.status.as_deref())
      .param_opt("is_public", self.is_public)
      .param_opt("search", self.search.as_deref())
      .param_opt("page", self.page)
      .param_opt("page_size", self.page_size);

    // Public listings need no session
    if self.is_public == Some(true) {
      descriptor
    } else {
      descriptor.requires(Permission::ViewEvents)
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PledgeQuery {
  pub status: Option<String>,
  pub member: Option<u64>,
  pub page: Option<u32>,
  pub page_size: Option<u32>,
}

impl PledgeQuery {
  fn descriptor(&self) -> RequestDescriptor {
    RequestDescriptor::new("pledges/")
      .param_opt("status", self.status.as_deref())
      .param_opt("member", self.member)
      .param_opt("page", self.page)
      .param_opt("page_size", self.page_size)
      .requires(Permission::ViewPledges)
  }
}

/// The church backend's resources.
#[derive(Clone)]
pub struct FlockApi {
  client: ApiClient,
  cache: ResponseCache,
  ttls: CacheTtls,
  heavy_timeout: Duration,
}

impl FlockApi {
  pub fn new(client: ApiClient, cache: ResponseCache, ttls: CacheTtls, api: &ApiConfig) -> Self {
    Self {
      client,
      cache,
      ttls,
      heavy_timeout: api.heavy_timeout(),
    }
  }

  pub fn client(&self) -> &ApiClient {
    &self.client
  }

  pub fn auth(&self) -> &AuthManager {
    self.client.auth()
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  pub fn ttls(&self) -> &CacheTtls {
    &self.ttls
  }

  fn require(&self, permission: Option<Permission>) -> ApiResult<()> {
    match permission {
      Some(p) if !self.auth().has_permission(p) => {
        debug!(permission = %p, "Call not issued, permission missing");
        Err(ApiError::permission_denied())
      }
      _ => Ok(()),
    }
  }

  /// Read through the cache. Calls the caller may not make are never issued.
  pub async fn fetch<T: DeserializeOwned>(
    &self,
    descriptor: &RequestDescriptor,
    ttl: Duration,
  ) -> ApiResult<T> {
    self.fetch_with_timeout(descriptor, ttl, None).await
  }

  async fn fetch_with_timeout<T: DeserializeOwned>(
    &self,
    descriptor: &RequestDescriptor,
    ttl: Duration,
    timeout: Option<Duration>,
  ) -> ApiResult<T> {
    self.require(descriptor.required_permission)?;

    let client = self.client.clone();
    let mut spec = descriptor.to_request();
    spec.timeout = timeout;

    let value = self
      .cache
      .fetch(&descriptor.cache_key(), ttl, move || async move {
        client.json(&spec).await
      })
      .await?;
    decode(value)
  }

  /// Send a write, then drop the family's cached reads before returning.
  async fn mutate<T: DeserializeOwned>(
    &self,
    spec: RequestSpec,
    family: &str,
    permission: Permission,
  ) -> ApiResult<T> {
    self.require(Some(permission))?;

    let value = self.client.json(&spec).await?;
    let removed = self.cache.invalidate_prefix(&family_prefix(family));
    debug!(family, removed, "Invalidated cached reads after write");
    decode(value)
  }

  fn statistics(&self, family: &str, period: Option<StatsPeriod>, permission: Permission) -> RequestDescriptor {
    RequestDescriptor::new(format!("{}/statistics/", family))
      .param_opt("period", period.map(StatsPeriod::as_str))
      .requires(permission)
  }

  // --------------------------------------------------------------------------
  // Members
  // --------------------------------------------------------------------------

  pub async fn get_members(&self, query: &MemberQuery) -> ApiResult<Page<Member>> {
    self.fetch(&query.descriptor(), self.ttls.list).await
  }

  pub async fn get_member(&self, id: u64) -> ApiResult<Member> {
    let descriptor = RequestDescriptor::new(format!("members/{}/", id)).requires(Permission::ViewMembers);
    self.fetch(&descriptor, self.ttls.list).await
  }

  pub async fn create_member(&self, member: &NewMember) -> ApiResult<Member> {
    let spec = RequestSpec::post("members/").with_body(member);
    self.mutate(spec, MEMBERS, Permission::CreateMember).await
  }

  pub async fn update_member<B: Serialize + ?Sized>(&self, id: u64, changes: &B) -> ApiResult<Member> {
    let spec = RequestSpec::patch(format!("members/{}/", id)).with_body(changes);
    self.mutate(spec, MEMBERS, Permission::EditMember).await
  }

  pub async fn delete_member(&self, id: u64) -> ApiResult<()> {
    let spec = RequestSpec::delete(format!("members/{}/", id));
    self.mutate(spec, MEMBERS, Permission::DeleteMember).await
  }

  pub async fn get_member_statistics(&self, period: Option<StatsPeriod>) -> ApiResult<MemberStats> {
    let descriptor = self.statistics(MEMBERS, period, Permission::ViewMembers);
    self
      .fetch_with_timeout(&descriptor, self.ttls.statistics, Some(self.heavy_timeout))
      .await
  }

  pub async fn get_recent_members(&self, limit: u32) -> ApiResult<Vec<Member>> {
    let descriptor = RequestDescriptor::new("members/recent/")
      .param("limit", limit)
      .requires(Permission::ViewMembers);
    let page: Page<Member> = self.fetch(&descriptor, self.ttls.recent).await?;
    Ok(page.results)
  }

  // --------------------------------------------------------------------------
  // Events
  // --------------------------------------------------------------------------

  pub async fn get_events(&self, query: &EventQuery) -> ApiResult<Page<Event>> {
    self.fetch(&query.descriptor(), self.ttls.list).await
  }

  /// Public listing, bypassing any cached copy.
  pub async fn refetch_public_events(&self) -> ApiResult<Page<Event>> {
    let descriptor = EventQuery::public().descriptor();
    self.cache.invalidate(&descriptor.cache_key());
    self.fetch(&descriptor, self.ttls.list).await
  }

  pub async fn get_event(&self, id: u64) -> ApiResult<Event> {
    let descriptor = RequestDescriptor::new(format!("events/{}/", id)).requires(Permission::ViewEvents);
    self.fetch(&descriptor, self.ttls.list).await
  }

  pub async fn create_event(&self, event: &NewEvent) -> ApiResult<Event> {
    let spec = RequestSpec::post("events/").with_body(event);
    self.mutate(spec, EVENTS, Permission::ManageEvents).await
  }

  pub async fn update_event<B: Serialize + ?Sized>(&self, id: u64, changes: &B) -> ApiResult<Event> {
    let spec = RequestSpec::patch(format!("events/{}/", id)).with_body(changes);
    self.mutate(spec, EVENTS, Permission::ManageEvents).await
  }

  pub async fn delete_event(&self, id: u64) -> ApiResult<()> {
    let spec = RequestSpec::delete(format!("events/{}/", id));
    self.mutate(spec, EVENTS, Permission::ManageEvents).await
  }

  pub async fn get_event_statistics(&self, period: Option<StatsPeriod>) -> ApiResult<EventStats> {
    let descriptor = self.statistics(EVENTS, period, Permission::ViewEvents);
    self
      .fetch_with_timeout(&descriptor, self.ttls.statistics, Some(self.heavy_timeout))
      .await
  }

  pub async fn get_upcoming_events(&self, limit: u32) -> ApiResult<Vec<Event>> {
    let descriptor = RequestDescriptor::new("events/upcoming/")
      .param("limit", limit)
      .requires(Permission::ViewEvents);
    let page: Page<Event> = self.fetch(&descriptor, self.ttls.recent).await?;
    Ok(page.results)
  }

  /// Lightweight reachability check against the backend.
  pub async fn probe(&self, timeout: Duration) -> ApiResult<()> {
    let spec = RequestSpec::get("health/").with_timeout(timeout);
    self.client.execute(&spec).await.map(|_| ())
  }

  // --------------------------------------------------------------------------
  // Pledges
  // --------------------------------------------------------------------------

  pub async fn get_pledges(&self, query: &PledgeQuery) -> ApiResult<Page<Pledge>> {
    self.fetch(&query.descriptor(), self.ttls.list).await
  }

  pub async fn get_pledge(&self, id: u64) -> ApiResult<Pledge> {
    let descriptor = RequestDescriptor::new(format!("pledges/{}/", id)).requires(Permission::ViewPledges);
    self.fetch(&descriptor, self.ttls.list).await
  }

  pub async fn create_pledge(&self, pledge: &NewPledge) -> ApiResult<Pledge> {
    let spec = RequestSpec::post("pledges/").with_body(pledge);
    self.mutate(spec, PLEDGES, Permission::ManagePledges).await
  }

  pub async fn update_pledge<B: Serialize + ?Sized>(&self, id: u64, changes: &B) -> ApiResult<Pledge> {
    let spec = RequestSpec::patch(format!("pledges/{}/", id)).with_body(changes);
    self.mutate(spec, PLEDGES, Permission::ManagePledges).await
  }

  pub async fn delete_pledge(&self, id: u64) -> ApiResult<()> {
    let spec = RequestSpec::delete(format!("pledges/{}/", id));
    self.mutate(spec, PLEDGES, Permission::ManagePledges).await
  }

  pub async fn get_pledge_statistics(&self, period: Option<StatsPeriod>) -> ApiResult<PledgeStats> {
    let descriptor = self.statistics(PLEDGES, period, Permission::ViewPledges);
    self
      .fetch_with_timeout(&descriptor, self.ttls.statistics, Some(self.heavy_timeout))
      .await
  }

  pub async fn get_recent_pledges(&self, limit: u32) -> ApiResult<Vec<Pledge>> {
    let descriptor = RequestDescriptor::new("pledges/recent/")
      .param("limit", limit)
      .requires(Permission::ViewPledges);
    let page: Page<Pledge> = self.fetch(&descriptor, self.ttls.recent).await?;
    Ok(page.results)
  }
}
