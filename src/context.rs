//! Wiring of the shared pieces: one store, one cache and one session for the
//! whole process, handed to every hook.

use color_eyre::Result;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::api::retry::RetryPolicy;
use crate::api::{
  ApiClient, CacheTtls, FlockApi, HttpBackend, MemberQuery, ReqwestBackend, StatsPeriod, Transport,
};
use crate::auth::AuthManager;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::hooks::{DashboardHook, MembersListHook, RecentActivityHook, ReportsHook};
use crate::import::{import_members, parse_members, ImportReport};
use crate::offline::EventsFeed;
use crate::storage::{KeyValueStore, SqliteStore};

pub struct AppContext {
  pub config: Config,
  pub store: Arc<dyn KeyValueStore>,
  pub cache: ResponseCache,
  pub auth: AuthManager,
  pub api: FlockApi,
}

impl AppContext {
  /// Real network and the on-disk store.
  pub fn new(config: Config) -> Result<Self> {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open()?);
    let backend: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new()?);
    Self::with_parts(config, backend, store)
  }

  pub fn with_parts(
    config: Config,
    backend: Arc<dyn HttpBackend>,
    store: Arc<dyn KeyValueStore>,
  ) -> Result<Self> {
    let transport = Transport::new(backend, &config.api.base_url, config.api.timeout())?;
    let cache = ResponseCache::new();
    let auth = AuthManager::new(transport.clone(), store.clone(), cache.clone(), config.auth.clone());
    let client = ApiClient::new(transport, auth.clone(), RetryPolicy::from(&config.retry));
    let api = FlockApi::new(client, cache.clone(), CacheTtls::from(&config.cache), &config.api);

    Ok(Self {
      config,
      store,
      cache,
      auth,
      api,
    })
  }

  pub fn dashboard(&self) -> DashboardHook {
    DashboardHook::new(self.api.clone(), self.config.dashboard.clone())
  }

  pub fn recent_activity(&self) -> RecentActivityHook {
    RecentActivityHook::new(self.api.clone(), self.config.dashboard.recent_members_limit)
  }

  pub fn reports(&self, period: StatsPeriod) -> ReportsHook {
    ReportsHook::new(self.api.clone(), period)
  }

  pub fn members_list(&self, filter: MemberQuery) -> MembersListHook {
    MembersListHook::new(self.api.clone(), filter)
  }

  pub fn events_feed(&self) -> EventsFeed<FlockApi> {
    EventsFeed::new(
      Arc::new(self.api.clone()),
      self.store.clone(),
      self.config.offline.clone(),
    )
  }

  /// Parse and import a CSV of members.
  pub async fn import_csv<R: Read>(&self, reader: R, batch_size: Option<usize>) -> Result<ImportReport> {
    let rows = parse_members(reader)?;
    let batch_size = batch_size.unwrap_or(self.config.import.batch_size);
    Ok(import_members(&self.api, rows, batch_size).await?)
  }

  /// Keep the access token fresh in the background.
  pub fn spawn_refresh_monitor(&self) -> JoinHandle<()> {
    self
      .auth
      .spawn_refresh_monitor(Duration::from_secs(self.config.auth.refresh_check_secs))
  }
}
