//! Public events feed that keeps working while the backend is unreachable.
//!
//! The last good listing is persisted with its timestamp. When a fetch fails
//! the persisted copy is served as stale, and the backend is probed on a short
//! cadence until it answers again, at which point the listing is fetched once
//! and the long keep-alive cadence resumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::types::Event;
use crate::api::{ApiResult, FlockApi};
use crate::config::OfflineConfig;
use crate::storage::{keys, KeyValueStore};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const STALE_NOTICE: &str = "Showing saved events. We'll update them when the connection is back.";
pub const DISCONNECTED_NOTICE: &str = "Events are unavailable right now. Check your connection.";

/// Where the feed gets its data from.
#[async_trait]
pub trait EventsSource: Send + Sync {
  /// Cheap reachability check.
  async fn probe(&self) -> ApiResult<()>;

  /// Full listing, bypassing any cached copy.
  async fn fetch_public_events(&self) -> ApiResult<Vec<Event>>;
}

#[async_trait]
impl EventsSource for FlockApi {
  async fn probe(&self) -> ApiResult<()> {
    FlockApi::probe(self, PROBE_TIMEOUT).await
  }

  async fn fetch_public_events(&self) -> ApiResult<Vec<Event>> {
    Ok(self.refetch_public_events().await?.results)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
  Online,
  Checking,
  Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedState {
  Loading,
  Fresh {
    events: Vec<Event>,
    fetched_at: DateTime<Utc>,
  },
  Stale {
    events: Vec<Event>,
    saved_at: DateTime<Utc>,
    notice: String,
  },
  Disconnected {
    notice: String,
  },
}

impl FeedState {
  pub fn events(&self) -> &[Event] {
    match self {
      FeedState::Fresh { events, .. } | FeedState::Stale { events, .. } => events,
      FeedState::Loading | FeedState::Disconnected { .. } => &[],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
  pub connectivity: Connectivity,
  pub feed: FeedState,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
  events: Vec<Event>,
  saved_at: DateTime<Utc>,
}

pub struct EventsFeed<S> {
  source: Arc<S>,
  store: Arc<dyn KeyValueStore>,
  config: OfflineConfig,
  status: watch::Sender<FeedStatus>,
}

impl<S: EventsSource> EventsFeed<S> {
  pub fn new(source: Arc<S>, store: Arc<dyn KeyValueStore>, config: OfflineConfig) -> Self {
    let (status, _) = watch::channel(FeedStatus {
      connectivity: Connectivity::Checking,
      feed: FeedState::Loading,
    });
    Self {
      source,
      store,
      config,
      status,
    }
  }

  pub fn status(&self) -> FeedStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<FeedStatus> {
    self.status.subscribe()
  }

  /// Fetch the listing, bounded by the fetch timeout. Returns whether the
  /// backend answered.
  pub async fn refresh(&self) -> bool {
    let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
    let result = match tokio::time::timeout(timeout, self.source.fetch_public_events()).await {
      Ok(result) => result,
      Err(_) => {
        warn!(timeout_secs = timeout.as_secs(), "Events fetch timed out");
        Err(crate::api::ApiError::network("fetch timed out"))
      }
    };

    match result {
      Ok(events) => {
        let fetched_at = Utc::now();
        self.persist(&events, fetched_at);
        debug!(count = events.len(), "Events feed refreshed");
        self.publish(Connectivity::Online, FeedState::Fresh { events, fetched_at });
        true
      }
      Err(e) => {
        warn!(error = %e, "Events fetch failed, serving saved copy");
        self.serve_saved();
        false
      }
    }
  }

  /// Probe the backend. Returns whether it answered.
  pub async fn probe(&self) -> bool {
    self.status.send_modify(|s| s.connectivity = Connectivity::Checking);

    let reachable = matches!(
      tokio::time::timeout(PROBE_TIMEOUT, self.source.probe()).await,
      Ok(Ok(()))
    );
    let connectivity = if reachable {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };
    self.status.send_modify(|s| s.connectivity = connectivity);
    reachable
  }

  /// Drive the feed until `cancel` fires: fetch on start, then probe every
  /// keep-alive interval while online and every retry interval while offline.
  pub async fn run(&self, cancel: CancellationToken) {
    let keep_alive = Duration::from_secs(self.config.keep_alive_secs);
    let retry = Duration::from_secs(self.config.retry_secs);
    let Some(mut online) = until_cancelled(&cancel, self.refresh()).await else {
      debug!("Events feed stopped");
      return;
    };

    loop {
      let wait = if online { keep_alive } else { retry };
      if until_cancelled(&cancel, tokio::time::sleep(wait)).await.is_none() {
        break;
      }

      let Some(reachable) = until_cancelled(&cancel, self.probe()).await else {
        break;
      };
      match (online, reachable) {
        (true, false) => {
          info!("Backend unreachable, switching to saved events");
          self.serve_saved();
          online = false;
        }
        (false, true) => {
          info!("Backend reachable again, refetching events");
          match until_cancelled(&cancel, self.refresh()).await {
            Some(fresh) => online = fresh,
            None => break,
          }
        }
        _ => {}
      }
    }
    debug!("Events feed stopped");
  }

  fn publish(&self, connectivity: Connectivity, feed: FeedState) {
    self.status.send_replace(FeedStatus { connectivity, feed });
  }

  fn serve_saved(&self) {
    let feed = match self.load_snapshot() {
      Some(snapshot) => FeedState::Stale {
        events: snapshot.events,
        saved_at: snapshot.saved_at,
        notice: STALE_NOTICE.to_string(),
      },
      None => FeedState::Disconnected {
        notice: DISCONNECTED_NOTICE.to_string(),
      },
    };
    self.publish(Connectivity::Offline, feed);
  }

  fn persist(&self, events: &[Event], saved_at: DateTime<Utc>) {
    let snapshot = Snapshot {
      events: events.to_vec(),
      saved_at,
    };
    let result = serde_json::to_string(&snapshot)
      .map_err(color_eyre::eyre::Report::from)
      .and_then(|json| self.store.set(keys::PUBLIC_EVENTS_SNAPSHOT, &json));
    if let Err(e) = result {
      warn!(error = %e, "Failed to save events snapshot");
    }
  }

  fn load_snapshot(&self) -> Option<Snapshot> {
    let raw = match self.store.get(keys::PUBLIC_EVENTS_SNAPSHOT) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(error = %e, "Failed to read events snapshot");
        return None;
      }
    };
    match serde_json::from_str(&raw) {
      Ok(snapshot) => Some(snapshot),
      Err(e) => {
        warn!(error = %e, "Discarding unreadable events snapshot");
        None
      }
    }
  }
}

/// `None` when `cancel` fires before `fut` settles.
async fn until_cancelled<F: std::future::Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => None,
    out = fut => Some(out),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiError;
  use crate::storage::MemoryStore;
  use std::collections::VecDeque;
  use std::sync::Mutex;
  use tokio::time::Instant;

  /// Scripted outcomes; the last one repeats.
  #[derive(Default)]
  struct FakeSource {
    probes: Mutex<VecDeque<bool>>,
    fetches: Mutex<VecDeque<bool>>,
    probe_times: Mutex<Vec<Duration>>,
    fetch_times: Mutex<Vec<Duration>>,
    hang: bool,
    started: Option<Instant>,
  }

  impl FakeSource {
    fn new(probes: &[bool], fetches: &[bool]) -> Self {
      Self {
        probes: Mutex::new(probes.iter().copied().collect()),
        fetches: Mutex::new(fetches.iter().copied().collect()),
        started: Some(Instant::now()),
        ..Self::default()
      }
    }

    fn elapsed(&self) -> Duration {
      self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn next(queue: &Mutex<VecDeque<bool>>) -> bool {
      let mut queue = queue.lock().unwrap();
      if queue.len() > 1 {
        queue.pop_front().unwrap()
      } else {
        queue.front().copied().unwrap_or(false)
      }
    }
  }

  #[async_trait]
  impl EventsSource for FakeSource {
    async fn probe(&self) -> ApiResult<()> {
      self.probe_times.lock().unwrap().push(self.elapsed());
      if Self::next(&self.probes) {
        Ok(())
      } else {
        Err(ApiError::network("connection refused"))
      }
    }

    async fn fetch_public_events(&self) -> ApiResult<Vec<Event>> {
      self.fetch_times.lock().unwrap().push(self.elapsed());
      if self.hang {
        std::future::pending::<()>().await;
      }
      if Self::next(&self.fetches) {
        Ok(vec![Event {
          id: 1,
          title: "Sunday service".into(),
          ..Default::default()
        }])
      } else {
        Err(ApiError::network("connection refused"))
      }
    }
  }

  fn feed(source: FakeSource, store: Arc<MemoryStore>) -> Arc<EventsFeed<FakeSource>> {
    Arc::new(EventsFeed::new(Arc::new(source), store, OfflineConfig::default()))
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_with_one_refetch_then_keep_alive() {
    let source = FakeSource::new(&[false, false, false, true], &[false, true]);
    let feed = feed(source, Arc::new(MemoryStore::new()));
    let cancel = CancellationToken::new();

    let task = {
      let (feed, cancel) = (feed.clone(), cancel.clone());
      tokio::spawn(async move { feed.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(425)).await;
    cancel.cancel();
    task.await.unwrap();

    let secs = |times: &Mutex<Vec<Duration>>| -> Vec<u64> {
      times.lock().unwrap().iter().map(|d| d.as_secs()).collect()
    };
    assert_eq!(secs(&feed.source.probe_times), vec![30, 60, 90, 120, 420]);
    assert_eq!(secs(&feed.source.fetch_times), vec![0, 120]);

    let status = feed.status();
    assert_eq!(status.connectivity, Connectivity::Online);
    assert!(matches!(status.feed, FeedState::Fresh { .. }));
  }

  #[tokio::test]
  async fn test_failure_serves_snapshot_as_stale() {
    let store = Arc::new(MemoryStore::new());

    let first = feed(FakeSource::new(&[true], &[true]), store.clone());
    assert!(first.refresh().await);
    assert!(store.get(keys::PUBLIC_EVENTS_SNAPSHOT).unwrap().is_some());

    let second = feed(FakeSource::new(&[false], &[false]), store);
    assert!(!second.refresh().await);

    let status = second.status();
    assert_eq!(status.connectivity, Connectivity::Offline);
    match status.feed {
      FeedState::Stale { events, notice, .. } => {
        assert_eq!(events[0].title, "Sunday service");
        assert_eq!(notice, STALE_NOTICE);
      }
      other => panic!("expected stale feed, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_failure_without_snapshot_is_disconnected() {
    let feed = feed(FakeSource::new(&[false], &[false]), Arc::new(MemoryStore::new()));
    assert!(!feed.refresh().await);
    assert!(matches!(feed.status().feed, FeedState::Disconnected { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_hanging_fetch_ends_within_timeout() {
    let source = FakeSource {
      hang: true,
      ..FakeSource::new(&[false], &[true])
    };
    let feed = feed(source, Arc::new(MemoryStore::new()));

    let started = Instant::now();
    assert!(!feed.refresh().await);
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert!(!matches!(feed.status().feed, FeedState::Loading));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_during_hanging_fetch_stops_promptly() {
    let source = FakeSource {
      hang: true,
      ..FakeSource::new(&[true], &[true])
    };
    let feed = feed(source, Arc::new(MemoryStore::new()));
    let cancel = CancellationToken::new();

    let task = {
      let (feed, cancel) = (feed.clone(), cancel.clone());
      tokio::spawn(async move { feed.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let started = Instant::now();
    cancel.cancel();
    task.await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(feed.source.probe_times.lock().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_going_offline_keeps_showing_events() {
    let source = FakeSource::new(&[false], &[true]);
    let feed = feed(source, Arc::new(MemoryStore::new()));
    let cancel = CancellationToken::new();

    let task = {
      let (feed, cancel) = (feed.clone(), cancel.clone());
      tokio::spawn(async move { feed.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(301)).await;
    let status = feed.status();
    assert_eq!(status.connectivity, Connectivity::Offline);
    assert_eq!(status.feed.events().len(), 1);

    cancel.cancel();
    task.await.unwrap();
  }
}
