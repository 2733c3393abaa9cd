//! In-memory TTL cache with in-flight request deduplication.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::api::error::ApiResult;

type SharedFetch = Shared<BoxFuture<'static, ApiResult<Value>>>;

/// One cached payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub data: Value,
  pub stored_at: Instant,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn is_expired(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.stored_at) >= self.ttl
  }
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  /// Pending fetches by key, tagged with an id so a completing fetch can tell
  /// whether it was invalidated while in flight
  inflight: HashMap<String, (u64, SharedFetch)>,
}

impl CacheState {
  fn fresh(&mut self, key: &str) -> Option<Value> {
    let now = Instant::now();
    match self.entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        self.entries.remove(key);
        None
      }
      Some(entry) => Some(entry.data.clone()),
      None => None,
    }
  }
}

/// Shared response cache. Cloning yields another handle to the same cache.
#[derive(Clone, Default)]
pub struct ResponseCache {
  state: Arc<Mutex<CacheState>>,
  next_fetch_id: Arc<AtomicU64>,
}

impl ResponseCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Cached payload for `key`, or `None` if absent or expired.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.lock().fresh(key)
  }

  /// Cached payload decoded as `T`. Undecodable entries count as misses.
  pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self
      .get(key)
      .and_then(|value| serde_json::from_value(value).ok())
  }

  pub fn set(&self, key: &str, data: Value, ttl: Duration) {
    self.lock().entries.insert(
      key.to_string(),
      CacheEntry {
        key: key.to_string(),
        data,
        stored_at: Instant::now(),
        ttl,
      },
    );
  }

  /// Drop one key. A fetch in flight for it will not be stored.
  pub fn invalidate(&self, key: &str) -> bool {
    let mut state = self.lock();
    state.inflight.remove(key);
    state.entries.remove(key).is_some()
  }

  /// Drop every key starting with `prefix`. Returns the number of entries removed.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let mut state = self.lock();
    let before = state.entries.len();
    state.entries.retain(|k, _| !k.starts_with(prefix));
    state.inflight.retain(|k, _| !k.starts_with(prefix));
    before - state.entries.len()
  }

  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.inflight.clear();
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Return the cached payload for `key`, or run `fetcher` and cache its
  /// success for `ttl`.
  ///
  /// Concurrent callers for the same key share one pending fetch.
  pub async fn fetch<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> ApiResult<Value>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Value>> + Send + 'static,
  {
    let pending = {
      let mut state = self.lock();

      if let Some(data) = state.fresh(key) {
        debug!(key, "Cache hit");
        return Ok(data);
      }

      match state.inflight.get(key) {
        Some((_, pending)) => {
          debug!(key, "Joining in-flight request");
          pending.clone()
        }
        None => {
          debug!(key, "Cache miss");
          let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
          let cache = self.clone();
          let owned_key = key.to_string();
          let request = fetcher();

          let pending = async move {
            let result = request.await;
            cache.complete(&owned_key, id, ttl, &result);
            result
          }
          .boxed()
          .shared();

          state
            .inflight
            .insert(key.to_string(), (id, pending.clone()));
          pending
        }
      }
    };

    pending.await
  }

  fn complete(&self, key: &str, id: u64, ttl: Duration, result: &ApiResult<Value>) {
    let mut state = self.lock();

    let still_current = matches!(state.inflight.get(key), Some((pending_id, _)) if *pending_id == id);
    if !still_current {
      debug!(key, "Discarding response invalidated while in flight");
      return;
    }
    state.inflight.remove(key);

    if let Ok(data) = result {
      state.entries.insert(
        key.to_string(),
        CacheEntry {
          key: key.to_string(),
          data: data.clone(),
          stored_at: Instant::now(),
          ttl,
        },
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::error::ApiError;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test(start_paused = true)]
  async fn test_ttl_expiry_is_exact_at_boundary() {
    let cache = ResponseCache::new();
    cache.set("members:a", json!([1, 2]), Duration::from_secs(60));

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(cache.get("members:a"), Some(json!([1, 2])));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get("members:a"), None);
    // Stays expired
    assert_eq!(cache.get("members:a"), None);
  }

  #[test]
  fn test_miss_never_errors() {
    let cache = ResponseCache::new();
    assert_eq!(cache.get("nothing"), None);
    assert_eq!(cache.get_as::<Vec<u32>>("nothing"), None);
  }

  #[test]
  fn test_prefix_invalidation_spares_other_families() {
    let cache = ResponseCache::new();
    let ttl = Duration::from_secs(300);
    cache.set("members:1", json!(1), ttl);
    cache.set("members:2", json!(2), ttl);
    cache.set("events:1", json!(3), ttl);

    assert_eq!(cache.invalidate_prefix("members:"), 2);
    assert_eq!(cache.get("members:1"), None);
    assert_eq!(cache.get("events:1"), Some(json!(3)));
  }

  #[tokio::test]
  async fn test_concurrent_fetches_are_deduplicated() {
    let cache = ResponseCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = || {
      let calls = calls.clone();
      cache.fetch("events:x", Duration::from_secs(60), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!({"count": 42}))
      })
    };

    let results = futures::future::join_all((0..5).map(|_| fetch())).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
      assert_eq!(result.unwrap(), json!({"count": 42}));
    }

    // Now cached
    fetch().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_fetch_is_not_cached() {
    let cache = ResponseCache::new();
    let result = cache
      .fetch("members:x", Duration::from_secs(60), || async {
        Err(ApiError::network("offline"))
      })
      .await;
    assert!(result.is_err());
    assert!(cache.is_empty());

    let value = cache
      .fetch("members:x", Duration::from_secs(60), || async { Ok(json!(7)) })
      .await
      .unwrap();
    assert_eq!(value, json!(7));
  }

  #[tokio::test]
  async fn test_invalidation_during_flight_prevents_store() {
    let cache = ResponseCache::new();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let pending = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .fetch("members:x", Duration::from_secs(60), || async move {
            let _ = release_rx.await;
            Ok(json!("old"))
          })
          .await
      })
    };

    tokio::task::yield_now().await;
    cache.invalidate_prefix("members:");
    release_tx.send(()).unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), json!("old"));
    assert_eq!(cache.get("members:x"), None);
  }
}
