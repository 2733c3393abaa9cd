//! Fan-out engine shared by the aggregating hooks.
//!
//! A run issues every permitted constituent at once and merges each success
//! into the published state as soon as it settles. Failures are recorded per
//! constituent; the run as a whole only errors when nothing succeeded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{with_cancel, ApiResult};
use crate::auth::{AuthManager, Permission};
use crate::cache::{family_prefix, ResponseCache};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstituentError {
  pub source: String,
  pub message: String,
}

/// View-state published by a hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult<D> {
  pub data: D,
  /// Visible loading indicator (initial and manual loads)
  pub loading: bool,
  /// Background refresh in progress
  pub refreshing: bool,
  /// Set only when no constituent succeeded and at least one failed
  pub error: Option<String>,
  pub errors: Vec<ConstituentError>,
  pub last_updated: Option<DateTime<Utc>>,
}

impl<D: Default> Default for AggregatedResult<D> {
  fn default() -> Self {
    Self {
      data: D::default(),
      loading: false,
      refreshing: false,
      error: None,
      errors: Vec::new(),
      last_updated: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
  /// First load, shows `loading`
  Initial,
  /// Silent refresh, shows `refreshing` only
  Background,
  /// User-requested: drops cached reads first, shows `loading`
  Manual,
}

type Apply<'a, D> = Box<dyn FnOnce(&mut D) + Send + 'a>;

/// One request of a fan-out together with the rule merging its payload.
pub struct Constituent<'a, D> {
  name: &'static str,
  permission: Option<Permission>,
  fetch: BoxFuture<'a, ApiResult<Apply<'a, D>>>,
}

impl<'a, D: 'a> Constituent<'a, D> {
  /// `fetch` is not polled until the run issues it, so dropping a
  /// constituent never sends anything.
  pub fn new<T, Fut, M>(
    name: &'static str,
    permission: Option<Permission>,
    fetch: Fut,
    merge: M,
  ) -> Self
  where
    T: Send + 'a,
    Fut: Future<Output = ApiResult<T>> + Send + 'a,
    M: FnOnce(&mut D, T) + Send + 'a,
  {
    let fetch = async move {
      let value = fetch.await?;
      Ok(Box::new(move |data: &mut D| merge(data, value)) as Apply<'a, D>)
    }
    .boxed();

    Self {
      name,
      permission,
      fetch,
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }
}

/// Publishes an `AggregatedResult<D>` and runs fan-outs into it.
pub struct AggregateHook<D> {
  auth: AuthManager,
  cache: ResponseCache,
  state: watch::Sender<AggregatedResult<D>>,
  generation: AtomicU64,
  current: Mutex<CancellationToken>,
}

impl<D> AggregateHook<D>
where
  D: Clone + Default + Send + Sync + 'static,
{
  pub fn new(auth: AuthManager, cache: ResponseCache) -> Self {
    let (state, _) = watch::channel(AggregatedResult::default());
    Self {
      auth,
      cache,
      state,
      generation: AtomicU64::new(0),
      current: Mutex::new(CancellationToken::new()),
    }
  }

  pub fn state(&self) -> AggregatedResult<D> {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<AggregatedResult<D>> {
    self.state.subscribe()
  }

  /// Replace the published data and forget earlier errors.
  pub fn reset(&self, data: D) {
    self.state.send_modify(|s| {
      s.data = data;
      s.error = None;
      s.errors.clear();
    });
  }

  /// Cancel whatever run is in flight. Its results are dropped.
  pub fn cancel(&self) {
    self.generation.fetch_add(1, Ordering::SeqCst);
    self
      .current
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .cancel();
    self.state.send_modify(|s| {
      s.loading = false;
      s.refreshing = false;
    });
  }

  /// Run one fan-out. A newer run supersedes this one: its in-flight
  /// constituents are aborted and nothing more is merged.
  pub async fn run(&self, mode: LoadMode, families: &[&str], constituents: Vec<Constituent<'_, D>>) {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let token = {
      let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
      current.cancel();
      *current = CancellationToken::new();
      current.clone()
    };

    if mode == LoadMode::Manual {
      for family in families {
        self.cache.invalidate_prefix(&family_prefix(family));
      }
    }

    self.state.send_modify(|s| match mode {
      LoadMode::Initial | LoadMode::Manual => s.loading = true,
      LoadMode::Background => s.refreshing = true,
    });

    let mut pending = constituents
      .into_iter()
      .filter(|c| match c.permission {
        Some(p) if !self.auth.has_permission(p) => {
          debug!(constituent = c.name, permission = %p, "Skipping constituent");
          false
        }
        _ => true,
      })
      .map(|c| {
        let token = token.clone();
        async move {
          let result = with_cancel(Some(&token), c.fetch).await.and_then(|r| r);
          (c.name, result)
        }
      })
      .collect::<FuturesUnordered<_>>();

    let mut succeeded = 0usize;
    let mut errors = Vec::new();

    while let Some((name, result)) = pending.next().await {
      if !self.is_current(generation) {
        debug!(generation, "Run superseded, dropping results");
        return;
      }

      match result {
        Ok(apply) => {
          succeeded += 1;
          self.state.send_modify(|s| apply(&mut s.data));
        }
        Err(e) if e.is_aborted() => debug!(constituent = name, "Constituent aborted"),
        Err(e) => {
          warn!(constituent = name, error = %e, "Constituent failed");
          errors.push(ConstituentError {
            source: name.to_string(),
            message: e.message,
          });
        }
      }
    }

    if !self.is_current(generation) {
      return;
    }

    self.state.send_modify(|s| {
      s.loading = false;
      s.refreshing = false;
      s.error = if succeeded == 0 {
        errors.first().map(|e| e.message.clone())
      } else {
        None
      };
      s.errors = errors;
      if succeeded > 0 {
        s.last_updated = Some(Utc::now());
      }
    });
  }

  fn is_current(&self, generation: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == generation
  }
}

/// Something a periodic task can reload.
#[async_trait]
pub trait Refreshable: Send + Sync + 'static {
  async fn reload(&self, mode: LoadMode);
}

/// Periodic background refresh. Stops when dropped or when the target is gone.
pub struct AutoRefresh {
  handle: JoinHandle<()>,
}

impl AutoRefresh {
  pub fn spawn<R: Refreshable>(target: &Arc<R>, period: Duration) -> Self {
    let target = Arc::downgrade(target);
    let handle = tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let Some(target) = target.upgrade() else {
          break;
        };
        target.reload(LoadMode::Background).await;
      }
    });
    Self { handle }
  }
}

impl Drop for AutoRefresh {
  fn drop(&mut self) {
    self.handle.abort();
  }
}
