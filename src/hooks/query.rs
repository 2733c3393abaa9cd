//! Single-request query state machine.
//!
//! A `Query<T>` owns one fetcher and tracks its latest outcome. Starting a new
//! fetch while one is in flight cancels the older one and drops whatever it
//! produces, so only the newest request can ever reach the state.
//!
//! ```ignore
//! let api = api.clone();
//! let mut query = Query::new(move |cancel| {
//!   let api = api.clone();
//!   async move { with_cancel(Some(&cancel), api.get_members(&filter)).await? }
//! });
//!
//! query.fetch();
//! query.settle().await;
//! ```

use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, ApiResult};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  Idle,
  Loading,
  Success(T),
  Error(ApiError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type FetcherFn<T> = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, ApiResult<T>> + Send + Sync>;

struct InFlight<T> {
  cancel: CancellationToken,
  receiver: oneshot::Receiver<ApiResult<T>>,
}

pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  in_flight: Option<InFlight<T>>,
  fetched_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Send + 'static> Query<T> {
  /// The fetcher receives a token that fires when its request is superseded.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<T>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move |cancel| Box::pin(fetcher(cancel))),
      in_flight: None,
      fetched_at: None,
      stale_time: Duration::from_secs(60),
    }
  }

  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.state.error()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching unless a fetch is already running.
  pub fn fetch(&mut self) {
    if self.in_flight.is_none() {
      self.start_fetch();
    }
  }

  /// Cancel any running fetch and start a new one.
  pub fn refetch(&mut self) {
    self.cancel();
    self.start_fetch();
  }

  /// Cancel the running fetch, if any. Its result is never applied.
  pub fn cancel(&mut self) {
    if let Some(in_flight) = self.in_flight.take() {
      in_flight.cancel.cancel();
      if self.state.is_loading() {
        self.state = QueryState::Idle;
      }
    }
  }

  /// Apply a finished fetch without waiting. Returns `true` when the state
  /// changed.
  pub fn poll(&mut self) -> bool {
    let Some(in_flight) = self.in_flight.as_mut() else {
      return false;
    };

    match in_flight.receiver.try_recv() {
      Ok(result) => {
        self.apply(result);
        true
      }
      Err(oneshot::error::TryRecvError::Empty) => false,
      Err(oneshot::error::TryRecvError::Closed) => {
        self.apply(Err(ApiError::aborted()));
        true
      }
    }
  }

  /// Wait for the running fetch, if any, and apply it.
  pub async fn settle(&mut self) -> &QueryState<T> {
    if let Some(in_flight) = self.in_flight.as_mut() {
      let result = (&mut in_flight.receiver)
        .await
        .unwrap_or_else(|_| Err(ApiError::aborted()));
      self.apply(result);
    }
    &self.state
  }

  fn apply(&mut self, result: ApiResult<T>) {
    self.in_flight = None;
    match result {
      Ok(data) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(Instant::now());
      }
      // Keep the last good data when the request was abandoned
      Err(e) if e.is_aborted() => {
        if self.state.is_loading() {
          self.state = QueryState::Idle;
        }
      }
      Err(e) => self.state = QueryState::Error(e),
    }
  }

  fn start_fetch(&mut self) {
    let (tx, receiver) = oneshot::channel();
    let cancel = CancellationToken::new();
    self.in_flight = Some(InFlight {
      cancel: cancel.clone(),
      receiver,
    });
    self.state = QueryState::Loading;

    let future = (self.fetcher)(cancel);
    tokio::spawn(async move {
      // Receiver dropped means the fetch was superseded
      let _ = tx.send(future.await);
    });
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    if let Some(in_flight) = self.in_flight.take() {
      in_flight.cancel.cancel();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}
