//! Response interceptor: token refresh, retries and error normalization.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::{ApiError, ApiResult};
use super::retry::{parse_retry_after, RetryPolicy, RetryState};
use super::transport::{HttpResponse, RequestSpec, Transport};
use crate::auth::AuthManager;

/// API client that wraps the transport with the retry and refresh policy.
#[derive(Clone)]
pub struct ApiClient {
  transport: Transport,
  auth: AuthManager,
  policy: RetryPolicy,
}

impl ApiClient {
  pub fn new(transport: Transport, auth: AuthManager, policy: RetryPolicy) -> Self {
    Self {
      transport,
      auth,
      policy,
    }
  }

  pub fn auth(&self) -> &AuthManager {
    &self.auth
  }

  /// Send a request and return the first successful response.
  ///
  /// - 401: one refresh and one replay; a second 401 ends the session
  /// - 429 / no response: retried with backoff up to the policy's cap
  /// - 502/503/504: retried once
  /// - anything else: normalized error, no retry
  pub async fn execute(&self, spec: &RequestSpec) -> ApiResult<HttpResponse> {
    let mut state = self.policy.initial_state();

    loop {
      let token = self.auth.access_token();
      let sent = with_cancel(
        spec.cancel.as_ref(),
        self.transport.send(spec, token.as_deref()),
      )
      .await?;

      let response = match sent {
        Ok(response) => response,
        Err(e) => {
          if !state.can_retry() {
            return Err(ApiError::network(e.to_string()));
          }
          let delay = self.policy.network_delay(state);
          warn!(path = %spec.path, error = %e, attempt = state.attempt + 1, ?delay, "Network error, retrying");
          self.pause(spec, delay).await?;
          state = state.next_attempt();
          continue;
        }
      };

      if response.is_success() {
        return Ok(response);
      }

      state = match response.status {
        401 => self.handle_unauthorized(spec, token.as_deref(), state).await?,
        429 if state.can_retry() => {
          let retry_after = response
            .header("retry-after")
            .and_then(|v| parse_retry_after(v, Utc::now()));
          let delay = self.policy.rate_limit_delay(retry_after, state);
          warn!(path = %spec.path, attempt = state.attempt + 1, ?delay, "Rate limited, retrying");
          self.pause(spec, delay).await?;
          state.next_attempt()
        }
        502..=504 if !state.server_retried => {
          let delay = self.policy.server_delay();
          warn!(path = %spec.path, status = response.status, ?delay, "Upstream unavailable, retrying once");
          self.pause(spec, delay).await?;
          state.after_server_retry()
        }
        status => return Err(ApiError::from_status(status, &response.body)),
      };
    }
  }

  /// Decide what a 401 means for this request. Returns the state to replay
  /// with, or the terminal error. `sent_with` is the token the rejected
  /// attempt carried.
  async fn handle_unauthorized(
    &self,
    spec: &RequestSpec,
    sent_with: Option<&str>,
    state: RetryState,
  ) -> ApiResult<RetryState> {
    if state.refreshed || !self.auth.has_refresh_token() {
      warn!(path = %spec.path, "Unauthorized after refresh, ending session");
      self.auth.expire_session();
      return Err(ApiError::auth_expired());
    }

    // Another request already renewed the token since this one went out
    let current = self.auth.access_token();
    if current.is_some() && current.as_deref() != sent_with {
      info!(path = %spec.path, "Access token renewed meanwhile, replaying");
      return Ok(state.after_refresh());
    }

    info!(path = %spec.path, "Access token rejected, refreshing");
    let refreshed = with_cancel(spec.cancel.as_ref(), self.auth.refresh()).await?;
    if refreshed {
      Ok(state.after_refresh())
    } else {
      // refresh() already cleared the session
      Err(ApiError::auth_expired())
    }
  }

  async fn pause(&self, spec: &RequestSpec, delay: Duration) -> ApiResult<()> {
    with_cancel(spec.cancel.as_ref(), tokio::time::sleep(delay)).await
  }

  /// Send and decode the JSON body.
  pub async fn json(&self, spec: &RequestSpec) -> ApiResult<Value> {
    self.execute(spec).await?.json()
  }

  /// Send and deserialize into `T`.
  pub async fn request<T: DeserializeOwned>(&self, spec: &RequestSpec) -> ApiResult<T> {
    decode(self.json(spec).await?)
  }
}

pub fn decode<T: DeserializeOwned>(value: Value) -> ApiResult<T> {
  serde_json::from_value(value).map_err(|e| ApiError::decode(e.to_string()))
}

/// Run `fut` unless `cancel` fires first, in which case the result is
/// `ErrorKind::Aborted`.
pub async fn with_cancel<F: Future>(
  cancel: Option<&CancellationToken>,
  fut: F,
) -> ApiResult<F::Output> {
  match cancel {
    Some(token) => tokio::select! {
      biased;
      _ = token.cancelled() => Err(ApiError::aborted()),
      out = fut => Ok(out),
    },
    None => Ok(fut.await),
  }
}
