//! Retry bookkeeping for the response interceptor.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::RetryConfig;

/// Per-request retry state. Each transition returns a new value; the request
/// itself is never flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
  /// Retries already performed for 429 / network failures
  pub attempt: u32,
  pub max_attempts: u32,
  /// A token refresh has already been spent on this request
  pub refreshed: bool,
  /// The single 502/503/504 retry has been used
  pub server_retried: bool,
}

impl RetryState {
  pub fn new(max_attempts: u32) -> Self {
    Self {
      attempt: 0,
      max_attempts,
      refreshed: false,
      server_retried: false,
    }
  }

  pub fn can_retry(&self) -> bool {
    self.attempt < self.max_attempts
  }

  /// State after one more backoff retry.
  pub fn next_attempt(self) -> Self {
    Self {
      attempt: self.attempt + 1,
      ..self
    }
  }

  pub fn after_refresh(self) -> Self {
    Self {
      refreshed: true,
      ..self
    }
  }

  pub fn after_server_retry(self) -> Self {
    Self {
      server_retried: true,
      ..self
    }
  }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub rate_limit_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&RetryConfig::default())
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      max_attempts: config.max_attempts,
      base_delay: Duration::from_millis(config.base_delay_ms),
      rate_limit_delay: Duration::from_millis(config.rate_limit_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
    }
  }
}

impl RetryPolicy {
  pub fn initial_state(&self) -> RetryState {
    RetryState::new(self.max_attempts)
  }

  /// `unit * attempt number`, never above `max_delay`.
  fn scaled(&self, unit: Duration, state: RetryState) -> Duration {
    unit
      .min(self.max_delay)
      .checked_mul(state.attempt + 1)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Linear backoff for network failures: `base_delay * attempt number`.
  pub fn network_delay(&self, state: RetryState) -> Duration {
    self.scaled(self.base_delay, state)
  }

  /// Delay for a 429: the server's hint (or the default), scaled by attempt
  /// number and capped at `max_delay`.
  pub fn rate_limit_delay(&self, retry_after: Option<Duration>, state: RetryState) -> Duration {
    self.scaled(retry_after.unwrap_or(self.rate_limit_delay), state)
  }

  /// Delay before the single 5xx retry.
  pub fn server_delay(&self) -> Duration {
    self.base_delay
  }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
  let value = value.trim();
  if let Ok(secs) = value.parse::<u64>() {
    return Some(Duration::from_secs(secs));
  }

  let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
  Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
