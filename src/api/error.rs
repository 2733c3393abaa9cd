//! Normalized error shape for every request path.

use std::fmt;

/// Error taxonomy for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// Malformed input, caught client-side or rejected by the server (400/422)
  Validation,
  /// 401 after the refresh attempt was exhausted or failed
  AuthExpired,
  /// 403
  PermissionDenied,
  /// 404
  NotFound,
  /// 429 after retries were exhausted
  RateLimited,
  /// No response received (timeout, DNS, connection refused)
  TransientNetwork,
  /// 5xx, or a success response that could not be decoded
  Server,
  /// Request cancelled on purpose (unmount, superseded)
  Aborted,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::Validation => "validation",
      ErrorKind::AuthExpired => "auth_expired",
      ErrorKind::PermissionDenied => "permission_denied",
      ErrorKind::NotFound => "not_found",
      ErrorKind::RateLimited => "rate_limited",
      ErrorKind::TransientNetwork => "network",
      ErrorKind::Server => "server",
      ErrorKind::Aborted => "aborted",
    };
    f.write_str(name)
  }
}

/// The single error type surfaced by the API layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
  pub kind: ErrorKind,
  /// Human-readable message suitable for display
  pub message: String,
  /// HTTP status when a response was received
  pub status: Option<u16>,
  /// Underlying detail (server body, transport error)
  pub cause: Option<String>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      status: None,
      cause: None,
    }
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = Some(status);
    self
  }

  pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
    self.cause = Some(cause.into());
    self
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Validation, message)
  }

  pub fn aborted() -> Self {
    Self::new(ErrorKind::Aborted, "Request was cancelled")
  }

  pub fn auth_expired() -> Self {
    Self::new(ErrorKind::AuthExpired, status_message(401)).with_status(401)
  }

  pub fn permission_denied() -> Self {
    Self::new(ErrorKind::PermissionDenied, status_message(403)).with_status(403)
  }

  pub fn network(cause: impl Into<String>) -> Self {
    Self::new(
      ErrorKind::TransientNetwork,
      "Unable to reach the server. Check your connection and try again.",
    )
    .with_cause(cause)
  }

  pub fn decode(cause: impl Into<String>) -> Self {
    Self::new(ErrorKind::Server, "Received an unexpected response from the server.")
      .with_cause(cause)
  }

  /// Build an error from a non-success HTTP status and its raw body.
  pub fn from_status(status: u16, body: &str) -> Self {
    let kind = match status {
      401 => ErrorKind::AuthExpired,
      403 => ErrorKind::PermissionDenied,
      404 => ErrorKind::NotFound,
      429 => ErrorKind::RateLimited,
      500..=599 => ErrorKind::Server,
      _ => ErrorKind::Validation,
    };

    let error = Self::new(kind, status_message(status)).with_status(status);
    match server_detail(body) {
      Some(detail) => error.with_cause(detail),
      None => error,
    }
  }

  pub fn is_aborted(&self) -> bool {
    self.kind == ErrorKind::Aborted
  }

  /// Aborted requests are deliberate and never shown to the user.
  pub fn is_user_visible(&self) -> bool {
    !self.is_aborted()
  }
}

/// Fixed message table for HTTP statuses.
pub fn status_message(status: u16) -> &'static str {
  match status {
    400 | 422 => "Invalid request. Please check your input and try again.",
    401 => "Your session has expired. Please log in again.",
    403 => "You do not have permission to perform this action.",
    404 => "The requested resource was not found.",
    409 => "The request conflicts with the current state of the resource.",
    429 => "Too many requests. Please wait a moment and try again.",
    500 => "Server error. Please try again later.",
    502..=504 => "The service is temporarily unavailable. Please try again later.",
    500..=599 => "Server error. Please try again later.",
    _ => "The request could not be completed.",
  }
}

/// Pull a readable detail out of a DRF-style error body.
fn server_detail(body: &str) -> Option<String> {
  let trimmed = body.trim();
  if trimmed.is_empty() {
    return None;
  }

  match serde_json::from_str::<serde_json::Value>(trimmed) {
    Ok(serde_json::Value::Object(map)) => ["detail", "message", "error"]
      .iter()
      .find_map(|k| map.get(*k).and_then(|v| v.as_str()).map(String::from))
      .or_else(|| Some(serde_json::Value::Object(map).to_string())),
    Ok(other) => Some(other.to_string()),
    Err(_) => Some(trimmed.chars().take(200).collect()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_to_kind() {
    assert_eq!(ApiError::from_status(400, "").kind, ErrorKind::Validation);
    assert_eq!(ApiError::from_status(401, "").kind, ErrorKind::AuthExpired);
    assert_eq!(ApiError::from_status(403, "").kind, ErrorKind::PermissionDenied);
    assert_eq!(ApiError::from_status(404, "").kind, ErrorKind::NotFound);
    assert_eq!(ApiError::from_status(429, "").kind, ErrorKind::RateLimited);
    assert_eq!(ApiError::from_status(503, "").kind, ErrorKind::Server);
  }

  #[test]
  fn test_message_table() {
    assert_eq!(
      ApiError::from_status(404, "").message,
      "The requested resource was not found."
    );
    assert_eq!(status_message(502), status_message(504));
    assert_ne!(status_message(500), status_message(503));
  }

  #[test]
  fn test_detail_extracted_into_cause() {
    let err = ApiError::from_status(400, r#"{"detail": "Email already registered"}"#);
    assert_eq!(err.cause.as_deref(), Some("Email already registered"));
    assert_eq!(err.status, Some(400));

    let err = ApiError::from_status(400, r#"{"email": ["Enter a valid email address."]}"#);
    assert!(err.cause.unwrap().contains("Enter a valid email address."));

    let err = ApiError::from_status(502, "<html>Bad Gateway</html>");
    assert_eq!(err.cause.as_deref(), Some("<html>Bad Gateway</html>"));
  }

  #[test]
  fn test_aborted_is_not_user_visible() {
    assert!(!ApiError::aborted().is_user_visible());
    assert!(ApiError::network("timeout").is_user_visible());
  }
}
