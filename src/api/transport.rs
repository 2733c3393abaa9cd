//! HTTP transport: URL building, auth header injection and request logging.
//!
//! The actual network I/O sits behind [`HttpBackend`] so the retry and refresh
//! logic above it can be exercised against scripted backends.

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::error::{ApiError, ApiResult};

/// Sentinel used when a request body cannot be represented as JSON.
pub const UNSERIALIZABLE_SENTINEL: &str = "[unserializable]";

/// Version prefix appended to the configured host.
const API_PREFIX: &str = "api/v1/";

/// A request as described by the caller. Borrowed by the transport, never mutated.
#[derive(Debug, Clone)]
pub struct RequestSpec {
  pub method: Method,
  /// Path relative to `/api/v1/`, e.g. `members/7/`
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  /// Per-call timeout, overriding the transport default
  pub timeout: Option<Duration>,
  pub cancel: Option<CancellationToken>,
}

impl RequestSpec {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      timeout: None,
      cancel: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
    self.query = query;
    self
  }

  /// Attach a JSON body. Values serde cannot represent are replaced by a
  /// sentinel string instead of failing the request.
  pub fn with_body<B: Serialize + ?Sized>(mut self, body: &B) -> Self {
    self.body = Some(to_json_body(body));
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = Some(cancel);
    self
  }
}

fn to_json_body<B: Serialize + ?Sized>(body: &B) -> Value {
  match serde_json::to_value(body) {
    Ok(value) => value,
    Err(e) => {
      warn!(error = %e, "Request body is not JSON-serializable, sending sentinel");
      Value::String(UNSERIALIZABLE_SENTINEL.to_string())
    }
  }
}

/// A fully resolved request handed to the backend.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
  pub timeout: Duration,
}

impl HttpRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response with any status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  /// Header names are lowercase
  pub headers: Vec<(String, String)>,
  pub body: String,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    let name = name.to_ascii_lowercase();
    self
      .headers
      .iter()
      .find(|(k, _)| *k == name)
      .map(|(_, v)| v.as_str())
  }

  /// Decode the body as JSON. An empty body (204) decodes as `null`.
  pub fn json(&self) -> ApiResult<Value> {
    if self.body.trim().is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_str(&self.body).map_err(|e| ApiError::decode(e.to_string()))
  }
}

/// Failures where no response was received at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("{0}")]
  Other(String),
}

/// The network seam.
#[async_trait]
pub trait HttpBackend: Send + Sync {
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production backend on top of reqwest.
pub struct ReqwestBackend {
  client: reqwest::Client,
}

impl ReqwestBackend {
  pub fn new() -> ApiResult<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("flock/", env!("CARGO_PKG_VERSION")))
      .pool_idle_timeout(Duration::from_secs(90))
      .build()
      .map_err(|e| ApiError::network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let mut builder = self
      .client
      .request(request.method, request.url)
      .timeout(request.timeout);

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    if let Some(body) = &request.body {
      let bytes = serde_json::to_vec(body).map_err(|e| TransportError::Other(e.to_string()))?;
      builder = builder.body(bytes);
    }

    let response = builder.send().await.map_err(classify_reqwest_error)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response.text().await.map_err(classify_reqwest_error)?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_connect() {
    TransportError::Connect(e.to_string())
  } else {
    TransportError::Other(e.to_string())
  }
}

/// Joins paths onto the API root and injects default and auth headers.
#[derive(Clone)]
pub struct Transport {
  backend: Arc<dyn HttpBackend>,
  api_root: Url,
  default_timeout: Duration,
}

impl Transport {
  pub fn new(
    backend: Arc<dyn HttpBackend>,
    base_url: &str,
    default_timeout: Duration,
  ) -> ApiResult<Self> {
    let api_root = api_root(base_url)?;
    Ok(Self {
      backend,
      api_root,
      default_timeout,
    })
  }

  pub fn api_root(&self) -> &Url {
    &self.api_root
  }

  /// Build the absolute URL for a relative API path.
  pub fn url(&self, path: &str, query: &[(String, String)]) -> ApiResult<Url> {
    let mut url = self
      .api_root
      .join(path.trim_start_matches('/'))
      .map_err(|e| ApiError::validation(format!("Invalid API path '{}'", path)).with_cause(e.to_string()))?;

    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
  }

  /// Send one request. Never retries; that is the interceptor's job.
  pub async fn send(
    &self,
    spec: &RequestSpec,
    token: Option<&str>,
  ) -> Result<HttpResponse, TransportError> {
    let url = self
      .url(&spec.path, &spec.query)
      .map_err(|e| TransportError::Other(e.message))?;

    let mut headers = vec![
      ("Accept".to_string(), "application/json".to_string()),
      ("Content-Type".to_string(), "application/json".to_string()),
    ];
    if let Some(token) = token {
      headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
    }

    let request = HttpRequest {
      method: spec.method.clone(),
      url,
      headers,
      body: spec.body.clone(),
      timeout: spec.timeout.unwrap_or(self.default_timeout),
    };

    let method = request.method.clone();
    let url = request.url.clone();
    let started = Instant::now();
    debug!(%method, %url, "Sending request");

    let result = self.backend.execute(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match &result {
      Ok(response) => debug!(%method, %url, status = response.status, elapsed_ms, "Received response"),
      Err(e) => warn!(%method, %url, error = %e, elapsed_ms, "No response received"),
    }

    result
  }
}

fn api_root(base_url: &str) -> ApiResult<Url> {
  let mut base = base_url.trim().trim_end_matches('/').to_string();
  base.push('/');

  Url::parse(&base)
    .and_then(|u| u.join(API_PREFIX))
    .map_err(|e| ApiError::validation(format!("Invalid API base URL '{}'", base_url)).with_cause(e.to_string()))
}


#[cfg(test)]
mod tests {
  use super::testing::ScriptedBackend;
  use super::*;
  use serde_json::json;

  fn transport(backend: Arc<ScriptedBackend>) -> Transport {
    Transport::new(backend, "http://localhost:8000/", Duration::from_secs(15)).unwrap()
  }

  #[test]
  fn test_url_joins_api_prefix() {
    let t = transport(ScriptedBackend::new());
    assert_eq!(
      t.url("/members/7/", &[]).unwrap().as_str(),
      "http://localhost:8000/api/v1/members/7/"
    );
    assert_eq!(
      t.url("events/", &[("status".into(), "published".into())])
        .unwrap()
        .as_str(),
      "http://localhost:8000/api/v1/events/?status=published"
    );
  }

  #[test]
  fn test_base_url_with_path_prefix() {
    let t = Transport::new(
      ScriptedBackend::new(),
      "https://example.org/church",
      Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(
      t.url("members/", &[]).unwrap().as_str(),
      "https://example.org/church/api/v1/members/"
    );
  }

  #[tokio::test]
  async fn test_bearer_token_attached_only_when_present() {
    let backend = ScriptedBackend::new();
    backend.ok("GET members/", json!([]));
    let t = transport(backend.clone());

    t.send(&RequestSpec::get("members/"), Some("tok-1"))
      .await
      .unwrap();
    t.send(&RequestSpec::get("members/"), None).await.unwrap();

    let requests = backend.requests();
    assert_eq!(requests[0].header("authorization"), Some("Bearer tok-1"));
    assert_eq!(requests[1].header("authorization"), None);
    assert_eq!(requests[0].timeout, Duration::from_secs(15));
  }

  #[test]
  fn test_body_is_copied_not_mutated() {
    let original = json!({"first_name": "Ruth", "tags": ["choir"]});
    let spec = RequestSpec::post("members/").with_body(&original);
    assert_eq!(spec.body.as_ref(), Some(&original));
    assert_eq!(original["first_name"], "Ruth");
  }

  #[test]
  fn test_unserializable_body_becomes_sentinel() {
    use std::collections::HashMap;
    // JSON object keys must be strings
    let mut weird: HashMap<(u8, u8), u8> = HashMap::new();
    weird.insert((1, 2), 3);

    let spec = RequestSpec::post("members/").with_body(&weird);
    assert_eq!(spec.body, Some(Value::String(UNSERIALIZABLE_SENTINEL.into())));
  }

  #[test]
  fn test_empty_body_decodes_as_null() {
    assert_eq!(HttpResponse::new(204, "").json().unwrap(), Value::Null);
    assert!(HttpResponse::new(200, "{not json").json().is_err());
  }
}
