//! Session state: tokens, the signed-in user, refresh and logout.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::permissions::{Permission, Role};
use super::token;
use crate::api::error::ApiError;
use crate::api::transport::{HttpResponse, RequestSpec, Transport};
use crate::api::types::User;
use crate::cache::ResponseCache;
use crate::config::AuthConfig;
use crate::storage::{keys, KeyValueStore};

/// Tokens and user of the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub user: User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
  pub user: User,
  pub token: String,
}

/// Session changes, broadcast to whoever renders the login surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
  LoggedIn,
  Refreshed,
  LoggedOut,
  /// The session ended involuntarily; the user must log in again
  LoginRequired,
}

#[derive(Deserialize)]
struct LoginResponse {
  access: String,
  #[serde(default)]
  refresh: Option<String>,
  user: User,
}

#[derive(Deserialize)]
struct RefreshResponse {
  access: String,
  /// Present when the backend rotates refresh tokens
  #[serde(default)]
  refresh: Option<String>,
}

type SharedRefresh = Shared<BoxFuture<'static, bool>>;

struct AuthInner {
  transport: Transport,
  store: Arc<dyn KeyValueStore>,
  cache: ResponseCache,
  config: AuthConfig,
  credentials: RwLock<Option<Credentials>>,
  refreshing: Mutex<Option<SharedRefresh>>,
  events: broadcast::Sender<SessionEvent>,
}

/// Holds the session and keeps it in sync with durable storage.
#[derive(Clone)]
pub struct AuthManager {
  inner: Arc<AuthInner>,
}

impl AuthManager {
  /// Create the manager, rehydrating any session persisted by a previous run.
  pub fn new(
    transport: Transport,
    store: Arc<dyn KeyValueStore>,
    cache: ResponseCache,
    config: AuthConfig,
  ) -> Self {
    let credentials = restore(store.as_ref());
    if let Some(c) = &credentials {
      debug!(user = %c.user.email, "Restored persisted session");
    }

    let (events, _) = broadcast::channel(16);
    Self {
      inner: Arc::new(AuthInner {
        transport,
        store,
        cache,
        config,
        credentials: RwLock::new(credentials),
        refreshing: Mutex::new(None),
        events,
      }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.inner.events.subscribe()
  }

  fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Credentials>> {
    self
      .inner
      .credentials
      .read()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credentials>> {
    self
      .inner
      .credentials
      .write()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn refresh_slot(&self) -> MutexGuard<'_, Option<SharedRefresh>> {
    self
      .inner
      .refreshing
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  // --------------------------------------------------------------------------
  // Predicates
  // --------------------------------------------------------------------------

  pub fn is_authenticated(&self) -> bool {
    self.read().is_some()
  }

  pub fn has_permission(&self, permission: Permission) -> bool {
    self
      .read()
      .as_ref()
      .map(|c| c.user.role.has(permission))
      .unwrap_or(false)
  }

  pub fn has_role(&self, role: Role) -> bool {
    self
      .read()
      .as_ref()
      .map(|c| c.user.role == role)
      .unwrap_or(false)
  }

  pub fn user(&self) -> Option<User> {
    self.read().as_ref().map(|c| c.user.clone())
  }

  pub fn access_token(&self) -> Option<String> {
    self.read().as_ref().map(|c| c.access_token.clone())
  }

  pub fn has_refresh_token(&self) -> bool {
    self
      .read()
      .as_ref()
      .map(|c| c.refresh_token.is_some())
      .unwrap_or(false)
  }

  pub fn credentials(&self) -> Option<Credentials> {
    self.read().clone()
  }

  /// Whether the access token expires inside the refresh window.
  pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
    let window = chrono::Duration::seconds(self.inner.config.refresh_window_secs as i64);
    self
      .access_token()
      .map(|t| token::expires_within(&t, window, now))
      .unwrap_or(false)
  }

  // --------------------------------------------------------------------------
  // Login / logout
  // --------------------------------------------------------------------------

  /// Validate, authenticate and persist a new session.
  ///
  /// Failures come back as display-ready messages.
  pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, String> {
    validate_login(email, password, self.inner.config.min_password_length)?;

    let spec = RequestSpec::post("auth/login/").with_body(&json!({
      "email": email.trim(),
      "password": password,
    }));

    let response = self
      .inner
      .transport
      .send(&spec, None)
      .await
      .map_err(|e| ApiError::network(e.to_string()).message)?;

    if !response.is_success() {
      return Err(login_failure_message(&response));
    }

    let body: LoginResponse = serde_json::from_str(&response.body)
      .map_err(|e| ApiError::decode(e.to_string()).message)?;

    let credentials = Credentials {
      access_token: body.access.clone(),
      refresh_token: body.refresh,
      user: body.user.clone(),
    };
    self.persist(&credentials);
    *self.write() = Some(credentials);

    info!(user = %body.user.email, role = %body.user.role, "Logged in");
    let _ = self.inner.events.send(SessionEvent::LoggedIn);

    Ok(LoginOutcome {
      user: body.user,
      token: body.access,
    })
  }

  /// Tell the server (best effort) and drop the session locally no matter what.
  pub async fn logout(&self) {
    let credentials = self.credentials();

    if let Some(Credentials {
      access_token,
      refresh_token: Some(refresh),
      ..
    }) = credentials
    {
      let spec = RequestSpec::post("auth/logout/").with_body(&json!({ "refresh": refresh }));
      match self.inner.transport.send(&spec, Some(&access_token)).await {
        Ok(r) if r.is_success() => debug!("Server acknowledged logout"),
        Ok(r) => warn!(status = r.status, "Server rejected logout, clearing locally"),
        Err(e) => warn!(error = %e, "Logout request failed, clearing locally"),
      }
    }

    self.clear_session(SessionEvent::LoggedOut);
  }

  /// End the session because the server no longer accepts it.
  pub fn expire_session(&self) {
    self.clear_session(SessionEvent::LoginRequired);
  }

  fn clear_session(&self, event: SessionEvent) {
    *self.write() = None;

    for key in [keys::ACCESS_TOKEN, keys::REFRESH_TOKEN, keys::USER] {
      if let Err(e) = self.inner.store.remove(key) {
        warn!(key, error = %e, "Failed to remove persisted credential");
      }
    }
    self.inner.cache.clear();

    info!(?event, "Session cleared");
    let _ = self.inner.events.send(event);
  }

  fn persist(&self, credentials: &Credentials) {
    let store = &self.inner.store;
    let user = match serde_json::to_string(&credentials.user) {
      Ok(u) => u,
      Err(e) => {
        warn!(error = %e, "Failed to serialize user");
        return;
      }
    };

    let mut result = store
      .set(keys::ACCESS_TOKEN, &credentials.access_token)
      .and_then(|_| store.set(keys::USER, &user));
    result = result.and_then(|_| match &credentials.refresh_token {
      Some(refresh) => store.set(keys::REFRESH_TOKEN, refresh),
      None => store.remove(keys::REFRESH_TOKEN),
    });

    if let Err(e) = result {
      warn!(error = %e, "Failed to persist credentials; session will not survive a restart");
    }
  }

  // --------------------------------------------------------------------------
  // Refresh
  // --------------------------------------------------------------------------

  /// Exchange the refresh token for a new access token.
  ///
  /// Concurrent callers share one attempt. `false` means the session has
  /// ended and the user was logged out.
  pub async fn refresh(&self) -> bool {
    let pending = {
      let mut slot = self.refresh_slot();
      match slot.as_ref() {
        Some(pending) => {
          debug!("Joining in-flight token refresh");
          pending.clone()
        }
        None => {
          let this = self.clone();
          let pending = async move {
            let refreshed = this.perform_refresh().await;
            this.refresh_slot().take();
            refreshed
          }
          .boxed()
          .shared();
          *slot = Some(pending.clone());
          pending
        }
      }
    };

    pending.await
  }

  async fn perform_refresh(&self) -> bool {
    let refresh_token = match self.credentials().and_then(|c| c.refresh_token) {
      Some(t) => t,
      None => {
        warn!("No refresh token available");
        self.expire_session();
        return false;
      }
    };

    let spec = RequestSpec::post("auth/token/refresh/").with_body(&json!({ "refresh": refresh_token }));
    let renewed = match self.inner.transport.send(&spec, None).await {
      Ok(r) if r.is_success() => serde_json::from_str::<RefreshResponse>(&r.body)
        .map_err(|e| warn!(error = %e, "Malformed refresh response"))
        .ok(),
      Ok(r) => {
        warn!(status = r.status, "Token refresh rejected");
        None
      }
      Err(e) => {
        warn!(error = %e, "Token refresh failed");
        None
      }
    };

    let Some(renewed) = renewed else {
      self.expire_session();
      return false;
    };

    let updated = {
      let mut guard = self.write();
      match guard.as_mut() {
        Some(c) => {
          c.access_token = renewed.access;
          if let Some(rotated) = renewed.refresh {
            c.refresh_token = Some(rotated);
          }
          Some(c.clone())
        }
        // Logged out while the refresh was in flight
        None => None,
      }
    };

    match updated {
      Some(credentials) => {
        self.persist(&credentials);
        info!("Access token refreshed");
        let _ = self.inner.events.send(SessionEvent::Refreshed);
        true
      }
      None => false,
    }
  }

  /// Periodically refresh ahead of expiry. Advisory: the interceptor still
  /// handles any 401 that slips through.
  pub fn spawn_refresh_monitor(&self, interval: Duration) -> JoinHandle<()> {
    let this = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if this.is_authenticated() && this.needs_refresh(Utc::now()) {
          debug!("Access token close to expiry, refreshing proactively");
          this.refresh().await;
        }
      }
    })
  }
}

fn restore(store: &dyn KeyValueStore) -> Option<Credentials> {
  let read = |key: &str| match store.get(key) {
    Ok(v) => v,
    Err(e) => {
      warn!(key, error = %e, "Failed to read persisted credential");
      None
    }
  };

  let access_token = read(keys::ACCESS_TOKEN)?;
  let user = read(keys::USER)?;
  let user: User = match serde_json::from_str(&user) {
    Ok(u) => u,
    Err(e) => {
      warn!(error = %e, "Discarding unreadable persisted user");
      return None;
    }
  };

  Some(Credentials {
    access_token,
    refresh_token: read(keys::REFRESH_TOKEN),
    user,
  })
}

/// Client-side checks before any credentials leave the machine.
pub fn validate_login(email: &str, password: &str, min_password_length: usize) -> Result<(), String> {
  let email = email.trim();
  if email.is_empty() {
    return Err("Email is required.".to_string());
  }
  if !is_valid_email(email) {
    return Err("Enter a valid email address.".to_string());
  }
  if password.is_empty() {
    return Err("Password is required.".to_string());
  }
  if password.chars().count() < min_password_length {
    return Err(format!(
      "Password must be at least {} characters.",
      min_password_length
    ));
  }
  Ok(())
}

/// Loose structural check: one `@`, non-empty local part, dotted domain.
pub fn is_valid_email(email: &str) -> bool {
  let Some((local, domain)) = email.split_once('@') else {
    return false;
  };
  !local.is_empty()
    && !domain.contains('@')
    && !email.chars().any(char::is_whitespace)
    && domain.split('.').count() >= 2
    && domain.split('.').all(|part| !part.is_empty())
}

fn login_failure_message(response: &HttpResponse) -> String {
  match response.status {
    400 | 401 => "Invalid email or password.".to_string(),
    status => ApiError::from_status(status, &response.body).message,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::transport::testing::ScriptedBackend;
  use crate::api::transport::TransportError;
  use crate::storage::MemoryStore;

  fn user_json() -> serde_json::Value {
    json!({"id": 3, "email": "admin@church.org", "first_name": "Esther", "role": "admin"})
  }

  fn manager(backend: Arc<ScriptedBackend>, store: Arc<MemoryStore>) -> AuthManager {
    let transport = Transport::new(backend, "http://localhost:8000", Duration::from_secs(5)).unwrap();
    AuthManager::new(transport, store, ResponseCache::new(), AuthConfig::default())
  }

  async fn logged_in(backend: &Arc<ScriptedBackend>, store: &Arc<MemoryStore>) -> AuthManager {
    backend.ok(
      "POST auth/login/",
      json!({"access": "access-1", "refresh": "refresh-1", "user": user_json()}),
    );
    let auth = manager(backend.clone(), store.clone());
    auth.login("admin@church.org", "correct horse").await.unwrap();
    auth
  }

  #[test]
  fn test_login_validation() {
    assert!(validate_login("", "longenough", 8).is_err());
    assert!(validate_login("not-an-email", "longenough", 8).is_err());
    assert!(validate_login("a@b", "longenough", 8).is_err());
    assert_eq!(
      validate_login("a@b.org", "short", 8).unwrap_err(),
      "Password must be at least 8 characters."
    );
    assert!(validate_login(" a@b.org ", "longenough", 8).is_ok());
  }

  #[tokio::test]
  async fn test_invalid_input_never_hits_network() {
    let backend = ScriptedBackend::new();
    let auth = manager(backend.clone(), Arc::new(MemoryStore::new()));

    let err = auth.login("nope", "longenough").await.unwrap_err();
    assert_eq!(err, "Enter a valid email address.");
    assert!(backend.requests().is_empty());
  }

  #[tokio::test]
  async fn test_login_rejected_returns_message() {
    let backend = ScriptedBackend::new();
    backend.status("POST auth/login/", 401);
    let auth = manager(backend, Arc::new(MemoryStore::new()));

    let err = auth.login("a@b.org", "longenough").await.unwrap_err();
    assert_eq!(err, "Invalid email or password.");
    assert!(!auth.is_authenticated());
  }

  #[tokio::test]
  async fn test_credentials_survive_reload() {
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryStore::new());
    let auth = logged_in(&backend, &store).await;

    // A fresh manager over the same store sees the same session
    let reloaded = manager(backend, store);
    assert_eq!(reloaded.credentials(), auth.credentials());
    assert_eq!(reloaded.access_token().as_deref(), Some("access-1"));
    assert_eq!(reloaded.user().unwrap().first_name, "Esther");
    assert!(reloaded.has_role(Role::Admin));
    assert!(reloaded.has_permission(Permission::ImportMembers));
    assert!(!reloaded.has_permission(Permission::ManageUsers));
  }

  #[tokio::test]
  async fn test_logout_clears_even_when_server_fails() {
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryStore::new());
    let auth = logged_in(&backend, &store).await;
    backend.on(
      "POST auth/logout/",
      Err(TransportError::Connect("refused".into())),
    );
    let mut events = auth.subscribe();

    auth.logout().await;

    assert!(!auth.is_authenticated());
    assert_eq!(store.get(keys::ACCESS_TOKEN).unwrap(), None);
    assert_eq!(store.get(keys::USER).unwrap(), None);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
  }

  #[tokio::test]
  async fn test_logout_clears_cache() {
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryStore::new());
    let cache = ResponseCache::new();
    backend.ok(
      "POST auth/login/",
      json!({"access": "a", "refresh": "r", "user": user_json()}),
    );
    let transport = Transport::new(backend, "http://localhost:8000", Duration::from_secs(5)).unwrap();
    let auth = AuthManager::new(transport, store, cache.clone(), AuthConfig::default());
    auth.login("admin@church.org", "correct horse").await.unwrap();

    cache.set("members:1", json!([]), Duration::from_secs(60));
    auth.logout().await;
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_attempt() {
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryStore::new());
    let auth = logged_in(&backend, &store).await;
    backend
      .ok("POST auth/token/refresh/", json!({"access": "access-2"}))
      .with_delay(Duration::from_millis(20));

    let (a, b, c) = tokio::join!(auth.refresh(), auth.refresh(), auth.refresh());
    assert!(a && b && c);
    assert_eq!(backend.count("POST auth/token/refresh/"), 1);
    assert_eq!(auth.access_token().as_deref(), Some("access-2"));
    assert_eq!(store.get(keys::ACCESS_TOKEN).unwrap().as_deref(), Some("access-2"));
    // Refresh token was not rotated
    assert_eq!(store.get(keys::REFRESH_TOKEN).unwrap().as_deref(), Some("refresh-1"));
  }

  #[tokio::test]
  async fn test_failed_refresh_forces_logout() {
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryStore::new());
    let auth = logged_in(&backend, &store).await;
    backend.status("POST auth/token/refresh/", 401);
    let mut events = auth.subscribe();

    assert!(!auth.refresh().await);
    assert!(!auth.is_authenticated());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::LoginRequired);
  }

  #[tokio::test]
  async fn test_needs_refresh_uses_token_expiry() {
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let expiring = token::make_token((now + chrono::Duration::minutes(2)).timestamp());
    backend.ok(
      "POST auth/login/",
      json!({"access": expiring, "refresh": "r", "user": user_json()}),
    );
    let auth = manager(backend, store);
    auth.login("admin@church.org", "correct horse").await.unwrap();

    assert!(auth.needs_refresh(now));
    assert!(!auth.needs_refresh(now - chrono::Duration::hours(1)));
  }
}
