//! Request descriptors and their cache keys.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::api::transport::RequestSpec;
use crate::auth::Permission;

/// Describes one read against the backend: where, with which parameters, and
/// which permission the caller needs for the call to be issued at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
  pub endpoint: String,
  pub params: BTreeMap<String, String>,
  pub required_permission: Option<Permission>,
}

impl RequestDescriptor {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      params: BTreeMap::new(),
      required_permission: None,
    }
  }

  pub fn param(mut self, key: &str, value: impl ToString) -> Self {
    self.params.insert(key.to_string(), value.to_string());
    self
  }

  pub fn param_opt<V: ToString>(self, key: &str, value: Option<V>) -> Self {
    match value {
      Some(v) => self.param(key, v),
      None => self,
    }
  }

  pub fn requires(mut self, permission: Permission) -> Self {
    self.required_permission = Some(permission);
    self
  }

  /// Resource family: the first path segment (`members/7/` -> `members`).
  pub fn family(&self) -> &str {
    self
      .endpoint
      .trim_start_matches('/')
      .split('/')
      .next()
      .unwrap_or_default()
  }

  /// Deterministic key: `<family>:<sha256 of endpoint and sorted params>`.
  ///
  /// Parameter order never matters since params live in a BTreeMap.
  pub fn cache_key(&self) -> String {
    let endpoint = normalize_endpoint(&self.endpoint);
    let params = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    let input = format!("{}?{}", endpoint, params);

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{}:{}", self.family(), hex::encode(hasher.finalize()))
  }

  /// The GET request this descriptor stands for.
  pub fn to_request(&self) -> RequestSpec {
    let query = self
      .params
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    RequestSpec::get(normalize_endpoint(&self.endpoint)).with_query(query)
  }
}

/// Key prefix shared by every entry of a resource family.
pub fn family_prefix(family: &str) -> String {
  format!("{}:", family.trim_matches('/'))
}

/// Endpoints are written with a trailing slash and no leading one.
fn normalize_endpoint(endpoint: &str) -> String {
  let trimmed = endpoint.trim().trim_matches('/');
  format!("{}/", trimmed)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_param_order_does_not_matter() {
    let a = RequestDescriptor::new("events/")
      .param("status", "published")
      .param("is_public", true);
    let b = RequestDescriptor::new("events/")
      .param("is_public", true)
      .param("status", "published");
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_different_params_different_keys() {
    let a = RequestDescriptor::new("members/").param("page", 1);
    let b = RequestDescriptor::new("members/").param("page", 2);
    assert_ne!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_key_prefixed_by_family() {
    let key = RequestDescriptor::new("/members/statistics/").cache_key();
    assert!(key.starts_with(&family_prefix("members")));
    assert_eq!(key.len(), "members:".len() + 64);
  }

  #[test]
  fn test_slashes_normalized() {
    let a = RequestDescriptor::new("/members/7");
    let b = RequestDescriptor::new("members/7/");
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.to_request().path, "members/7/");
  }

  #[test]
  fn test_to_request_carries_params() {
    let spec = RequestDescriptor::new("members/")
      .param("search", "ruth")
      .param_opt::<u32>("page", None)
      .to_request();
    assert_eq!(spec.query, vec![("search".to_string(), "ruth".to_string())]);
  }
}
