//! Local response cache for the API layer.
//!
//! This module provides:
//! - Deterministic cache keys derived from (endpoint, parameters)
//! - TTL expiry, checked on every read
//! - Family-prefix invalidation after writes
//! - Deduplication of concurrent identical requests

mod key;
mod layer;

pub use key::{family_prefix, RequestDescriptor};
pub use layer::{CacheEntry, ResponseCache};
