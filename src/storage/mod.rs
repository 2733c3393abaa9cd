//! Durable client-side key–value storage.
//!
//! Holds the session tokens, the serialized user and the last good snapshot of
//! the public events feed. Values are plain strings (JSON where structured).

mod memory;
mod sqlite;

use color_eyre::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Stable storage keys.
pub mod keys {
  pub const ACCESS_TOKEN: &str = "access_token";
  pub const REFRESH_TOKEN: &str = "refresh_token";
  pub const USER: &str = "user";
  pub const PUBLIC_EVENTS_SNAPSHOT: &str = "public_events_snapshot";
}

/// Trait for durable key–value backends.
pub trait KeyValueStore: Send + Sync {
  /// Read a value, `None` if the key was never written or has been removed.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Write (or overwrite) a value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove a value. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;
}
