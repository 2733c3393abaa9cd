use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `api.base_url`.
pub const API_URL_ENV: &str = "FLOCK_API_URL";

/// Backend used when neither the config file nor the environment names one.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub dashboard: DashboardConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
  #[serde(default)]
  pub import: ImportConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Backend host, without the `/api/v1` prefix
  pub base_url: String,
  /// Timeout for ordinary requests
  pub timeout_secs: u64,
  /// Timeout for statistics and report endpoints
  pub heavy_timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_API_URL.to_string(),
      timeout_secs: 15,
      heavy_timeout_secs: 30,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn heavy_timeout(&self) -> Duration {
    Duration::from_secs(self.heavy_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Maximum number of retries for rate-limited and network failures
  pub max_attempts: u32,
  /// Backoff unit, multiplied by the attempt number
  pub base_delay_ms: u64,
  /// Delay used for 429 responses without a Retry-After header
  pub rate_limit_delay_ms: u64,
  /// Upper bound for any single backoff, including server Retry-After hints
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 1000,
      rate_limit_delay_ms: 1000,
      max_delay_ms: 60_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub list_ttl_secs: u64,
  pub statistics_ttl_secs: u64,
  pub recent_ttl_secs: u64,
  pub reference_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      list_ttl_secs: 5 * 60,
      statistics_ttl_secs: 2 * 60,
      recent_ttl_secs: 60,
      reference_ttl_secs: 10 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
  /// How often the proactive refresh monitor inspects the access token
  pub refresh_check_secs: u64,
  /// Refresh when the access token expires within this window
  pub refresh_window_secs: u64,
  /// Minimum accepted password length at login
  pub min_password_length: usize,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      refresh_check_secs: 60,
      refresh_window_secs: 5 * 60,
      min_password_length: 8,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
  pub auto_refresh_secs: u64,
  pub recent_members_limit: u32,
  pub upcoming_events_limit: u32,
}

impl Default for DashboardConfig {
  fn default() -> Self {
    Self {
      auto_refresh_secs: 5 * 60,
      recent_members_limit: 5,
      upcoming_events_limit: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// Probe cadence while online
  pub keep_alive_secs: u64,
  /// Probe cadence while offline
  pub retry_secs: u64,
  /// Upper bound for one full feed fetch
  pub fetch_timeout_secs: u64,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      keep_alive_secs: 5 * 60,
      retry_secs: 30,
      fetch_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
  pub batch_size: usize,
}

impl Default for ImportConfig {
  fn default() -> Self {
    Self { batch_size: 5 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive when FLOCK_LOG is not set
  pub level: String,
  /// Directory for log files (default: $XDG_DATA_HOME/flock/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./flock.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/flock/config.yaml
  ///
  /// Without a file, defaults are used. `FLOCK_API_URL` always wins over the
  /// file's `api.base_url`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    Ok(config.with_env_overrides(std::env::var(API_URL_ENV).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("flock.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("flock").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn with_env_overrides(mut self, api_url: Option<String>) -> Self {
    if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
      self.api.base_url = url.trim().to_string();
    }
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.api.base_url, DEFAULT_API_URL);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.cache.list_ttl_secs, 300);
    assert_eq!(config.offline.retry_secs, 30);
    assert_eq!(config.import.batch_size, 5);
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let yaml = r#"
api:
  base_url: https://church.example.org
cache:
  statistics_ttl_secs: 90
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.api.base_url, "https://church.example.org");
    assert_eq!(config.api.timeout_secs, 15);
    assert_eq!(config.cache.statistics_ttl_secs, 90);
    assert_eq!(config.cache.list_ttl_secs, 300);
  }

  #[test]
  fn test_env_override_wins() {
    let config = Config::default().with_env_overrides(Some("http://api.internal:9000".into()));
    assert_eq!(config.api.base_url, "http://api.internal:9000");

    let config = Config::default().with_env_overrides(Some("   ".into()));
    assert_eq!(config.api.base_url, DEFAULT_API_URL);
  }
}
