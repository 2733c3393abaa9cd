//! Log setup: `FLOCK_LOG` (or the configured level) filters, output goes to a
//! daily rolling file so it never mixes with command output.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "FLOCK_LOG";
const LOG_FILE_PREFIX: &str = "flock.log";

/// Default log directory: `$XDG_DATA_HOME/flock/logs`.
pub fn default_directory() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("flock").join("logs"))
}

fn filter(config: &LoggingConfig) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// whole run or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let directory = config
    .directory
    .clone()
    .or_else(default_directory)
    .ok_or_else(|| eyre!("Could not determine a log directory"))?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter(config))
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_configured_level_used_without_env() {
    let config = LoggingConfig {
      level: "debug".into(),
      directory: None,
    };
    if std::env::var(LOG_ENV).is_err() {
      assert_eq!(filter(&config).to_string(), "debug");
    }
  }

  #[test]
  fn test_default_directory_is_under_flock() {
    if let Some(dir) = default_directory() {
      assert!(dir.ends_with("flock/logs"));
    }
  }
}
