//! Tracing setup for hosts embedding the mirror.

use color_eyre::{eyre::eyre, Result};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Initialize the tracing subscriber.
///
/// RUST_LOG takes precedence over the configured level. When a log directory
/// is configured, output is also written to a daily rolling file; the returned
/// guard flushes it and must be kept alive for the lifetime of the process.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, "ledger-mirror.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .with(filter)
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_init_with_log_directory_installs_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
      level: "debug".to_string(),
      directory: Some(dir.path().join("logs")),
    };

    let guard = init(&config).unwrap();
    assert!(guard.is_some());
    assert!(dir.path().join("logs").is_dir());

    // The global subscriber is already installed
    assert!(init(&LogConfig::default()).is_err());
  }
}
