use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub rate_limit: RateLimitConfig,
  pub months: MonthsConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness window for accounts, category groups and payees
  pub structural_ttl_secs: u64,
  /// Freshness window for budget months and scheduled transactions
  pub dynamic_ttl_secs: u64,
  /// Capacity of each refresh request queue
  pub refresh_queue: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      structural_ttl_secs: 30 * 60,
      dynamic_ttl_secs: 5 * 60,
      refresh_queue: 64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub backoff_base_secs: u64,
  pub backoff_max_secs: u64,
  /// Upper bound of the random delay added to each retry
  pub jitter_max_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      backoff_base_secs: 5,
      backoff_max_secs: 300,
      jitter_max_ms: 1000,
    }
  }
}

/// Remote quota. The ledger API allows 200 requests per hour per token.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  /// Calls allowed per window; 0 disables the limiter
  pub max_calls: usize,
  pub window_secs: u64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      max_calls: 200,
      window_secs: 60 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonthsConfig {
  /// Months outside previous/current/next kept cached, least recently read first out
  pub retain_extra: usize,
}

impl Default for MonthsConfig {
  fn default() -> Self {
    Self { retain_extra: 2 }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// In-process map, lost on restart
  #[default]
  Memory,
  /// SQLite database, survives restarts
  Sqlite,
  /// Caching disabled
  None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database path for the sqlite backend (default: $XDG_DATA_HOME/ledger-mirror/cache.db)
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  /// Open the configured storage backend.
  pub fn open(&self) -> Result<Arc<dyn CacheStorage>> {
    let storage: Arc<dyn CacheStorage> = match self.backend {
      StorageBackend::Memory => Arc::new(MemoryStorage::new()),
      StorageBackend::None => Arc::new(NoopStorage),
      StorageBackend::Sqlite => match &self.path {
        Some(path) => Arc::new(SqliteStorage::open_at(path)?),
        None => Arc::new(SqliteStorage::open()?),
      },
    };
    Ok(storage)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is not set
  pub level: String,
  /// Write a daily rolling log file here in addition to stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl MirrorConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ledger-mirror.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledger-mirror/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ledger-mirror.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ledger-mirror").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: MirrorConfig = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the budget to mirror from environment variables.
  ///
  /// Checks LEDGER_MIRROR_BUDGET_ID first, then LEDGER_BUDGET_ID as fallback.
  pub fn budget_id_from_env() -> Result<String> {
    std::env::var("LEDGER_MIRROR_BUDGET_ID")
      .or_else(|_| std::env::var("LEDGER_BUDGET_ID"))
      .map_err(|_| {
        eyre!("Budget id not found. Set LEDGER_MIRROR_BUDGET_ID or LEDGER_BUDGET_ID environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = MirrorConfig::default();
    assert_eq!(config.cache.structural_ttl_secs, 1800);
    assert_eq!(config.cache.dynamic_ttl_secs, 300);
    assert_eq!(config.rate_limit.max_calls, 200);
    assert_eq!(config.rate_limit.window_secs, 3600);
    assert_eq!(config.months.retain_extra, 2);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = MirrorConfig::from_yaml(
      r#"
cache:
  dynamic_ttl_secs: 60
storage:
  backend: sqlite
  path: /tmp/mirror.db
"#,
    )
    .unwrap();

    assert_eq!(config.cache.dynamic_ttl_secs, 60);
    assert_eq!(config.cache.structural_ttl_secs, 1800);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/mirror.db")));
    assert_eq!(config.sync.backoff_max_secs, 300);
  }

  #[test]
  fn test_unknown_backend_is_rejected() {
    assert!(MirrorConfig::from_yaml("storage:\n  backend: redis\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(MirrorConfig::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "rate_limit:\n  max_calls: 10\n").unwrap();

    let config = MirrorConfig::load(Some(&path)).unwrap();
    assert_eq!(config.rate_limit.max_calls, 10);
  }

  #[test]
  fn test_open_storage_backends() {
    let none = StorageConfig {
      backend: StorageBackend::None,
      path: None,
    };
    let storage = none.open().unwrap();
    storage.set("k", b"v").unwrap();
    assert_eq!(storage.get("k").unwrap(), None);

    let dir = tempfile::tempdir().unwrap();
    let sqlite = StorageConfig {
      backend: StorageBackend::Sqlite,
      path: Some(dir.path().join("cache.db")),
    };
    let storage = sqlite.open().unwrap();
    storage.set("k", b"v").unwrap();
    assert_eq!(storage.get("k").unwrap(), Some(b"v".to_vec()));
  }

  #[test]
  fn test_budget_id_from_env() {
    std::env::remove_var("LEDGER_MIRROR_BUDGET_ID");
    std::env::remove_var("LEDGER_BUDGET_ID");
    assert!(MirrorConfig::budget_id_from_env().is_err());

    std::env::set_var("LEDGER_BUDGET_ID", "fallback-budget");
    assert_eq!(MirrorConfig::budget_id_from_env().unwrap(), "fallback-budget");

    std::env::set_var("LEDGER_MIRROR_BUDGET_ID", "primary-budget");
    assert_eq!(MirrorConfig::budget_id_from_env().unwrap(), "primary-budget");

    std::env::remove_var("LEDGER_MIRROR_BUDGET_ID");
    std::env::remove_var("LEDGER_BUDGET_ID");
  }
}
