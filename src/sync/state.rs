use serde::Serialize;
use std::fmt;

/// Sync state of one cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  /// Nothing cached; the next fetch is a full fetch
  Empty,
  /// A fetch is in flight; readers still see the previous entry
  Syncing,
  /// Data has been merged at least once
  Current,
  /// The last fetch failed and left nothing usable behind
  Degraded,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Empty => "empty",
      Self::Syncing => "syncing",
      Self::Current => "current",
      Self::Degraded => "degraded",
    }
  }
}

impl fmt::Display for SyncState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
