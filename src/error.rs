use std::time::Duration;
use thiserror::Error;

use crate::ledger::FetchError;

/// Errors surfaced to callers of the repository.
///
/// Background sync failures are never reported through reads; only explicit
/// administrative calls, pass-through reads and storage failures on keys with
/// no cached data produce these.
#[derive(Error, Debug)]
pub enum MirrorError {
  #[error("Storage error: {0}")]
  Storage(String),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("Remote call quota exhausted - retry in {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64 },

  #[error("Invalid month: {0}")]
  InvalidMonth(String),

  #[error("Repository has been shut down")]
  Closed,
}

impl MirrorError {
  pub fn storage(err: impl std::fmt::Display) -> Self {
    MirrorError::Storage(err.to_string())
  }

  /// Quota refusal, rounding the wait up to whole seconds.
  pub fn rate_limited(wait: Duration) -> Self {
    let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    MirrorError::RateLimited { retry_after_secs }
  }
}
