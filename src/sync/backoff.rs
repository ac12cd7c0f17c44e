//! Retry delays for failed refreshes.

use rand::Rng;
use std::time::Duration;

use crate::config::SyncConfig;

/// Highest doubling applied to the base delay.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff with a cap and random jitter.
///
/// Jitter keeps entity kinds that failed together from retrying in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  base: Duration,
  max: Duration,
  jitter_max: Duration,
}

impl Backoff {
  pub fn new(base: Duration, max: Duration, jitter_max: Duration) -> Self {
    Self { base, max, jitter_max }
  }

  pub fn from_config(config: &SyncConfig) -> Self {
    Self::new(
      Duration::from_secs(config.backoff_base_secs),
      Duration::from_secs(config.backoff_max_secs),
      Duration::from_millis(config.jitter_max_ms),
    )
  }

  /// Delay before the retry following the `failures`-th consecutive failure,
  /// without jitter.
  pub fn base_delay(&self, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
    self.base.saturating_mul(2_u32.pow(exponent)).min(self.max)
  }

  /// Base delay plus uniform jitter in `[0, jitter_max]`.
  pub fn delay(&self, failures: u32) -> Duration {
    let jitter_ms = self.jitter_max.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
      Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
      Duration::ZERO
    };
    self.base_delay(failures) + jitter
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn backoff() -> Backoff {
    Backoff::new(Duration::from_secs(5), Duration::from_secs(300), Duration::from_millis(1000))
  }

  #[test]
  fn test_backoff_is_exponential_and_capped() {
    let b = backoff();
    assert_eq!(b.base_delay(1), Duration::from_secs(5));
    assert_eq!(b.base_delay(2), Duration::from_secs(10));
    assert_eq!(b.base_delay(3), Duration::from_secs(20));
    assert_eq!(b.base_delay(10), Duration::from_secs(300));
    assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(300));
  }

  #[test]
  fn test_jitter_is_bounded() {
    let b = backoff();
    for failures in 1..8 {
      let delay = b.delay(failures);
      let base = b.base_delay(failures);
      assert!(delay >= base);
      assert!(delay <= base + Duration::from_millis(1000));
    }
  }

  #[test]
  fn test_zero_jitter() {
    let b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), Duration::ZERO);
    assert_eq!(b.delay(1), Duration::from_millis(10));
  }
}
