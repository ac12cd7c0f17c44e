//! Rolling-window accounting of remote calls.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Tracks remote calls in a rolling window matching the remote quota.
///
/// Shared by every coordinator of a repository, since the quota is per token
/// rather than per entity kind.
#[derive(Debug)]
pub struct RateLimiter {
  max_calls: usize,
  window: Duration,
  calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
  pub fn new(max_calls: usize, window: Duration) -> Self {
    Self {
      max_calls,
      window,
      calls: Mutex::new(VecDeque::with_capacity(max_calls)),
    }
  }

  pub fn from_config(config: &RateLimitConfig) -> Self {
    Self::new(config.max_calls, Duration::from_secs(config.window_secs))
  }

  /// Record a call if the quota allows it.
  ///
  /// On refusal returns how long until the oldest call leaves the window.
  pub fn try_acquire(&self) -> Result<(), Duration> {
    self.try_acquire_at(Instant::now())
  }

  pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
    if self.max_calls == 0 {
      return Ok(());
    }

    let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
    Self::expire(&mut calls, now, self.window);

    if calls.len() < self.max_calls {
      calls.push_back(now);
      return Ok(());
    }

    let wait = calls
      .front()
      .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
      .unwrap_or_default();
    Err(wait)
  }

  /// Calls still available in the current window.
  pub fn remaining(&self) -> Option<usize> {
    if self.max_calls == 0 {
      return None;
    }
    let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
    Self::expire(&mut calls, Instant::now(), self.window);
    Some(self.max_calls.saturating_sub(calls.len()))
  }

  fn expire(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = calls.front() {
      if now.saturating_duration_since(*oldest) >= window {
        calls.pop_front();
      } else {
        break;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_refuses_beyond_quota_until_window_slides() {
    let limiter = RateLimiter::new(2, Duration::from_secs(60));
    let start = Instant::now();

    assert!(limiter.try_acquire_at(start).is_ok());
    assert!(limiter.try_acquire_at(start + Duration::from_secs(10)).is_ok());

    let wait = limiter
      .try_acquire_at(start + Duration::from_secs(20))
      .unwrap_err();
    assert_eq!(wait, Duration::from_secs(40));

    // Oldest call has left the window
    assert!(limiter.try_acquire_at(start + Duration::from_secs(60)).is_ok());
    assert!(limiter.try_acquire_at(start + Duration::from_secs(61)).is_err());
  }

  #[test]
  fn test_zero_quota_disables_limiter() {
    let limiter = RateLimiter::new(0, Duration::from_secs(60));
    for _ in 0..1000 {
      assert!(limiter.try_acquire().is_ok());
    }
    assert_eq!(limiter.remaining(), None);
  }

  #[test]
  fn test_remaining() {
    let limiter = RateLimiter::new(3, Duration::from_secs(3600));
    limiter.try_acquire().unwrap();
    assert_eq!(limiter.remaining(), Some(2));
  }
}
