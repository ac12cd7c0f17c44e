//! Per-entity caching policies.

use chrono::{DateTime, Duration, Utc};

use super::entry::CacheEntry;
use super::merge::Orphan;
use super::traits::{Cursor, Delta, EntityKind, Record};
use crate::config::CacheConfig;

/// How an entity kind is cached.
///
/// Chosen once per kind when the repository is built and never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
  /// Rarely-changing reference data with a long freshness window
  Structural { ttl: Duration },
  /// Time-windowed snapshots with a short freshness window
  Dynamic { ttl: Duration },
  /// Not cached; every read goes to the remote source
  PassThrough,
}

/// Upper bound on a configured freshness window.
const MAX_TTL_DAYS: i64 = 3650;

fn ttl_from_secs(secs: u64) -> Duration {
  let cap = Duration::days(MAX_TTL_DAYS);
  i64::try_from(secs)
    .ok()
    .and_then(Duration::try_seconds)
    .map_or(cap, |ttl| ttl.min(cap))
}

/// Result of folding a fetch into an entry.
#[derive(Debug)]
pub struct Applied<T> {
  pub entry: CacheEntry<T>,
  pub orphans: Vec<Orphan>,
}

impl CacheStrategy {
  pub fn for_kind(kind: EntityKind, config: &CacheConfig) -> Self {
    match kind {
      EntityKind::Accounts | EntityKind::CategoryGroups | EntityKind::Payees => CacheStrategy::Structural {
        ttl: ttl_from_secs(config.structural_ttl_secs),
      },
      EntityKind::BudgetMonths | EntityKind::ScheduledTransactions => CacheStrategy::Dynamic {
        ttl: ttl_from_secs(config.dynamic_ttl_secs),
      },
      EntityKind::Transactions => CacheStrategy::PassThrough,
    }
  }

  pub fn ttl(&self) -> Option<Duration> {
    match self {
      Self::Structural { ttl } | Self::Dynamic { ttl } => Some(*ttl),
      Self::PassThrough => None,
    }
  }

  pub fn is_cached(&self) -> bool {
    !matches!(self, Self::PassThrough)
  }

  /// Whether the entry is missing or older than the freshness window.
  pub fn should_refresh<T>(&self, entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
    match self.ttl() {
      Some(ttl) => match entry.age(now) {
        Some(age) => age > ttl,
        None => true,
      },
      None => false,
    }
  }

  /// Cursor to send with the next fetch; `None` asks for a full fetch.
  pub fn fetch_cursor<T>(&self, entry: &CacheEntry<T>) -> Option<Cursor> {
    if self.is_cached() {
      entry.cursor
    } else {
      None
    }
  }

  /// Fold a fetch result into `entry`, producing its successor.
  ///
  /// Results always go through the type's merge rule, so a full response
  /// against an empty entry degenerates to a replace. The cursor never moves
  /// backwards.
  pub fn apply<T: Record>(&self, entry: &CacheEntry<T>, fetched: Delta<T>, now: DateTime<Utc>) -> Applied<T> {
    let merged = T::merge(&entry.data, fetched.records);
    let cursor = match entry.cursor {
      Some(current) => current.max(fetched.cursor),
      None => fetched.cursor,
    };

    Applied {
      entry: CacheEntry::merged(entry, merged.records, cursor, now),
      orphans: merged.orphans,
    }
  }
}
