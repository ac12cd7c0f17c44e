//! Versioned, timestamped wrapper around a cached collection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::traits::Cursor;

/// One cached collection for an entity kind (and month, for monthly kinds).
///
/// Entries are never mutated in place once published: a refresh builds a new
/// entry and swaps it in. The only exception is `access_count`, a diagnostic
/// counter bumped on every read.
#[derive(Debug)]
pub struct CacheEntry<T> {
  /// Live records in insertion order
  pub data: Vec<T>,
  /// Sync position of the last successful fetch
  pub cursor: Option<Cursor>,
  pub created_at: DateTime<Utc>,
  /// Set on each successful merge, never on reads
  pub last_refreshed_at: Option<DateTime<Utc>>,
  access_count: AtomicU64,
}

impl<T> CacheEntry<T> {
  pub fn empty(now: DateTime<Utc>) -> Self {
    Self {
      data: Vec::new(),
      cursor: None,
      created_at: now,
      last_refreshed_at: None,
      access_count: AtomicU64::new(0),
    }
  }

  /// Build the successor of `previous` after a merge.
  pub fn merged(previous: &CacheEntry<T>, data: Vec<T>, cursor: Cursor, now: DateTime<Utc>) -> Self {
    Self {
      data,
      cursor: Some(cursor),
      created_at: previous.created_at,
      last_refreshed_at: Some(now),
      access_count: AtomicU64::new(previous.access_count()),
    }
  }

  /// True once at least one fetch has been merged (or restored from storage).
  pub fn is_populated(&self) -> bool {
    self.last_refreshed_at.is_some()
  }

  pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
    self.last_refreshed_at.map(|t| now - t)
  }

  pub fn record_read(&self) {
    self.access_count.fetch_add(1, Ordering::Relaxed);
  }

  pub fn access_count(&self) -> u64 {
    self.access_count.load(Ordering::Relaxed)
  }
}

impl<T: Clone> CacheEntry<T> {
  pub fn to_stored(&self) -> StoredEntry<T> {
    StoredEntry {
      data: self.data.clone(),
      cursor: self.cursor,
      created_at: self.created_at,
      last_refreshed_at: self.last_refreshed_at,
      access_count: self.access_count(),
    }
  }
}

impl<T> From<StoredEntry<T>> for CacheEntry<T> {
  fn from(stored: StoredEntry<T>) -> Self {
    Self {
      data: stored.data,
      cursor: stored.cursor,
      created_at: stored.created_at,
      last_refreshed_at: stored.last_refreshed_at,
      access_count: AtomicU64::new(stored.access_count),
    }
  }
}

impl<T: Clone> Clone for CacheEntry<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      cursor: self.cursor,
      created_at: self.created_at,
      last_refreshed_at: self.last_refreshed_at,
      access_count: AtomicU64::new(self.access_count()),
    }
  }
}

/// Serialized form of a cache entry, as written to the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry<T> {
  pub data: Vec<T>,
  pub cursor: Option<Cursor>,
  pub created_at: DateTime<Utc>,
  pub last_refreshed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub access_count: u64,
}
