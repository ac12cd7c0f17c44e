//! Core traits and types for the caching system.

use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use super::merge::{merge_records, Merged};

/// Trait for records that can be mirrored.
///
/// Implementors provide an identifier that is unique within their type (and
/// budget) plus a tombstone marker. The merge rule defaults to the generic
/// id-level fold; types with nested records override it.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this record (e.g., account id, payee id)
  fn record_id(&self) -> Cow<'_, str>;

  /// Whether the remote source marked this record as deleted.
  fn is_deleted(&self) -> bool;

  /// Fold a delta into an existing collection.
  fn merge(existing: &[Self], delta: Vec<Self>) -> Merged<Self> {
    Merged::plain(merge_records(existing, delta))
  }
}

/// Opaque sync position handed out by the remote source.
///
/// Only the remote source knows what a cursor means; the mirror only relies on
/// cursors being ordered so it can refuse to move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub i64);

impl fmt::Display for Cursor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Batch of changed or deleted records plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct Delta<T> {
  pub records: Vec<T>,
  pub cursor: Cursor,
}

impl<T> Delta<T> {
  pub fn new(records: Vec<T>, cursor: Cursor) -> Self {
    Self { records, cursor }
  }
}

/// The kinds of data mirrored for a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Accounts,
  CategoryGroups,
  Payees,
  Transactions,
  ScheduledTransactions,
  BudgetMonths,
}

impl EntityKind {
  pub const ALL: [EntityKind; 6] = [
    EntityKind::Accounts,
    EntityKind::CategoryGroups,
    EntityKind::Payees,
    EntityKind::Transactions,
    EntityKind::ScheduledTransactions,
    EntityKind::BudgetMonths,
  ];

  /// Name used in storage keys and log fields.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Accounts => "accounts",
      Self::CategoryGroups => "category_groups",
      Self::Payees => "payees",
      Self::Transactions => "transactions",
      Self::ScheduledTransactions => "scheduled_transactions",
      Self::BudgetMonths => "budget_months",
    }
  }

  /// Whether entries of this kind are additionally keyed by month.
  pub fn is_monthly(&self) -> bool {
    matches!(self, Self::BudgetMonths)
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identifies one cache entry: an entity kind, plus a month for monthly kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub kind: EntityKind,
  pub month: Option<NaiveDate>,
}

impl CacheKey {
  pub fn of(kind: EntityKind) -> Self {
    Self { kind, month: None }
  }

  pub fn month(month: NaiveDate) -> Self {
    Self {
      kind: EntityKind::BudgetMonths,
      month: Some(month),
    }
  }

  /// Key used in the storage backend, scoped to a budget.
  pub fn storage_key(&self, budget_id: &str) -> String {
    match self.month {
      Some(month) => format!("{}:{}:{}", budget_id, self.kind, month.format("%Y-%m")),
      None => format!("{}:{}", budget_id, self.kind),
    }
  }

  /// Storage prefix shared by every monthly key of `kind` in a budget.
  pub fn monthly_prefix(kind: EntityKind, budget_id: &str) -> String {
    format!("{}:{}:", budget_id, kind)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.month {
      Some(month) => write!(f, "{}[{}]", self.kind, month.format("%Y-%m")),
      None => write!(f, "{}", self.kind),
    }
  }
}
