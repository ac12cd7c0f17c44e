//! Caching implementations for ledger types.

use std::borrow::Cow;

use crate::cache::{merge_category_groups, Merged, Record};

use super::types::{Account, BudgetMonth, CategoryGroup, Payee, ScheduledTransaction, Transaction};

impl Record for Account {
  fn record_id(&self) -> Cow<'_, str> {
    Cow::Borrowed(&self.id)
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }
}

impl Record for CategoryGroup {
  fn record_id(&self) -> Cow<'_, str> {
    Cow::Borrowed(&self.id)
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }

  fn merge(existing: &[Self], delta: Vec<Self>) -> Merged<Self> {
    merge_category_groups(existing, delta)
  }
}

impl Record for Payee {
  fn record_id(&self) -> Cow<'_, str> {
    Cow::Borrowed(&self.id)
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }
}

impl Record for Transaction {
  fn record_id(&self) -> Cow<'_, str> {
    Cow::Borrowed(&self.id)
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }
}

impl Record for ScheduledTransaction {
  fn record_id(&self) -> Cow<'_, str> {
    Cow::Borrowed(&self.id)
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }
}

impl Record for BudgetMonth {
  fn record_id(&self) -> Cow<'_, str> {
    // Month snapshots are identified by their month
    Cow::Owned(self.month.format("%Y-%m-%d").to_string())
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }
}
