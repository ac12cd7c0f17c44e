//! Boundary to the remote ledger service.
//!
//! The HTTP client itself lives outside this crate. Anything that can answer
//! cursor-based fetches implements [`LedgerSource`] and is handed to the
//! repository as an `Arc<dyn LedgerSource>`.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::cache::{Cursor, Delta};

use super::types::{Account, BudgetMonth, CategoryGroup, Payee, ScheduledTransaction, Transaction};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Cursor is no longer recognized by the remote source")]
  Conflict,

  #[error("Rate limited - please wait before retrying")]
  RateLimited,

  #[error("Transient error: {0}")]
  Transient(String),

  #[error("Resource not found: {0}")]
  NotFound(String),

  #[error("Remote error: {0}")]
  Other(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
  }

  /// Classify an HTTP status returned by the remote API.
  pub fn from_status(status: u16, body: &str) -> Self {
    let truncated = Self::truncate_body(body);
    match status {
      409 => FetchError::Conflict,
      429 => FetchError::RateLimited,
      404 => FetchError::NotFound(truncated),
      408 | 500..=599 => FetchError::Transient(format!("Status {}: {}", status, truncated)),
      _ => FetchError::Other(format!("Status {}: {}", status, truncated)),
    }
  }

  /// Whether waiting and retrying can succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, FetchError::RateLimited | FetchError::Transient(_))
  }
}

/// Filters for a pass-through transaction read.
///
/// At most one of `account_id`, `category_id`, `payee_id` scopes the remote
/// call (checked in that order); every filter is also applied locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
  pub account_id: Option<String>,
  pub category_id: Option<String>,
  pub payee_id: Option<String>,
  pub since_date: Option<NaiveDate>,
  /// Inclusive lower bound in milliunits
  pub min_amount: Option<i64>,
  /// Inclusive upper bound in milliunits
  pub max_amount: Option<i64>,
}

impl TransactionQuery {
  pub fn matches(&self, txn: &Transaction) -> bool {
    if let Some(account_id) = &self.account_id {
      if &txn.account_id != account_id {
        return false;
      }
    }
    if let Some(category_id) = &self.category_id {
      let in_split = txn
        .subtransactions
        .iter()
        .any(|s| !s.deleted && s.category_id.as_ref() == Some(category_id));
      if txn.category_id.as_ref() != Some(category_id) && !in_split {
        return false;
      }
    }
    if let Some(payee_id) = &self.payee_id {
      if txn.payee_id.as_ref() != Some(payee_id) {
        return false;
      }
    }
    if let Some(since) = self.since_date {
      if txn.date < since {
        return false;
      }
    }
    if let Some(min) = self.min_amount {
      if txn.amount < min {
        return false;
      }
    }
    if let Some(max) = self.max_amount {
      if txn.amount > max {
        return false;
      }
    }
    true
  }
}

/// Remote ledger operations consumed by the mirror.
///
/// For the cursor-aware calls, `None` requests a full fetch and `Some(cursor)`
/// a delta of everything changed or deleted since `cursor`. A delta fetch fails
/// with [`FetchError::Conflict`] when the cursor has expired remotely.
#[async_trait]
pub trait LedgerSource: Send + Sync {
  async fn fetch_accounts(&self, budget_id: &str, cursor: Option<Cursor>) -> Result<Delta<Account>, FetchError>;

  async fn fetch_category_groups(
    &self,
    budget_id: &str,
    cursor: Option<Cursor>,
  ) -> Result<Delta<CategoryGroup>, FetchError>;

  async fn fetch_payees(&self, budget_id: &str, cursor: Option<Cursor>) -> Result<Delta<Payee>, FetchError>;

  async fn fetch_scheduled_transactions(
    &self,
    budget_id: &str,
    cursor: Option<Cursor>,
  ) -> Result<Delta<ScheduledTransaction>, FetchError>;

  async fn fetch_budget_month(
    &self,
    budget_id: &str,
    month: NaiveDate,
    cursor: Option<Cursor>,
  ) -> Result<Delta<BudgetMonth>, FetchError>;

  async fn fetch_transactions(
    &self,
    budget_id: &str,
    query: &TransactionQuery,
  ) -> Result<Vec<Transaction>, FetchError>;

  async fn fetch_transaction(&self, budget_id: &str, transaction_id: &str) -> Result<Transaction, FetchError>;
}
