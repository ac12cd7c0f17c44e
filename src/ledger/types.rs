//! Domain records mirrored from the remote ledger.
//!
//! Amounts are milliunits: 1000 milliunits equal one unit of the budget's currency.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A budget account (checking, savings, credit card, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
  pub id: String,
  pub name: String,
  #[serde(rename = "type", default)]
  pub account_type: String,
  #[serde(default)]
  pub on_budget: bool,
  #[serde(default)]
  pub closed: bool,
  pub note: Option<String>,
  #[serde(default)]
  pub balance: i64,
  #[serde(default)]
  pub cleared_balance: i64,
  #[serde(default)]
  pub uncleared_balance: i64,
  pub transfer_payee_id: Option<String>,
  #[serde(default)]
  pub deleted: bool,
}

/// Group of categories, owning its categories positionally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryGroup {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub hidden: bool,
  #[serde(default)]
  pub deleted: bool,
  #[serde(default)]
  pub categories: Vec<Category>,
  /// Synthesized locally to hold categories whose group has not been seen yet
  #[serde(default)]
  pub placeholder: bool,
}

impl CategoryGroup {
  pub fn placeholder(id: &str) -> Self {
    Self {
      id: id.to_string(),
      placeholder: true,
      ..Default::default()
    }
  }
}

/// Budget category. Addressable by id independently of its group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub category_group_id: String,
  pub name: String,
  #[serde(default)]
  pub hidden: bool,
  pub note: Option<String>,
  #[serde(default)]
  pub budgeted: i64,
  #[serde(default)]
  pub activity: i64,
  #[serde(default)]
  pub balance: i64,
  /// Goal type code (e.g. "TB", "TBD", "MF", "NEED")
  pub goal_type: Option<String>,
  pub goal_target: Option<i64>,
  #[serde(default)]
  pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payee {
  pub id: String,
  pub name: String,
  pub transfer_account_id: Option<String>,
  #[serde(default)]
  pub deleted: bool,
}

/// Ledger transaction. Never cached; served by pass-through reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: String,
  pub date: NaiveDate,
  pub amount: i64,
  pub memo: Option<String>,
  /// "cleared", "uncleared" or "reconciled"
  #[serde(default)]
  pub cleared: String,
  #[serde(default)]
  pub approved: bool,
  pub account_id: String,
  pub account_name: Option<String>,
  pub payee_id: Option<String>,
  pub payee_name: Option<String>,
  pub category_id: Option<String>,
  pub category_name: Option<String>,
  pub transfer_account_id: Option<String>,
  #[serde(default)]
  pub deleted: bool,
  #[serde(default)]
  pub subtransactions: Vec<Subtransaction>,
}

/// Split portion of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtransaction {
  pub id: String,
  pub transaction_id: String,
  pub amount: i64,
  pub memo: Option<String>,
  pub payee_id: Option<String>,
  pub category_id: Option<String>,
  pub category_name: Option<String>,
  #[serde(default)]
  pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTransaction {
  pub id: String,
  pub date_first: NaiveDate,
  pub date_next: NaiveDate,
  /// Recurrence, e.g. "monthly", "everyOtherWeek"
  pub frequency: String,
  pub amount: i64,
  pub memo: Option<String>,
  pub account_id: String,
  pub payee_id: Option<String>,
  pub category_id: Option<String>,
  #[serde(default)]
  pub deleted: bool,
}

/// Snapshot of one budget month, including per-category amounts for that month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetMonth {
  pub month: NaiveDate,
  pub note: Option<String>,
  #[serde(default)]
  pub income: i64,
  #[serde(default)]
  pub budgeted: i64,
  #[serde(default)]
  pub activity: i64,
  #[serde(default)]
  pub to_be_budgeted: i64,
  pub age_of_money: Option<i32>,
  #[serde(default)]
  pub deleted: bool,
  #[serde(default)]
  pub categories: Vec<Category>,
}

impl BudgetMonth {
  pub fn new(month: NaiveDate) -> Self {
    Self {
      month,
      note: None,
      income: 0,
      budgeted: 0,
      activity: 0,
      to_be_budgeted: 0,
      age_of_money: None,
      deleted: false,
      categories: Vec::new(),
    }
  }

  pub fn category(&self, category_id: &str) -> Option<&Category> {
    self.categories.iter().find(|c| c.id == category_id && !c.deleted)
  }
}
