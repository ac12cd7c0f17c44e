//! Ledger domain: mirrored record types and the remote source boundary.

mod cache;
pub mod month;
pub mod source;
pub mod types;

pub use month::MonthSelector;
pub use source::{FetchError, LedgerSource, TransactionQuery};
pub use types::{
  Account, BudgetMonth, Category, CategoryGroup, Payee, ScheduledTransaction, Subtransaction, Transaction,
};
