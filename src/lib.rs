//! Local-first mirror of a remote budgeting ledger.
//!
//! A [`Repository`] keeps accounts, category groups, payees, scheduled
//! transactions and budget months in memory, kept current with cursor-based
//! delta fetches against a [`LedgerSource`]. Transactions are served straight
//! from the remote source.

pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod repository;
pub mod sync;

pub use cache::{CacheKey, CacheStorage, Cursor, Delta, EntityKind, MemoryStorage, NoopStorage, SqliteStorage};
pub use config::MirrorConfig;
pub use error::MirrorError;
pub use ledger::{
  Account, BudgetMonth, Category, CategoryGroup, FetchError, LedgerSource, MonthSelector, Payee,
  ScheduledTransaction, Subtransaction, Transaction, TransactionQuery,
};
pub use repository::Repository;
pub use sync::{KeyStatus, SyncState};
