//! Typed facade over the cached ledger of one budget.
//!
//! Reads are synchronous and served from memory; they never wait on the
//! network. Stale or missing data is refreshed in the background and shows up
//! on a later read. Transactions are not cached and go to the remote source
//! on every call.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheStorage, CacheStrategy, EntityKind};
use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::ledger::month::{first_of_month, shift_months};
use crate::ledger::{
  Account, BudgetMonth, Category, CategoryGroup, FetchError, LedgerSource, MonthSelector, Payee,
  ScheduledTransaction, Transaction, TransactionQuery,
};
use crate::sync::{
  fetcher, Backoff, CoordinatorContext, FetcherFn, KeyStatus, RateLimiter, SyncClock, SyncCoordinator,
};

/// Source handle captured by the fetch closures.
#[derive(Clone)]
struct Remote {
  source: Arc<dyn LedgerSource>,
  budget_id: Arc<str>,
}

impl Remote {
  fn accounts(&self) -> FetcherFn<Account> {
    let remote = self.clone();
    fetcher(move |_key, cursor| {
      let remote = remote.clone();
      async move { remote.source.fetch_accounts(&remote.budget_id, cursor).await }
    })
  }

  fn category_groups(&self) -> FetcherFn<CategoryGroup> {
    let remote = self.clone();
    fetcher(move |_key, cursor| {
      let remote = remote.clone();
      async move { remote.source.fetch_category_groups(&remote.budget_id, cursor).await }
    })
  }

  fn payees(&self) -> FetcherFn<Payee> {
    let remote = self.clone();
    fetcher(move |_key, cursor| {
      let remote = remote.clone();
      async move { remote.source.fetch_payees(&remote.budget_id, cursor).await }
    })
  }

  fn scheduled_transactions(&self) -> FetcherFn<ScheduledTransaction> {
    let remote = self.clone();
    fetcher(move |_key, cursor| {
      let remote = remote.clone();
      async move { remote.source.fetch_scheduled_transactions(&remote.budget_id, cursor).await }
    })
  }

  fn budget_months(&self) -> FetcherFn<BudgetMonth> {
    let remote = self.clone();
    fetcher(move |key: CacheKey, cursor| {
      let remote = remote.clone();
      async move {
        match key.month {
          Some(month) => remote.source.fetch_budget_month(&remote.budget_id, month, cursor).await,
          None => Err(FetchError::Other(format!("Budget month key without a month: {}", key))),
        }
      }
    })
  }
}

/// Local mirror of one budget.
///
/// Construct once per budget and share as `Arc<Repository>`.
pub struct Repository {
  budget_id: Arc<str>,
  source: Arc<dyn LedgerSource>,
  storage: Arc<dyn CacheStorage>,
  limiter: Arc<RateLimiter>,
  clock: Arc<SyncClock>,
  month_retain_extra: usize,
  closed: AtomicBool,
  accounts: SyncCoordinator<Account>,
  category_groups: SyncCoordinator<CategoryGroup>,
  payees: SyncCoordinator<Payee>,
  scheduled: SyncCoordinator<ScheduledTransaction>,
  months: SyncCoordinator<BudgetMonth>,
}

impl Repository {
  /// Build a repository and start its refresh workers.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(
    budget_id: impl Into<String>,
    source: Arc<dyn LedgerSource>,
    storage: Arc<dyn CacheStorage>,
    config: &MirrorConfig,
  ) -> Self {
    let budget_id: Arc<str> = Arc::from(budget_id.into());
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let clock = Arc::new(SyncClock::default());

    let ctx = CoordinatorContext {
      budget_id: Arc::clone(&budget_id),
      storage: Arc::clone(&storage),
      limiter: Arc::clone(&limiter),
      clock: Arc::clone(&clock),
      backoff: Backoff::from_config(&config.sync),
      queue_capacity: config.cache.refresh_queue,
    };
    let remote = Remote {
      source: Arc::clone(&source),
      budget_id: Arc::clone(&budget_id),
    };
    let strategy = |kind| CacheStrategy::for_kind(kind, &config.cache);

    info!(budget = %budget_id, "Ledger mirror started");

    Self {
      accounts: SyncCoordinator::new(
        EntityKind::Accounts,
        strategy(EntityKind::Accounts),
        remote.accounts(),
        ctx.clone(),
      ),
      category_groups: SyncCoordinator::new(
        EntityKind::CategoryGroups,
        strategy(EntityKind::CategoryGroups),
        remote.category_groups(),
        ctx.clone(),
      ),
      payees: SyncCoordinator::new(
        EntityKind::Payees,
        strategy(EntityKind::Payees),
        remote.payees(),
        ctx.clone(),
      ),
      scheduled: SyncCoordinator::new(
        EntityKind::ScheduledTransactions,
        strategy(EntityKind::ScheduledTransactions),
        remote.scheduled_transactions(),
        ctx.clone(),
      ),
      months: SyncCoordinator::new(
        EntityKind::BudgetMonths,
        strategy(EntityKind::BudgetMonths),
        remote.budget_months(),
        ctx,
      ),
      budget_id,
      source,
      storage,
      limiter,
      clock,
      month_retain_extra: config.months.retain_extra,
      closed: AtomicBool::new(false),
    }
  }

  /// Build a repository with the storage backend named in `config`.
  pub fn from_config(
    budget_id: impl Into<String>,
    source: Arc<dyn LedgerSource>,
    config: &MirrorConfig,
  ) -> Result<Self, MirrorError> {
    let storage = config.storage.open().map_err(MirrorError::storage)?;
    Ok(Self::new(budget_id, source, storage, config))
  }

  pub fn budget_id(&self) -> &str {
    &self.budget_id
  }

  pub fn accounts(&self) -> Result<Vec<Account>, MirrorError> {
    Ok(self.accounts.read(CacheKey::of(EntityKind::Accounts))?.data.clone())
  }

  pub fn category_groups(&self) -> Result<Vec<CategoryGroup>, MirrorError> {
    Ok(
      self
        .category_groups
        .read(CacheKey::of(EntityKind::CategoryGroups))?
        .data
        .clone(),
    )
  }

  /// All categories across groups, in group order.
  pub fn categories(&self) -> Result<Vec<Category>, MirrorError> {
    let entry = self.category_groups.read(CacheKey::of(EntityKind::CategoryGroups))?;
    Ok(
      entry
        .data
        .iter()
        .flat_map(|group| group.categories.iter().cloned())
        .collect(),
    )
  }

  pub fn payees(&self) -> Result<Vec<Payee>, MirrorError> {
    Ok(self.payees.read(CacheKey::of(EntityKind::Payees))?.data.clone())
  }

  pub fn scheduled_transactions(&self) -> Result<Vec<ScheduledTransaction>, MirrorError> {
    Ok(
      self
        .scheduled
        .read(CacheKey::of(EntityKind::ScheduledTransactions))?
        .data
        .clone(),
    )
  }

  /// Snapshot of the month containing `month`, if it has been fetched.
  pub fn budget_month(&self, month: NaiveDate) -> Result<Option<BudgetMonth>, MirrorError> {
    let month = first_of_month(month);
    let key = CacheKey::month(month);
    let first_read = !self.months.contains(&key);

    let entry = self.months.read(key)?;
    if first_read {
      self.evict_months();
    }

    Ok(entry.data.iter().find(|m| m.month == month).cloned())
  }

  /// Like [`Repository::budget_month`], with the month given as
  /// `current`, `last`, `next`, `YYYY-MM` or `YYYY-MM-DD`.
  pub fn budget_month_named(&self, month: &str) -> Result<Option<BudgetMonth>, MirrorError> {
    let selector: MonthSelector = month.parse()?;
    self.budget_month(selector.resolve_now())
  }

  /// One category's figures for a month.
  pub fn month_category(&self, month: NaiveDate, category_id: &str) -> Result<Option<Category>, MirrorError> {
    Ok(
      self
        .budget_month(month)?
        .and_then(|m| m.category(category_id).cloned()),
    )
  }

  /// Payees whose name contains `name`, ignoring case, sorted by name.
  pub fn find_payee(&self, name: &str) -> Result<Vec<Payee>, MirrorError> {
    let needle = name.to_lowercase();
    let mut found: Vec<Payee> = self
      .payees()?
      .into_iter()
      .filter(|p| !p.deleted && p.name.to_lowercase().contains(&needle))
      .collect();
    found.sort_by_key(|p| p.name.to_lowercase());
    Ok(found)
  }

  /// Transactions matching `query`, newest first.
  ///
  /// Always a remote call. Missing account, payee and category names are
  /// filled in from cached data where available.
  pub async fn transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>, MirrorError> {
    self.ensure_open()?;
    self.acquire()?;

    let fetched = self.source.fetch_transactions(&self.budget_id, query).await?;
    let total = fetched.len();
    let names = self.names();

    let mut transactions: Vec<Transaction> = fetched
      .into_iter()
      .filter(|t| !t.deleted && query.matches(t))
      .map(|t| names.enrich(t))
      .collect();
    transactions.sort_by(|a, b| b.date.cmp(&a.date));

    debug!(fetched = total, matched = transactions.len(), "Transactions fetched");
    Ok(transactions)
  }

  /// A single transaction by id; `None` when missing or deleted.
  pub async fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, MirrorError> {
    self.ensure_open()?;
    self.acquire()?;

    match self.source.fetch_transaction(&self.budget_id, transaction_id).await {
      Ok(txn) if txn.deleted => Ok(None),
      Ok(txn) => Ok(Some(self.names().enrich(txn))),
      Err(FetchError::NotFound(_)) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// Whether any cached kind is stale or has never been loaded.
  pub fn needs_sync(&self) -> bool {
    self.accounts.needs_sync()
      || self.category_groups.needs_sync()
      || self.payees.needs_sync()
      || self.scheduled.needs_sync()
      || self.months.needs_sync()
  }

  /// Time of the most recent successful merge of any kind.
  pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
    self.clock.last()
  }

  /// Whether any kind holds data, fetched or restored from storage.
  pub fn is_initialized(&self) -> bool {
    self.accounts.is_populated()
      || self.category_groups.is_populated()
      || self.payees.is_populated()
      || self.scheduled.is_populated()
      || self.months.is_populated()
  }

  pub fn sync_status(&self) -> Vec<KeyStatus> {
    let mut status = self.accounts.status();
    status.extend(self.category_groups.status());
    status.extend(self.payees.status());
    status.extend(self.scheduled.status());
    let mut months = self.months.status();
    months.sort_by_key(|s| s.month);
    status.extend(months);
    status
  }

  /// Remote calls left in the current quota window; `None` when unlimited.
  pub fn remaining_calls(&self) -> Option<usize> {
    self.limiter.remaining()
  }

  /// Fetch accounts, category groups and payees, waiting for the results.
  pub async fn warm_up(&self) -> Result<(), MirrorError> {
    self.ensure_open()?;
    info!(budget = %self.budget_id, "Warming up cache");

    futures::try_join!(
      self.accounts.refresh(CacheKey::of(EntityKind::Accounts)),
      self.category_groups.refresh(CacheKey::of(EntityKind::CategoryGroups)),
      self.payees.refresh(CacheKey::of(EntityKind::Payees)),
    )?;
    Ok(())
  }

  /// Refresh every cached key of every kind concurrently.
  ///
  /// All refreshes run to completion; the first error is returned.
  pub async fn refresh_all(&self) -> Result<(), MirrorError> {
    self.ensure_open()?;

    let (accounts, groups, payees, scheduled, months) = futures::join!(
      self.accounts.refresh_cached(),
      self.category_groups.refresh_cached(),
      self.payees.refresh_cached(),
      self.scheduled.refresh_cached(),
      self.months.refresh_cached(),
    );
    accounts?;
    groups?;
    payees?;
    scheduled?;
    months?;
    Ok(())
  }

  /// Refresh every cached key of one kind.
  pub async fn refresh(&self, kind: EntityKind) -> Result<(), MirrorError> {
    self.ensure_open()?;

    match kind {
      EntityKind::Accounts => self.accounts.refresh_cached().await.map(drop),
      EntityKind::CategoryGroups => self.category_groups.refresh_cached().await.map(drop),
      EntityKind::Payees => self.payees.refresh_cached().await.map(drop),
      EntityKind::ScheduledTransactions => self.scheduled.refresh_cached().await.map(drop),
      EntityKind::BudgetMonths => self.months.refresh_cached().await.map(drop),
      EntityKind::Transactions => {
        debug!("Transactions are not cached - nothing to refresh");
        Ok(())
      }
    }
  }

  /// Drop all cached data of one kind; the next read starts a full fetch.
  pub fn invalidate(&self, kind: EntityKind) -> Result<(), MirrorError> {
    match kind {
      EntityKind::Accounts => self.accounts.invalidate(),
      EntityKind::CategoryGroups => self.category_groups.invalidate(),
      EntityKind::Payees => self.payees.invalidate(),
      EntityKind::ScheduledTransactions => self.scheduled.invalidate(),
      EntityKind::BudgetMonths => self.months.invalidate(),
      EntityKind::Transactions => Ok(()),
    }
  }

  /// Delete everything persisted for this budget. In-memory data is kept.
  pub fn clear_storage(&self) -> Result<usize, MirrorError> {
    let removed = self
      .storage
      .clear_by_prefix(&format!("{}:", self.budget_id))
      .map_err(MirrorError::storage)?;
    info!(budget = %self.budget_id, removed, "Cleared persisted cache");
    Ok(removed)
  }

  /// Stop background refreshing. Cached data stays readable; remote calls
  /// through this repository fail with [`MirrorError::Closed`].
  pub fn shutdown(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.accounts.shutdown();
    self.category_groups.shutdown();
    self.payees.shutdown();
    self.scheduled.shutdown();
    self.months.shutdown();
    info!(budget = %self.budget_id, "Ledger mirror stopped");
  }

  fn ensure_open(&self) -> Result<(), MirrorError> {
    if self.closed.load(Ordering::SeqCst) {
      Err(MirrorError::Closed)
    } else {
      Ok(())
    }
  }

  fn acquire(&self) -> Result<(), MirrorError> {
    self.limiter.try_acquire().map_err(MirrorError::rate_limited)
  }

  /// Keep the previous, current and next months plus the most recently read
  /// `month_retain_extra` others.
  fn evict_months(&self) {
    let current = MonthSelector::Current.resolve_now();
    let pinned = [shift_months(current, -1), current, shift_months(current, 1)];

    let mut others: Vec<(CacheKey, DateTime<Utc>)> = self
      .months
      .keys_by_access()
      .into_iter()
      .filter(|(key, _)| key.month.map_or(true, |m| !pinned.contains(&m)))
      .collect();
    if others.len() <= self.month_retain_extra {
      return;
    }

    others.sort_by(|a, b| b.1.cmp(&a.1));
    let evicted: Vec<CacheKey> = others
      .into_iter()
      .skip(self.month_retain_extra)
      .map(|(key, _)| key)
      .collect();

    debug!(count = evicted.len(), "Evicting least recently read budget months");
    self.months.evict(&evicted);
  }

  /// Id-to-name lookups from whatever is cached right now.
  fn names(&self) -> NameIndex {
    let mut index = NameIndex::default();

    if let Ok(entry) = self.accounts.read(CacheKey::of(EntityKind::Accounts)) {
      index.accounts = entry.data.iter().map(|a| (a.id.clone(), a.name.clone())).collect();
    }
    if let Ok(entry) = self.payees.read(CacheKey::of(EntityKind::Payees)) {
      index.payees = entry.data.iter().map(|p| (p.id.clone(), p.name.clone())).collect();
    }
    if let Ok(entry) = self.category_groups.read(CacheKey::of(EntityKind::CategoryGroups)) {
      index.categories = entry
        .data
        .iter()
        .flat_map(|g| g.categories.iter())
        .map(|c| (c.id.clone(), c.name.clone()))
        .collect();
    }

    index
  }
}

#[derive(Debug, Default)]
struct NameIndex {
  accounts: HashMap<String, String>,
  payees: HashMap<String, String>,
  categories: HashMap<String, String>,
}

impl NameIndex {
  fn enrich(&self, mut txn: Transaction) -> Transaction {
    if txn.account_name.is_none() {
      txn.account_name = self.accounts.get(&txn.account_id).cloned();
    }
    if txn.payee_name.is_none() {
      txn.payee_name = lookup(&self.payees, txn.payee_id.as_deref());
    }
    if txn.category_name.is_none() {
      txn.category_name = lookup(&self.categories, txn.category_id.as_deref());
    }
    for sub in txn.subtransactions.iter_mut() {
      if sub.category_name.is_none() {
        sub.category_name = lookup(&self.categories, sub.category_id.as_deref());
      }
    }
    txn.subtransactions.retain(|s| !s.deleted);
    txn
  }
}

fn lookup(names: &HashMap<String, String>, id: Option<&str>) -> Option<String> {
  id.and_then(|id| names.get(id).cloned())
}
