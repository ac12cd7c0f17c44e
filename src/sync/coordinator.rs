//! Fetch-and-merge driver for one entity kind.
//!
//! A coordinator owns every cache key of its kind (one key for most kinds, one
//! per month for budget months). Reads clone the published entry and return;
//! refreshes run on background tasks fed by a bounded request channel.
//!
//! Per key:
//! - at most one refresh is in flight; extra triggers are coalesced
//! - the entry is swapped as a whole, under a lock held only for the swap
//! - a generation counter invalidates results of refreshes that were started
//!   before an invalidation, conflict reset or eviction

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::backoff::Backoff;
use super::rate_limit::RateLimiter;
use super::state::SyncState;
use crate::cache::{
  read_json, write_json, CacheEntry, CacheKey, CacheStorage, CacheStrategy, Cursor, Delta, EntityKind, Record,
  StoredEntry,
};
use crate::error::MirrorError;
use crate::ledger::FetchError;

/// A factory that issues one remote fetch for a key, with an optional cursor.
pub type FetcherFn<T> =
  Arc<dyn Fn(CacheKey, Option<Cursor>) -> BoxFuture<'static, Result<Delta<T>, FetchError>> + Send + Sync>;

/// Box a fetch closure into a [`FetcherFn`].
pub fn fetcher<T, F, Fut>(f: F) -> FetcherFn<T>
where
  F: Fn(CacheKey, Option<Cursor>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Delta<T>, FetchError>> + Send + 'static,
{
  Arc::new(move |key, cursor| Box::pin(f(key, cursor)))
}

/// Most recent successful merge across all coordinators of a repository.
#[derive(Debug, Default)]
pub struct SyncClock {
  last: RwLock<Option<DateTime<Utc>>>,
}

impl SyncClock {
  pub fn record(&self, at: DateTime<Utc>) {
    let mut last = write_lock(&self.last);
    if last.map_or(true, |t| at > t) {
      *last = Some(at);
    }
  }

  pub fn last(&self) -> Option<DateTime<Utc>> {
    *read_lock(&self.last)
  }
}

/// Resources shared by every coordinator of one repository.
#[derive(Clone)]
pub struct CoordinatorContext {
  pub budget_id: Arc<str>,
  pub storage: Arc<dyn CacheStorage>,
  pub limiter: Arc<RateLimiter>,
  pub clock: Arc<SyncClock>,
  pub backoff: Backoff,
  pub queue_capacity: usize,
}

/// What a refresh did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
  /// Fetch merged and published
  Merged { records: usize, cursor: Option<Cursor> },
  /// Another refresh for the key was already in flight
  Coalesced,
  /// Remote quota exhausted; retried once the window frees up
  Deferred { retry_in: Duration },
  /// Superseded by an invalidation while in flight
  Discarded,
  /// Cursor rejected; cache emptied and a full fetch scheduled
  Reset,
  /// Fetch failed; cached data kept and a retry scheduled
  Failed,
}

/// Diagnostic view of one cache key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
  pub kind: EntityKind,
  pub month: Option<NaiveDate>,
  pub state: SyncState,
  pub cursor: Option<Cursor>,
  pub records: usize,
  pub access_count: u64,
  pub last_refreshed_at: Option<DateTime<Utc>>,
  pub consecutive_failures: u32,
  pub in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  /// Posted by a read or a retry; failures are absorbed
  Background,
  /// Requested by an administrative call; failures are returned
  Explicit,
}

enum Step {
  Done(Result<RefreshOutcome, MirrorError>),
  Conflict,
  Retry(Duration, Result<RefreshOutcome, MirrorError>),
}

struct KeySlot<T> {
  key: CacheKey,
  entry: RwLock<Arc<CacheEntry<T>>>,
  state: Mutex<SyncState>,
  in_flight: AtomicBool,
  queued: AtomicBool,
  retry_pending: AtomicBool,
  generation: AtomicU64,
  failures: AtomicU32,
  hydration_error: Mutex<Option<String>>,
  last_access: Mutex<DateTime<Utc>>,
}

impl<T> KeySlot<T> {
  fn new(key: CacheKey, entry: CacheEntry<T>, hydration_error: Option<String>) -> Self {
    let state = if entry.is_populated() {
      SyncState::Current
    } else {
      SyncState::Empty
    };
    Self {
      key,
      entry: RwLock::new(Arc::new(entry)),
      state: Mutex::new(state),
      in_flight: AtomicBool::new(false),
      queued: AtomicBool::new(false),
      retry_pending: AtomicBool::new(false),
      generation: AtomicU64::new(0),
      failures: AtomicU32::new(0),
      hydration_error: Mutex::new(hydration_error),
      last_access: Mutex::new(Utc::now()),
    }
  }

  fn snapshot(&self) -> Arc<CacheEntry<T>> {
    Arc::clone(&read_lock(&self.entry))
  }

  fn state(&self) -> SyncState {
    *lock(&self.state)
  }

  fn set_state(&self, state: SyncState) {
    *lock(&self.state) = state;
  }

  /// State after a fetch that did not publish anything.
  fn settle(&self, degraded: bool) {
    let state = match (self.snapshot().is_populated(), degraded) {
      (true, _) => SyncState::Current,
      (false, true) => SyncState::Degraded,
      (false, false) => SyncState::Empty,
    };
    self.set_state(state);
  }

  fn try_begin(&self) -> bool {
    self
      .in_flight
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  fn is_busy(&self) -> bool {
    self.in_flight.load(Ordering::SeqCst)
      || self.queued.load(Ordering::SeqCst)
      || self.retry_pending.load(Ordering::SeqCst)
  }

  fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  /// Swap in `entry` unless the generation moved past `expected`.
  fn publish(&self, entry: CacheEntry<T>, expected: u64) -> bool {
    let mut current = write_lock(&self.entry);
    if self.generation() != expected {
      return false;
    }
    *current = Arc::new(entry);
    true
  }

  /// Drop data and cursor, invalidating any refresh in flight.
  fn reset(&self) {
    let mut current = write_lock(&self.entry);
    self.generation.fetch_add(1, Ordering::SeqCst);
    *current = Arc::new(CacheEntry::empty(Utc::now()));
    drop(current);
    self.failures.store(0, Ordering::SeqCst);
    self.set_state(SyncState::Empty);
  }

  fn touch(&self, now: DateTime<Utc>) {
    *lock(&self.last_access) = now;
  }

  fn last_access(&self) -> DateTime<Utc> {
    *lock(&self.last_access)
  }

  fn hydration_error(&self) -> Option<String> {
    lock(&self.hydration_error).clone()
  }
}

/// Clears the in-flight flag when a refresh ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

struct Shared<T> {
  kind: EntityKind,
  strategy: CacheStrategy,
  fetcher: FetcherFn<T>,
  ctx: CoordinatorContext,
  default_key: Option<CacheKey>,
  slots: RwLock<HashMap<CacheKey, Arc<KeySlot<T>>>>,
  requests: mpsc::Sender<CacheKey>,
}

impl<T: Record> Shared<T> {
  fn existing_slot(&self, key: &CacheKey) -> Option<Arc<KeySlot<T>>> {
    read_lock(&self.slots).get(key).cloned()
  }

  fn slot(&self, key: CacheKey) -> Arc<KeySlot<T>> {
    if let Some(slot) = self.existing_slot(&key) {
      return slot;
    }
    let mut slots = write_lock(&self.slots);
    Arc::clone(
      slots
        .entry(key)
        .or_insert_with(|| Arc::new(self.hydrate(key))),
    )
  }

  /// Build a slot for `key`, restoring its entry from storage if present.
  fn hydrate(&self, key: CacheKey) -> KeySlot<T> {
    let storage_key = key.storage_key(&self.ctx.budget_id);
    match read_json::<StoredEntry<T>>(self.ctx.storage.as_ref(), &storage_key) {
      Ok(Some(stored)) => {
        debug!(key = %key, records = stored.data.len(), "Restored cache entry from storage");
        KeySlot::new(key, stored.into(), None)
      }
      Ok(None) => KeySlot::new(key, CacheEntry::empty(Utc::now()), None),
      Err(e) => {
        warn!(key = %key, error = %e, "Failed to load cache entry from storage");
        KeySlot::new(key, CacheEntry::empty(Utc::now()), Some(e.to_string()))
      }
    }
  }

  /// Post a background refresh. Never blocks; a full queue drops the request.
  ///
  /// At most one request per key sits in the queue at a time.
  fn request(&self, slot: &KeySlot<T>) {
    if slot.queued.swap(true, Ordering::SeqCst) {
      return;
    }
    if let Err(e) = self.requests.try_send(slot.key) {
      slot.queued.store(false, Ordering::SeqCst);
      debug!(key = %slot.key, error = %e, "Refresh request not queued");
    }
  }

  fn read(self: &Arc<Self>, key: CacheKey) -> Result<Arc<CacheEntry<T>>, MirrorError> {
    let slot = self.slot(key);
    let now = Utc::now();
    let entry = slot.snapshot();
    entry.record_read();
    slot.touch(now);

    if self.strategy.should_refresh(&*entry, now) && !slot.is_busy() {
      debug!(key = %key, "Cached data is stale or missing - scheduling refresh");
      self.request(&slot);
    }

    if !entry.is_populated() {
      if let Some(err) = slot.hydration_error() {
        return Err(MirrorError::Storage(err));
      }
    }

    Ok(entry)
  }

  /// Post a refresh for `key` after `delay`, unless one is already scheduled.
  fn schedule(self: &Arc<Self>, slot: &KeySlot<T>, delay: Duration) {
    if slot.retry_pending.swap(true, Ordering::SeqCst) {
      return;
    }

    let weak = Arc::downgrade(self);
    let key = slot.key;
    tokio::spawn(async move {
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      if let Some(shared) = weak.upgrade() {
        if let Some(slot) = shared.existing_slot(&key) {
          slot.retry_pending.store(false, Ordering::SeqCst);
          shared.request(&slot);
        }
      }
    });
  }

  async fn refresh(self: &Arc<Self>, key: CacheKey, trigger: Trigger) -> Result<RefreshOutcome, MirrorError> {
    let slot = match trigger {
      Trigger::Explicit => self.slot(key),
      // Evicted keys stay evicted until read again
      Trigger::Background => match self.existing_slot(&key) {
        Some(slot) => slot,
        None => return Ok(RefreshOutcome::Discarded),
      },
    };

    if trigger == Trigger::Background {
      slot.queued.store(false, Ordering::SeqCst);
      // Another refresh may have landed since this one was posted
      if !self.strategy.should_refresh(&*slot.snapshot(), Utc::now()) {
        debug!(key = %key, "Cached data already fresh - skipping queued refresh");
        return Ok(RefreshOutcome::Coalesced);
      }
    }
    let mut conflicts = 0;

    loop {
      let span = info_span!("refresh", kind = %self.kind, month = ?key.month);
      let step = self.refresh_once(&slot, trigger).instrument(span).await;

      match step {
        Step::Done(result) => return result,
        Step::Retry(delay, result) => {
          self.schedule(&slot, delay);
          return result;
        }
        Step::Conflict => {
          conflicts += 1;
          if trigger == Trigger::Explicit && conflicts == 1 {
            // The entry is now empty, so the retry is a full fetch
            continue;
          }
          self.schedule(&slot, Duration::ZERO);
          return match trigger {
            Trigger::Background => Ok(RefreshOutcome::Reset),
            Trigger::Explicit => Err(MirrorError::Fetch(FetchError::Conflict)),
          };
        }
      }
    }
  }

  async fn refresh_once(&self, slot: &KeySlot<T>, trigger: Trigger) -> Step {
    if !slot.try_begin() {
      debug!("Refresh already in flight - coalescing");
      return Step::Done(Ok(RefreshOutcome::Coalesced));
    }
    let _in_flight = InFlight(&slot.in_flight);

    if let Err(wait) = self.ctx.limiter.try_acquire() {
      return match trigger {
        Trigger::Background => {
          debug!(retry_in = ?wait, "Remote quota exhausted - deferring refresh");
          Step::Retry(wait, Ok(RefreshOutcome::Deferred { retry_in: wait }))
        }
        Trigger::Explicit => Step::Done(Err(MirrorError::rate_limited(wait))),
      };
    }

    let generation = slot.generation();
    let current = slot.snapshot();
    let cursor = self.strategy.fetch_cursor(&*current);
    slot.set_state(SyncState::Syncing);

    match cursor {
      Some(c) => debug!(cursor = %c, "Starting delta fetch"),
      None => info!("Starting full fetch"),
    }

    let result = (self.fetcher)(slot.key, cursor).await;

    match result {
      Ok(delta) => self.publish(slot, &*current, delta, generation),
      Err(FetchError::Conflict) => {
        slot.set_state(SyncState::Degraded);
        warn!(cursor = ?cursor, "Remote rejected cursor - discarding cached data for a full refetch");
        slot.reset();
        self.delete_stored(slot.key);
        Step::Conflict
      }
      Err(err) => {
        let failures = slot.failures.fetch_add(1, Ordering::SeqCst) + 1;
        slot.settle(!err.is_retryable());
        let delay = self.ctx.backoff.delay(failures);
        if err.is_retryable() {
          warn!(error = %err, failures, retry_in = ?delay, "Refresh failed - serving cached data");
        } else {
          error!(error = %err, failures, retry_in = ?delay, "Refresh failed - serving cached data");
        }
        let result = match trigger {
          Trigger::Background => Ok(RefreshOutcome::Failed),
          Trigger::Explicit => Err(MirrorError::Fetch(err)),
        };
        Step::Retry(delay, result)
      }
    }
  }

  fn publish(&self, slot: &KeySlot<T>, current: &CacheEntry<T>, delta: Delta<T>, generation: u64) -> Step {
    let fetched = delta.records.len();
    let now = Utc::now();
    let applied = self.strategy.apply(current, delta, now);

    for orphan in &applied.orphans {
      warn!(
        record = %orphan.record_id,
        parent = %orphan.parent_id,
        "Record references an unknown parent - kept under a placeholder"
      );
    }

    let records = applied.entry.data.len();
    let cursor = applied.entry.cursor;
    let stored = applied.entry.to_stored();

    if !slot.publish(applied.entry, generation) {
      debug!("Discarding refresh superseded by invalidation");
      slot.settle(false);
      return Step::Done(Ok(RefreshOutcome::Discarded));
    }

    slot.failures.store(0, Ordering::SeqCst);
    *lock(&slot.hydration_error) = None;
    slot.set_state(SyncState::Current);
    self.ctx.clock.record(now);

    let storage_key = slot.key.storage_key(&self.ctx.budget_id);
    match write_json(self.ctx.storage.as_ref(), &storage_key, &stored) {
      Ok(()) => {
        // An invalidation may have landed between the swap and the write
        if slot.generation() != generation {
          self.delete_stored(slot.key);
        }
      }
      Err(e) => warn!(error = %e, "Failed to persist cache entry - keeping in-memory copy"),
    }

    info!(fetched, records, cursor = ?cursor, "Refresh complete");
    Step::Done(Ok(RefreshOutcome::Merged { records, cursor }))
  }

  fn delete_stored(&self, key: CacheKey) -> Option<MirrorError> {
    let storage_key = key.storage_key(&self.ctx.budget_id);
    match self.ctx.storage.delete(&storage_key) {
      Ok(()) => None,
      Err(e) => {
        warn!(key = %key, error = %e, "Failed to delete stored cache entry");
        Some(MirrorError::storage(e))
      }
    }
  }
}

/// Background sync driver for one entity kind.
pub struct SyncCoordinator<T: Record> {
  shared: Arc<Shared<T>>,
  worker: JoinHandle<()>,
}

impl<T: Record> SyncCoordinator<T> {
  /// Create a coordinator and start its refresh worker.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(kind: EntityKind, strategy: CacheStrategy, fetcher: FetcherFn<T>, ctx: CoordinatorContext) -> Self {
    let (tx, rx) = mpsc::channel(ctx.queue_capacity.max(1));
    let default_key = if kind.is_monthly() {
      None
    } else {
      Some(CacheKey::of(kind))
    };

    let shared = Arc::new(Shared {
      kind,
      strategy,
      fetcher,
      ctx,
      default_key,
      slots: RwLock::new(HashMap::new()),
      requests: tx,
    });

    let worker = tokio::spawn(run_worker(Arc::downgrade(&shared), rx));

    Self { shared, worker }
  }

  pub fn kind(&self) -> EntityKind {
    self.shared.kind
  }

  pub fn strategy(&self) -> CacheStrategy {
    self.shared.strategy
  }

  /// Current entry for `key`, scheduling a background refresh when stale.
  ///
  /// Never waits on the network. Fails only when nothing is cached for the
  /// key and restoring it from storage failed.
  pub fn read(&self, key: CacheKey) -> Result<Arc<CacheEntry<T>>, MirrorError> {
    self.shared.read(key)
  }

  /// Whether a slot exists for `key`.
  pub fn contains(&self, key: &CacheKey) -> bool {
    self.shared.existing_slot(key).is_some()
  }

  pub fn state(&self, key: &CacheKey) -> Option<SyncState> {
    self.shared.existing_slot(key).map(|slot| slot.state())
  }

  /// Refresh `key` now and report the outcome.
  pub async fn refresh(&self, key: CacheKey) -> Result<RefreshOutcome, MirrorError> {
    self.shared.refresh(key, Trigger::Explicit).await
  }

  /// Refresh every cached key of this kind concurrently.
  ///
  /// Kinds with a single key refresh it even if it was never read.
  pub async fn refresh_cached(&self) -> Result<Vec<RefreshOutcome>, MirrorError> {
    let mut keys: Vec<CacheKey> = read_lock(&self.shared.slots).keys().copied().collect();
    if keys.is_empty() {
      keys.extend(self.shared.default_key);
    }

    join_all(
      keys
        .into_iter()
        .map(|key| self.shared.refresh(key, Trigger::Explicit)),
    )
    .await
    .into_iter()
    .collect()
  }

  /// Force every key of this kind back to empty.
  ///
  /// Refreshes already in flight complete but their results are discarded.
  pub fn invalidate(&self) -> Result<(), MirrorError> {
    let slots: Vec<Arc<KeySlot<T>>> = read_lock(&self.shared.slots).values().cloned().collect();
    let mut first_error = None;

    for slot in slots {
      slot.reset();
      if let Some(err) = self.shared.delete_stored(slot.key) {
        first_error.get_or_insert(err);
      }
    }

    // Keys never read this process may still be persisted
    match self.shared.default_key {
      Some(key) => {
        if !self.contains(&key) {
          if let Some(err) = self.shared.delete_stored(key) {
            first_error.get_or_insert(err);
          }
        }
      }
      None => {
        let prefix = CacheKey::monthly_prefix(self.shared.kind, &self.shared.ctx.budget_id);
        match self.shared.ctx.storage.clear_by_prefix(&prefix) {
          Ok(cleared) => debug!(prefix = %prefix, cleared, "Cleared stored entries"),
          Err(e) => {
            warn!(prefix = %prefix, error = %e, "Failed to clear stored cache entries");
            first_error.get_or_insert(MirrorError::storage(e));
          }
        }
      }
    }

    info!(kind = %self.shared.kind, "Cache invalidated");
    first_error.map_or(Ok(()), Err)
  }

  /// Remove keys from the cache and storage entirely.
  pub fn evict(&self, keys: &[CacheKey]) {
    let mut slots = write_lock(&self.shared.slots);
    for key in keys {
      if let Some(slot) = slots.remove(key) {
        slot.reset();
        self.shared.delete_stored(*key);
        debug!(key = %key, "Evicted cache entry");
      }
    }
  }

  /// Cached keys with the time they were last read.
  pub fn keys_by_access(&self) -> Vec<(CacheKey, DateTime<Utc>)> {
    read_lock(&self.shared.slots)
      .values()
      .map(|slot| (slot.key, slot.last_access()))
      .collect()
  }

  /// Whether any key of this kind is stale or was never loaded.
  pub fn needs_sync(&self) -> bool {
    let slots = read_lock(&self.shared.slots);
    if slots.is_empty() {
      return self.shared.default_key.is_some();
    }
    let now = Utc::now();
    slots
      .values()
      .any(|slot| self.shared.strategy.should_refresh(&*slot.snapshot(), now))
  }

  pub fn is_populated(&self) -> bool {
    read_lock(&self.shared.slots)
      .values()
      .any(|slot| slot.snapshot().is_populated())
  }

  pub fn status(&self) -> Vec<KeyStatus> {
    read_lock(&self.shared.slots)
      .values()
      .map(|slot| {
        let entry = slot.snapshot();
        KeyStatus {
          kind: slot.key.kind,
          month: slot.key.month,
          state: slot.state(),
          cursor: entry.cursor,
          records: entry.data.len(),
          access_count: entry.access_count(),
          last_refreshed_at: entry.last_refreshed_at,
          consecutive_failures: slot.failures.load(Ordering::SeqCst),
          in_flight: slot.in_flight.load(Ordering::SeqCst),
        }
      })
      .collect()
  }

  /// Stop the refresh worker. Reads keep serving cached data.
  pub fn shutdown(&self) {
    self.worker.abort();
  }
}

impl<T: Record> Drop for SyncCoordinator<T> {
  fn drop(&mut self) {
    self.worker.abort();
  }
}

async fn run_worker<T: Record>(shared: Weak<Shared<T>>, mut rx: mpsc::Receiver<CacheKey>) {
  while let Some(key) = rx.recv().await {
    let Some(shared) = shared.upgrade() else {
      break;
    };
    tokio::spawn(async move {
      // Outcomes are logged inside; background failures never reach readers
      let _ = shared.refresh(key, Trigger::Background).await;
    });
  }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
  lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
  lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::ledger::Account;
  use color_eyre::eyre::eyre;
  use std::collections::VecDeque;
  use tokio::sync::Notify;

  type Calls = Arc<Mutex<Vec<Option<Cursor>>>>;

  fn account(id: &str, deleted: bool) -> Account {
    Account {
      id: id.to_string(),
      name: format!("Account {}", id),
      deleted,
      ..Default::default()
    }
  }

  fn ids(entry: &CacheEntry<Account>) -> Vec<&str> {
    entry.data.iter().map(|a| a.id.as_str()).collect()
  }

  fn context(storage: Arc<dyn CacheStorage>, max_calls: usize) -> CoordinatorContext {
    CoordinatorContext {
      budget_id: Arc::from("b1"),
      storage,
      limiter: Arc::new(RateLimiter::new(max_calls, Duration::from_secs(3600))),
      clock: Arc::new(SyncClock::default()),
      // Long enough that scheduled retries never fire during a test
      backoff: Backoff::new(Duration::from_secs(600), Duration::from_secs(600), Duration::ZERO),
      queue_capacity: 16,
    }
  }

  /// Fetcher answering from a queue of responses, optionally waiting on a
  /// gate before answering. An exhausted queue answers with an empty delta.
  fn scripted(
    responses: Vec<Result<Delta<Account>, FetchError>>,
    gate: Option<Arc<Notify>>,
  ) -> (FetcherFn<Account>, Calls) {
    let responses = Arc::new(Mutex::new(VecDeque::from(responses)));
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);

    let f = fetcher(move |_key, cursor| {
      let responses = Arc::clone(&responses);
      let calls = Arc::clone(&recorded);
      let gate = gate.clone();
      async move {
        calls.lock().unwrap().push(cursor);
        if let Some(gate) = gate {
          gate.notified().await;
        }
        let next = responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Delta::new(Vec::new(), cursor.unwrap_or(Cursor(0)))))
      }
    });
    (f, calls)
  }

  fn coordinator(fetch: FetcherFn<Account>, ctx: CoordinatorContext) -> SyncCoordinator<Account> {
    let strategy = CacheStrategy::Structural {
      ttl: chrono::Duration::minutes(30),
    };
    SyncCoordinator::new(EntityKind::Accounts, strategy, fetch, ctx)
  }

  async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
  }

  struct FailingStorage;

  impl CacheStorage for FailingStorage {
    fn get(&self, _key: &str) -> color_eyre::Result<Option<Vec<u8>>> {
      Err(eyre!("disk unavailable"))
    }
    fn set(&self, _key: &str, _value: &[u8]) -> color_eyre::Result<()> {
      Err(eyre!("disk unavailable"))
    }
    fn delete(&self, _key: &str) -> color_eyre::Result<()> {
      Ok(())
    }
    fn clear_by_prefix(&self, _prefix: &str) -> color_eyre::Result<usize> {
      Ok(0)
    }
  }

  #[tokio::test]
  async fn test_refresh_merges_and_persists() {
    let storage = Arc::new(MemoryStorage::new());
    let (f, calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false), account("a2", false)], Cursor(42)))],
      None,
    );
    let c = coordinator(f, context(storage.clone(), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    let outcome = c.refresh(key).await.unwrap();
    assert_eq!(
      outcome,
      RefreshOutcome::Merged {
        records: 2,
        cursor: Some(Cursor(42))
      }
    );
    assert_eq!(*calls.lock().unwrap(), vec![None]);

    let entry = c.read(key).unwrap();
    assert_eq!(ids(&entry), vec!["a1", "a2"]);
    assert_eq!(entry.cursor, Some(Cursor(42)));
    assert_eq!(c.state(&key), Some(SyncState::Current));

    let stored: StoredEntry<Account> = read_json(storage.as_ref(), "b1:accounts").unwrap().unwrap();
    assert_eq!(stored.cursor, Some(Cursor(42)));
    assert_eq!(stored.data.len(), 2);
  }

  #[tokio::test]
  async fn test_delta_fetch_sends_cursor_and_applies_tombstones() {
    let (f, calls) = scripted(
      vec![
        Ok(Delta::new(vec![account("a1", false), account("a2", false)], Cursor(42))),
        Ok(Delta::new(vec![account("a1", true)], Cursor(43))),
      ],
      None,
    );
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    c.refresh(key).await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![None, Some(Cursor(42))]);
    let entry = c.read(key).unwrap();
    assert_eq!(ids(&entry), vec!["a2"]);
    assert_eq!(entry.cursor, Some(Cursor(43)));
  }

  #[tokio::test]
  async fn test_stale_cursor_from_remote_does_not_move_cursor_back() {
    let (f, _calls) = scripted(
      vec![
        Ok(Delta::new(vec![account("a1", false)], Cursor(42))),
        Ok(Delta::new(Vec::new(), Cursor(40))),
      ],
      None,
    );
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    c.refresh(key).await.unwrap();

    assert_eq!(c.read(key).unwrap().cursor, Some(Cursor(42)));
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_coalesce_into_one_fetch() {
    let gate = Arc::new(Notify::new());
    let (f, calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false)], Cursor(1)))],
      Some(gate.clone()),
    );
    let c = Arc::new(coordinator(f, context(Arc::new(MemoryStorage::new()), 0)));
    let key = CacheKey::of(EntityKind::Accounts);

    let first = tokio::spawn({
      let c = Arc::clone(&c);
      async move { c.refresh(key).await }
    });
    wait_until(|| calls.lock().unwrap().len() == 1).await;

    assert_eq!(c.state(&key), Some(SyncState::Syncing));
    assert_eq!(c.refresh(key).await.unwrap(), RefreshOutcome::Coalesced);

    // Readers see the previous (empty) entry while the fetch is in flight
    assert!(!c.read(key).unwrap().is_populated());

    gate.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, RefreshOutcome::Merged { records: 1, .. }));
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_conflict_discards_cache_and_refetches_in_full() {
    let storage = Arc::new(MemoryStorage::new());
    let (f, calls) = scripted(
      vec![
        Ok(Delta::new(vec![account("a1", false)], Cursor(5))),
        Err(FetchError::Conflict),
        Ok(Delta::new(vec![account("a2", false)], Cursor(9))),
      ],
      None,
    );
    let c = coordinator(f, context(storage.clone(), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    let outcome = c.refresh(key).await.unwrap();

    assert_eq!(
      outcome,
      RefreshOutcome::Merged {
        records: 1,
        cursor: Some(Cursor(9))
      }
    );
    assert_eq!(*calls.lock().unwrap(), vec![None, Some(Cursor(5)), None]);
    assert_eq!(ids(&c.read(key).unwrap()), vec!["a2"]);
    let stored: StoredEntry<Account> = read_json(storage.as_ref(), "b1:accounts").unwrap().unwrap();
    assert_eq!(stored.cursor, Some(Cursor(9)));
  }

  #[tokio::test]
  async fn test_transient_failure_keeps_cached_data() {
    let (f, _calls) = scripted(
      vec![
        Ok(Delta::new(vec![account("a1", false)], Cursor(5))),
        Err(FetchError::Transient("Status 503: unavailable".to_string())),
      ],
      None,
    );
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    let err = c.refresh(key).await.unwrap_err();
    assert!(matches!(err, MirrorError::Fetch(FetchError::Transient(_))));

    let entry = c.read(key).unwrap();
    assert_eq!(ids(&entry), vec!["a1"]);
    assert_eq!(entry.cursor, Some(Cursor(5)));
    assert_eq!(c.state(&key), Some(SyncState::Current));

    let status = c.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].consecutive_failures, 1);
  }

  #[tokio::test]
  async fn test_failure_without_data_degrades() {
    let (f, _calls) = scripted(vec![Err(FetchError::Other("Status 400: bad".to_string()))], None);
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    assert!(c.refresh(key).await.is_err());
    assert_eq!(c.state(&key), Some(SyncState::Degraded));
    assert!(c.read(key).unwrap().data.is_empty());
  }

  #[tokio::test]
  async fn test_invalidate_discards_in_flight_result() {
    let gate = Arc::new(Notify::new());
    let (f, calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false)], Cursor(1)))],
      Some(gate.clone()),
    );
    let c = Arc::new(coordinator(f, context(Arc::new(MemoryStorage::new()), 0)));
    let key = CacheKey::of(EntityKind::Accounts);

    let pending = tokio::spawn({
      let c = Arc::clone(&c);
      async move { c.refresh(key).await }
    });
    wait_until(|| calls.lock().unwrap().len() == 1).await;

    c.invalidate().unwrap();
    gate.notify_one();

    assert_eq!(pending.await.unwrap().unwrap(), RefreshOutcome::Discarded);
    assert!(!c.read(key).unwrap().is_populated());
    assert_eq!(c.state(&key), Some(SyncState::Empty));
  }

  #[tokio::test]
  async fn test_read_on_empty_returns_immediately_and_schedules_fetch() {
    let (f, calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false)], Cursor(3)))],
      None,
    );
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    let entry = c.read(key).unwrap();
    assert!(entry.data.is_empty());
    assert!(c.needs_sync());

    wait_until(|| c.is_populated()).await;
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(!c.needs_sync());
  }

  #[tokio::test]
  async fn test_repeated_reads_on_empty_key_fetch_once() {
    let (f, calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false)], Cursor(1)))],
      None,
    );
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    for _ in 0..5 {
      assert!(c.read(key).unwrap().data.is_empty());
    }

    wait_until(|| c.is_populated()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*calls.lock().unwrap(), vec![None]);
  }

  #[tokio::test]
  async fn test_scheduled_retry_skipped_once_entry_is_fresh() {
    let (f, calls) = scripted(
      vec![
        Err(FetchError::Transient("Status 503: unavailable".to_string())),
        Ok(Delta::new(vec![account("a1", false)], Cursor(1))),
      ],
      None,
    );
    let ctx = CoordinatorContext {
      backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(20), Duration::ZERO),
      ..context(Arc::new(MemoryStorage::new()), 0)
    };
    let c = coordinator(f, ctx);
    let key = CacheKey::of(EntityKind::Accounts);

    assert!(c.refresh(key).await.is_err());
    assert!(matches!(c.refresh(key).await.unwrap(), RefreshOutcome::Merged { records: 1, .. }));

    // The retry from the first failure fires but finds nothing to do
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*calls.lock().unwrap(), vec![None, None]);
    assert_eq!(c.state(&key), Some(SyncState::Current));
  }

  #[tokio::test]
  async fn test_explicit_refresh_reports_exhausted_quota() {
    let (f, calls) = scripted(Vec::new(), None);
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 1));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    let err = c.refresh(key).await.unwrap_err();

    assert!(matches!(err, MirrorError::RateLimited { retry_after_secs } if retry_after_secs > 0));
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_background_refresh_defers_when_quota_exhausted() {
    let (f, calls) = scripted(Vec::new(), None);
    let c = coordinator(f, context(Arc::new(MemoryStorage::new()), 1));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    c.invalidate().unwrap();

    // Empty again, so the read asks for a refresh the quota cannot cover
    assert!(c.read(key).unwrap().data.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(c.read(key).is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(c.state(&key), Some(SyncState::Empty));
  }

  #[tokio::test]
  async fn test_hydrates_from_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let stored = CacheEntry::merged(
      &CacheEntry::empty(Utc::now()),
      vec![account("a1", false)],
      Cursor(7),
      Utc::now(),
    )
    .to_stored();
    write_json(storage.as_ref(), "b1:accounts", &stored).unwrap();

    let (f, calls) = scripted(Vec::new(), None);
    let c = coordinator(f, context(storage, 0));
    let key = CacheKey::of(EntityKind::Accounts);

    let entry = c.read(key).unwrap();
    assert_eq!(ids(&entry), vec!["a1"]);
    assert_eq!(c.state(&key), Some(SyncState::Current));

    c.refresh(key).await.unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![Some(Cursor(7))]);
  }

  #[tokio::test]
  async fn test_unreadable_storage_fails_read_until_fetch_succeeds() {
    let (f, _calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false)], Cursor(1)))],
      None,
    );
    let c = coordinator(f, context(Arc::new(FailingStorage), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    let err = c.read(key).unwrap_err();
    assert!(matches!(err, MirrorError::Storage(ref msg) if msg.contains("disk unavailable")));

    // Persisting fails too, but the merged data is still served
    c.refresh(key).await.unwrap();
    assert_eq!(ids(&c.read(key).unwrap()), vec!["a1"]);
  }

  #[tokio::test]
  async fn test_evict_removes_slot_and_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let (f, _calls) = scripted(
      vec![Ok(Delta::new(vec![account("a1", false)], Cursor(1)))],
      None,
    );
    let c = coordinator(f, context(storage.clone(), 0));
    let key = CacheKey::of(EntityKind::Accounts);

    c.refresh(key).await.unwrap();
    assert!(storage.get("b1:accounts").unwrap().is_some());

    c.evict(&[key]);
    assert!(!c.contains(&key));
    assert!(storage.get("b1:accounts").unwrap().is_none());
  }

  #[test]
  fn test_sync_clock_only_moves_forward() {
    let clock = SyncClock::default();
    let later = Utc::now();
    let earlier = later - chrono::Duration::minutes(5);

    clock.record(later);
    clock.record(earlier);
    assert_eq!(clock.last(), Some(later));
  }
}
