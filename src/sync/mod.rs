//! Background synchronization of cached entity kinds with the remote source.

mod backoff;
mod coordinator;
mod rate_limit;
mod state;

pub use backoff::Backoff;
pub use coordinator::{
  fetcher, CoordinatorContext, FetcherFn, KeyStatus, RefreshOutcome, SyncClock, SyncCoordinator,
};
pub use rate_limit::RateLimiter;
pub use state::SyncState;
