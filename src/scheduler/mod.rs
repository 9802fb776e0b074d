//! Priority job scheduling for wallet syncs.
//!
//! - `queue`: bounded priority queue with dedupe and backpressure, behind the
//!   `JobBackend` seam
//! - `runner`: the dispatch loop, lock-guarded execution, retry policy and
//!   staleness sweep

pub mod queue;
pub mod runner;

pub use queue::{JobBackend, MemoryJobBackend, PushOutcome, SyncQueue};
pub use runner::{SyncRequester, SyncScheduler};
