//! Chain state reconciliation.
//!
//! Turns raw chain data (address histories, transactions, UTXOs) into the
//! authoritative local view for one wallet. The algorithm is idempotent and
//! incremental: it can be re-run at any time, and a crash mid-sync loses at
//! most one chunk of progress.
//!
//! - `classify`: pure transaction classification and fee math
//! - `balance`: running-balance assignment over the ordered history
//! - `reconciler`: the orchestrating sync pass itself

/// Running-balance computation
pub mod balance;
/// Direction/fee classification of observed transactions
pub mod classify;
/// The per-wallet reconciliation pass
pub mod reconciler;

pub use reconciler::{
	AddressGenerator, NoopAddressGenerator, Reconciler, SyncError, SyncExecutor, SyncOutcome,
};
