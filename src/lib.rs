//! Blockchain synchronization engine for Bitcoin wallets.
//!
//! Keeps wallet transaction, UTXO and balance state in line with a
//! chain-data source, across any number of cooperating processes:
//!
//! - `lock`: fencing-token distributed locks with a local fallback store
//! - `scheduler`: priority job queue and lock-guarded sync execution
//! - `sync`: the idempotent per-wallet reconciliation pass
//! - `subscription`: real-time header/address notifications under a
//!   cross-process ownership lock
//! - `chain`, `repository`, `events`: the collaborator seams (chain-data
//!   client, persistence, event emission)

pub mod chain;
pub mod config;
pub mod deadletter;
pub mod events;
pub mod lock;
pub mod model;
pub mod repository;
pub mod scheduler;
pub mod subscription;
pub mod sync;
