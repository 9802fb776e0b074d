//! Distributed mutual exclusion.
//!
//! A named, TTL-bounded lock backed by a shared store, with a transparent
//! in-process fallback when the shared store is unavailable. Ownership is
//! proven solely by token equality: release and extend are compare-and-delete
//! / compare-and-extend, so a lock that expired and was re-acquired elsewhere
//! is never disturbed by a late caller.

/// Lock acquisition and lifecycle management
pub mod manager;
/// Backend contract plus the in-memory store
pub mod store;

pub use manager::{LockHandle, LockManager, LockOrigin};
pub use store::{LockError, LockStore, MemoryLockStore};
