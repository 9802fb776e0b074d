//! Real-time notification plumbing.
//!
//! - `manager`: ownership-locked connection lifecycle, header and address
//!   subscriptions, reconnect backoff, subscription reconciliation
//! - `confirmations`: confirmation-depth refresh driven by new blocks

pub mod confirmations;
pub mod manager;

pub use confirmations::ConfirmationRefresher;
pub use manager::SubscriptionManager;
