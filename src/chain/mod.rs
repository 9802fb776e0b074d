//! Chain-data source boundary.
//!
//! The engine is a client of one external chain-data source per network
//! (a full node fronted by an Electrum-style server). Only the logical
//! operations are modeled here; the wire encoding lives behind the
//! [`ChainClient`] trait in whatever transport the embedding process
//! injects. Server responses are normalized into the value types of
//! [`types`] at this boundary so the reconciler never branches on
//! source-format variance.

/// The client contract and notification stream
pub mod client;
/// In-process simulated chain source for tests and demo wiring
pub mod memory;
/// Normalized chain-data value types
pub mod types;

pub use client::{ChainClient, NotificationStream};
pub use memory::MemoryChainClient;
pub use types::{
	ChainClientError, ChainNotification, ChainTransaction, ChainTxIn, ChainTxOut, HistoryItem,
	RemoteUtxo,
};
