//! The chain-data client contract.

use crate::chain::types::*;
use async_trait::async_trait;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Stream of asynchronous notifications from a subscribed connection.
pub type NotificationStream = Pin<Box<dyn Stream<Item = ChainNotification> + Send>>;

/// Logical operations against one chain-data source.
///
/// Batched calls are a single round trip and fail whole-batch: when a batch
/// errors, callers fall back to the per-item form so one bad address cannot
/// poison the rest. Address subscriptions are a capability some servers
/// lack; probe [`supports_address_subscriptions`](Self::supports_address_subscriptions)
/// before relying on them.
#[async_trait]
pub trait ChainClient: Send + Sync {
	async fn connect(&self) -> Result<(), ChainClientError>;

	/// Protocol-version handshake. Best-effort: callers log and continue on
	/// failure.
	async fn server_version(&self) -> Result<String, ChainClientError>;

	/// Lightweight round trip used by health checks.
	async fn ping(&self) -> Result<(), ChainClientError>;

	async fn address_history(&self, address: &str) -> Result<Vec<HistoryItem>, ChainClientError>;

	async fn address_history_batch(
		&self,
		addresses: &[String],
	) -> Result<HashMap<String, Vec<HistoryItem>>, ChainClientError>;

	async fn transaction(&self, txid: &str) -> Result<ChainTransaction, ChainClientError>;

	async fn address_utxos(&self, address: &str) -> Result<Vec<RemoteUtxo>, ChainClientError>;

	async fn address_utxos_batch(
		&self,
		addresses: &[String],
	) -> Result<HashMap<String, Vec<RemoteUtxo>>, ChainClientError>;

	async fn broadcast(&self, raw_hex: &str) -> Result<String, ChainClientError>;

	/// Fee rate estimate in sat/vB for confirmation within `target_blocks`.
	async fn estimate_fee(&self, target_blocks: u16) -> Result<f64, ChainClientError>;

	async fn block_header(&self, height: u32) -> Result<String, ChainClientError>;

	/// Subscribe to new-block headers. Returns the current tip height.
	async fn subscribe_headers(&self) -> Result<u32, ChainClientError>;

	async fn subscribe_address(&self, address: &str) -> Result<(), ChainClientError>;

	async fn subscribe_address_batch(&self, addresses: &[String]) -> Result<(), ChainClientError>;

	/// Best-effort; servers without an unsubscribe verb simply forget the
	/// address client-side.
	async fn unsubscribe_address(&self, address: &str) -> Result<(), ChainClientError>;

	fn supports_address_subscriptions(&self) -> bool;

	/// A fresh stream of notifications for this connection.
	fn notifications(&self) -> NotificationStream;
}
