//! Normalized chain-data value types.
//!
//! Different server implementations disagree on response shapes (a single
//! `address` field here, an `addresses` array there). The protocol adapter
//! producing these types resolves that variance once, at the boundary.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
	#[error("not connected to chain-data source")]
	NotConnected,

	#[error("transport error: {0}")]
	Transport(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("operation not supported by this server: {0}")]
	Unsupported(String),
}

/// One entry of an address history: a transaction that touched the address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
	pub txid: String,
	/// Confirmation height; `None` while the transaction sits in the mempool.
	pub height: Option<u32>,
}

/// A transaction input as the chain reports it: a reference to the previous
/// output it spends. Address and value are resolved through the prevout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTxIn {
	pub prev_txid: String,
	pub prev_vout: u32,
}

/// A transaction output, normalized to at most one address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTxOut {
	pub value_sat: u64,
	/// `None` for outputs with no decodable address (e.g. OP_RETURN).
	pub address: Option<String>,
}

/// A transaction in normalized verbose form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTransaction {
	pub txid: String,
	pub inputs: Vec<ChainTxIn>,
	pub outputs: Vec<ChainTxOut>,
	pub block_height: Option<u32>,
	pub block_time: Option<i64>,
}

impl ChainTransaction {
	pub fn total_output_sat(&self) -> u64 {
		self.outputs.iter().map(|o| o.value_sat).sum()
	}
}

/// An unspent output as the chain-data source reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUtxo {
	pub txid: String,
	pub vout: u32,
	pub value_sat: u64,
	pub height: Option<u32>,
}

/// Asynchronous notifications delivered over a subscribed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainNotification {
	/// A new block was found; `height` is the new tip.
	NewBlock { height: u32 },
	/// Activity was observed on a subscribed address.
	AddressActivity { address: String },
}
