//! Core domain types shared across the sync engine.
//!
//! These mirror the persisted entities: wallets, their addresses, classified
//! transactions with input/output children, and the UTXO set. All amounts are
//! in satoshi; transaction amounts are signed (negative for outflows).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a wallet. Assigned externally when the wallet is created.
pub type WalletId = String;

/// Bitcoin network a wallet lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
	Mainnet,
	Testnet,
	Signet,
	Regtest,
}

impl std::fmt::Display for Network {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Network::Mainnet => "mainnet",
			Network::Testnet => "testnet",
			Network::Signet => "signet",
			Network::Regtest => "regtest",
		};
		f.write_str(s)
	}
}

/// Outcome of the most recent sync attempt, persisted on the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
	Synced,
	Failed,
}

/// A wallet row as seen by the sync engine.
///
/// The engine only mutates the sync-tracking fields; identity and network are
/// owned by wallet creation, which happens elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
	pub id: WalletId,
	pub network: Network,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub last_sync_status: Option<SyncStatus>,
	pub last_sync_error: Option<String>,
	/// Persisted for crash visibility only. The scheduler's in-memory running
	/// set is authoritative while the process is alive.
	pub sync_in_progress: bool,
}

impl Wallet {
	pub fn new(id: impl Into<WalletId>, network: Network) -> Self {
		Self {
			id: id.into(),
			network,
			last_synced_at: None,
			last_sync_status: None,
			last_sync_error: None,
			sync_in_progress: false,
		}
	}
}

/// An address belonging to exactly one wallet.
///
/// Immutable once created except for the `used` flag, which flips when chain
/// activity is first observed on the address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletAddress {
	pub wallet_id: WalletId,
	pub address: String,
	pub derivation_path: String,
	/// Index within the wallet's derivation sequence; drives gap-limit math.
	pub index: u32,
	pub used: bool,
}

/// Direction of a wallet transaction.
///
/// Classification priority during reconciliation is
/// consolidation > sent > received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxDirection {
	Received,
	Sent,
	Consolidation,
}

/// RBF status of a transaction. `Replaced` means a confirmed replacement
/// spent the same inputs and this transaction is no longer on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RbfStatus {
	Active,
	Replaced,
}

/// A classified wallet transaction. At most one row per
/// (wallet_id, txid, direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
	/// Monotonic row id assigned by the repository; breaks ordering ties for
	/// same-block and unconfirmed transactions.
	pub row_id: u64,
	pub wallet_id: WalletId,
	pub txid: String,
	pub direction: TxDirection,
	/// Signed amount in satoshi; negative for outflows.
	pub amount_sat: i64,
	/// Only stored for spend-type transactions with a plausible computed fee.
	pub fee_sat: Option<u64>,
	pub block_height: Option<u32>,
	pub block_time: Option<i64>,
	pub confirmations: u32,
	/// Running wallet balance after this transaction, assigned once per sync
	/// pass over the chronologically ordered history.
	pub balance_after: i64,
	pub rbf_status: RbfStatus,
	pub created_at: DateTime<Utc>,
}

/// How an output relates to the wallet that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
	Change,
	Recipient,
	Consolidation,
	Unknown,
}

/// Input child row of a [`WalletTransaction`]. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInputRecord {
	pub wallet_id: WalletId,
	pub txid: String,
	pub prev_txid: String,
	pub prev_vout: u32,
	pub address: Option<String>,
	pub amount_sat: Option<u64>,
	pub is_ours: bool,
}

/// Output child row of a [`WalletTransaction`]. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutputRecord {
	pub wallet_id: WalletId,
	pub txid: String,
	pub vout: u32,
	pub address: Option<String>,
	pub amount_sat: u64,
	pub kind: OutputKind,
	pub is_ours: bool,
}

/// A transaction output the wallet can (or once could) spend.
///
/// Keyed by (txid, vout). Never physically deleted: the chain is
/// authoritative, so retraction is expressed by the `spent` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletUtxo {
	pub wallet_id: WalletId,
	pub txid: String,
	pub vout: u32,
	pub address: String,
	pub amount_sat: u64,
	pub confirmations: u32,
	pub block_height: Option<u32>,
	pub spent: bool,
}

/// An outpoint reference (txid, vout).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
	pub txid: String,
	pub vout: u32,
}

impl OutPoint {
	pub fn new(txid: impl Into<String>, vout: u32) -> Self {
		Self {
			txid: txid.into(),
			vout,
		}
	}
}

/// Priority of a queued sync job. Ordered: `Low < Normal < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
	Low,
	Normal,
	High,
}

/// A sync job queued for a wallet. Lives only in scheduler memory; priority
/// may be upgraded while queued, never downgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
	pub wallet_id: WalletId,
	pub priority: SyncPriority,
	pub requested_at: DateTime<Utc>,
	pub retry_count: u32,
}

impl SyncJob {
	pub fn new(wallet_id: impl Into<WalletId>, priority: SyncPriority) -> Self {
		Self {
			wallet_id: wallet_id.into(),
			priority,
			requested_at: Utc::now(),
			retry_count: 0,
		}
	}
}

/// An operation that exhausted its retries, captured for operator replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
	pub id: u64,
	pub category: String,
	pub operation: String,
	pub payload: serde_json::Value,
	pub error: String,
	pub attempts: u32,
	pub first_failed_at: DateTime<Utc>,
	pub last_failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn priority_ordering_upgrades_only() {
		assert!(SyncPriority::High > SyncPriority::Normal);
		assert!(SyncPriority::Normal > SyncPriority::Low);
	}

	#[test]
	fn network_display() {
		assert_eq!(Network::Mainnet.to_string(), "mainnet");
		assert_eq!(Network::Regtest.to_string(), "regtest");
	}
}
