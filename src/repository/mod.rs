//! Persistence seam.
//!
//! The engine talks to storage through narrow, per-entity repository traits;
//! the ORM/schema behind them is an external collaborator. Each write call is
//! atomic at row level, which is all the reconciler requires: a concurrent
//! reader may observe a chunk mid-write but never a half-written row.

use crate::model::*;
use async_trait::async_trait;

/// Backing-store implementation over in-memory maps
pub mod memory;

pub use memory::MemoryRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
	#[error("storage backend error: {0}")]
	Backend(String),

	#[error("wallet {0} not found")]
	WalletNotFound(WalletId),
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
	async fn find(&self, id: &str) -> Result<Option<Wallet>, RepositoryError>;
	async fn list(&self) -> Result<Vec<Wallet>, RepositoryError>;
	/// Upsert the full wallet row.
	async fn save(&self, wallet: Wallet) -> Result<(), RepositoryError>;
	async fn set_sync_in_progress(&self, id: &str, value: bool) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AddressRepository: Send + Sync {
	async fn for_wallet(&self, wallet_id: &str) -> Result<Vec<WalletAddress>, RepositoryError>;
	/// Cursor-paged walk over all addresses, ordered by address string.
	/// `after` is the last address of the previous page.
	async fn page(
		&self,
		after: Option<&str>,
		limit: usize,
	) -> Result<Vec<WalletAddress>, RepositoryError>;
	async fn wallet_for_address(&self, address: &str)
	-> Result<Option<WalletId>, RepositoryError>;
	async fn mark_used(&self, wallet_id: &str, address: &str) -> Result<(), RepositoryError>;
	async fn insert(&self, address: WalletAddress) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
	/// Txids already persisted for this wallet, across all directions.
	async fn known_txids(
		&self,
		wallet_id: &str,
	) -> Result<std::collections::HashSet<String>, RepositoryError>;

	/// Insert a transaction with its children. Duplicate-safe on
	/// (wallet_id, txid, direction): an existing row makes this a no-op and
	/// returns `None`, otherwise the assigned row id is returned.
	async fn insert(
		&self,
		tx: WalletTransaction,
		inputs: Vec<TxInputRecord>,
		outputs: Vec<TxOutputRecord>,
	) -> Result<Option<u64>, RepositoryError>;

	/// All transactions of a wallet in insertion order.
	async fn list_for_wallet(
		&self,
		wallet_id: &str,
	) -> Result<Vec<WalletTransaction>, RepositoryError>;

	async fn set_confirmations(&self, row_id: u64, confirmations: u32)
	-> Result<(), RepositoryError>;

	async fn set_balance_after(&self, row_id: u64, balance: i64) -> Result<(), RepositoryError>;

	/// Unconfirmed transactions still marked RBF-active.
	async fn pending_active(
		&self,
		wallet_id: &str,
	) -> Result<Vec<WalletTransaction>, RepositoryError>;

	async fn mark_replaced(&self, row_id: u64) -> Result<(), RepositoryError>;

	async fn inputs_for_tx(
		&self,
		wallet_id: &str,
		txid: &str,
	) -> Result<Vec<TxInputRecord>, RepositoryError>;
}

#[async_trait]
pub trait UtxoRepository: Send + Sync {
	async fn for_wallet(&self, wallet_id: &str) -> Result<Vec<WalletUtxo>, RepositoryError>;

	/// Insert or refresh a UTXO keyed by (txid, vout). Existing rows only
	/// have confirmations and height updated; `spent` is never un-set here.
	async fn upsert(&self, utxo: WalletUtxo) -> Result<(), RepositoryError>;

	/// Returns whether the row existed and was newly marked spent.
	async fn mark_spent(&self, outpoint: &OutPoint) -> Result<bool, RepositoryError>;
}

/// Collaborator owning transaction-construction drafts. When reconciliation
/// discovers that a draft's locked inputs were spent on-chain, the draft is
/// stale and must be deleted.
#[async_trait]
pub trait DraftInvalidator: Send + Sync {
	/// Delete drafts locking any of `outpoints`. Returns how many were
	/// removed.
	async fn invalidate_drafts_locking(
		&self,
		wallet_id: &str,
		outpoints: &[OutPoint],
	) -> Result<usize, RepositoryError>;
}
