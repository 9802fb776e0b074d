//! In-memory repository, used by tests and the demo wiring.

use crate::model::*;
use crate::repository::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

struct Draft {
	id: u64,
	wallet_id: WalletId,
	locked: Vec<OutPoint>,
}

#[derive(Default)]
struct Inner {
	wallets: HashMap<WalletId, Wallet>,
	addresses: Vec<WalletAddress>,
	transactions: Vec<WalletTransaction>,
	tx_inputs: Vec<TxInputRecord>,
	tx_outputs: Vec<TxOutputRecord>,
	utxos: HashMap<OutPoint, WalletUtxo>,
	drafts: Vec<Draft>,
	next_row_id: u64,
	next_draft_id: u64,
}

/// One shared store implementing every repository trait.
#[derive(Default)]
pub struct MemoryRepository {
	inner: RwLock<Inner>,
}

impl MemoryRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a draft locking the given outpoints, for tests.
	pub fn add_draft(&self, wallet_id: &str, locked: Vec<OutPoint>) -> u64 {
		let mut inner = self.inner.write().unwrap();
		inner.next_draft_id += 1;
		let id = inner.next_draft_id;
		inner.drafts.push(Draft {
			id,
			wallet_id: wallet_id.to_string(),
			locked,
		});
		id
	}

	pub fn draft_count(&self) -> usize {
		self.inner.read().unwrap().drafts.len()
	}

	pub fn outputs_for_tx(&self, wallet_id: &str, txid: &str) -> Vec<TxOutputRecord> {
		self.inner
			.read()
			.unwrap()
			.tx_outputs
			.iter()
			.filter(|o| o.wallet_id == wallet_id && o.txid == txid)
			.cloned()
			.collect()
	}
}

#[async_trait]
impl WalletRepository for MemoryRepository {
	async fn find(&self, id: &str) -> Result<Option<Wallet>, RepositoryError> {
		Ok(self.inner.read().unwrap().wallets.get(id).cloned())
	}

	async fn list(&self) -> Result<Vec<Wallet>, RepositoryError> {
		let mut wallets: Vec<Wallet> =
			self.inner.read().unwrap().wallets.values().cloned().collect();
		wallets.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(wallets)
	}

	async fn save(&self, wallet: Wallet) -> Result<(), RepositoryError> {
		self.inner
			.write()
			.unwrap()
			.wallets
			.insert(wallet.id.clone(), wallet);
		Ok(())
	}

	async fn set_sync_in_progress(&self, id: &str, value: bool) -> Result<(), RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		match inner.wallets.get_mut(id) {
			Some(wallet) => {
				wallet.sync_in_progress = value;
				Ok(())
			}
			None => Err(RepositoryError::WalletNotFound(id.to_string())),
		}
	}
}

#[async_trait]
impl AddressRepository for MemoryRepository {
	async fn for_wallet(&self, wallet_id: &str) -> Result<Vec<WalletAddress>, RepositoryError> {
		let mut addresses: Vec<WalletAddress> = self
			.inner
			.read()
			.unwrap()
			.addresses
			.iter()
			.filter(|a| a.wallet_id == wallet_id)
			.cloned()
			.collect();
		addresses.sort_by_key(|a| a.index);
		Ok(addresses)
	}

	async fn page(
		&self,
		after: Option<&str>,
		limit: usize,
	) -> Result<Vec<WalletAddress>, RepositoryError> {
		let mut all: Vec<WalletAddress> = self.inner.read().unwrap().addresses.clone();
		all.sort_by(|a, b| a.address.cmp(&b.address));
		let page = all
			.into_iter()
			.filter(|a| match after {
				Some(cursor) => a.address.as_str() > cursor,
				None => true,
			})
			.take(limit)
			.collect();
		Ok(page)
	}

	async fn wallet_for_address(
		&self,
		address: &str,
	) -> Result<Option<WalletId>, RepositoryError> {
		Ok(self
			.inner
			.read()
			.unwrap()
			.addresses
			.iter()
			.find(|a| a.address == address)
			.map(|a| a.wallet_id.clone()))
	}

	async fn mark_used(&self, wallet_id: &str, address: &str) -> Result<(), RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		for a in inner.addresses.iter_mut() {
			if a.wallet_id == wallet_id && a.address == address {
				a.used = true;
			}
		}
		Ok(())
	}

	async fn insert(&self, address: WalletAddress) -> Result<(), RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		let exists = inner
			.addresses
			.iter()
			.any(|a| a.wallet_id == address.wallet_id && a.address == address.address);
		if !exists {
			inner.addresses.push(address);
		}
		Ok(())
	}
}

#[async_trait]
impl TransactionRepository for MemoryRepository {
	async fn known_txids(&self, wallet_id: &str) -> Result<HashSet<String>, RepositoryError> {
		Ok(self
			.inner
			.read()
			.unwrap()
			.transactions
			.iter()
			.filter(|t| t.wallet_id == wallet_id)
			.map(|t| t.txid.clone())
			.collect())
	}

	async fn insert(
		&self,
		mut tx: WalletTransaction,
		inputs: Vec<TxInputRecord>,
		outputs: Vec<TxOutputRecord>,
	) -> Result<Option<u64>, RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		let duplicate = inner.transactions.iter().any(|t| {
			t.wallet_id == tx.wallet_id && t.txid == tx.txid && t.direction == tx.direction
		});
		if duplicate {
			return Ok(None);
		}
		inner.next_row_id += 1;
		tx.row_id = inner.next_row_id;
		let row_id = tx.row_id;
		inner.transactions.push(tx);
		inner.tx_inputs.extend(inputs);
		inner.tx_outputs.extend(outputs);
		Ok(Some(row_id))
	}

	async fn list_for_wallet(
		&self,
		wallet_id: &str,
	) -> Result<Vec<WalletTransaction>, RepositoryError> {
		let mut txs: Vec<WalletTransaction> = self
			.inner
			.read()
			.unwrap()
			.transactions
			.iter()
			.filter(|t| t.wallet_id == wallet_id)
			.cloned()
			.collect();
		txs.sort_by_key(|t| t.row_id);
		Ok(txs)
	}

	async fn set_confirmations(
		&self,
		row_id: u64,
		confirmations: u32,
	) -> Result<(), RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		if let Some(tx) = inner.transactions.iter_mut().find(|t| t.row_id == row_id) {
			tx.confirmations = confirmations;
		}
		Ok(())
	}

	async fn set_balance_after(&self, row_id: u64, balance: i64) -> Result<(), RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		if let Some(tx) = inner.transactions.iter_mut().find(|t| t.row_id == row_id) {
			tx.balance_after = balance;
		}
		Ok(())
	}

	async fn pending_active(
		&self,
		wallet_id: &str,
	) -> Result<Vec<WalletTransaction>, RepositoryError> {
		Ok(self
			.inner
			.read()
			.unwrap()
			.transactions
			.iter()
			.filter(|t| {
				t.wallet_id == wallet_id
					&& t.confirmations == 0
					&& t.rbf_status == RbfStatus::Active
			})
			.cloned()
			.collect())
	}

	async fn mark_replaced(&self, row_id: u64) -> Result<(), RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		if let Some(tx) = inner.transactions.iter_mut().find(|t| t.row_id == row_id) {
			tx.rbf_status = RbfStatus::Replaced;
		}
		Ok(())
	}

	async fn inputs_for_tx(
		&self,
		wallet_id: &str,
		txid: &str,
	) -> Result<Vec<TxInputRecord>, RepositoryError> {
		Ok(self
			.inner
			.read()
			.unwrap()
			.tx_inputs
			.iter()
			.filter(|i| i.wallet_id == wallet_id && i.txid == txid)
			.cloned()
			.collect())
	}
}

#[async_trait]
impl UtxoRepository for MemoryRepository {
	async fn for_wallet(&self, wallet_id: &str) -> Result<Vec<WalletUtxo>, RepositoryError> {
		let mut utxos: Vec<WalletUtxo> = self
			.inner
			.read()
			.unwrap()
			.utxos
			.values()
			.filter(|u| u.wallet_id == wallet_id)
			.cloned()
			.collect();
		utxos.sort_by(|a, b| (&a.txid, a.vout).cmp(&(&b.txid, b.vout)));
		Ok(utxos)
	}

	async fn upsert(&self, utxo: WalletUtxo) -> Result<(), RepositoryError> {
		let key = OutPoint::new(utxo.txid.clone(), utxo.vout);
		let mut inner = self.inner.write().unwrap();
		match inner.utxos.get_mut(&key) {
			Some(existing) => {
				existing.confirmations = utxo.confirmations;
				existing.block_height = utxo.block_height;
			}
			None => {
				inner.utxos.insert(key, utxo);
			}
		}
		Ok(())
	}

	async fn mark_spent(&self, outpoint: &OutPoint) -> Result<bool, RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		match inner.utxos.get_mut(outpoint) {
			Some(utxo) if !utxo.spent => {
				utxo.spent = true;
				Ok(true)
			}
			_ => Ok(false),
		}
	}
}

#[async_trait]
impl DraftInvalidator for MemoryRepository {
	async fn invalidate_drafts_locking(
		&self,
		wallet_id: &str,
		outpoints: &[OutPoint],
	) -> Result<usize, RepositoryError> {
		let mut inner = self.inner.write().unwrap();
		let before = inner.drafts.len();
		inner.drafts.retain(|draft| {
			draft.wallet_id != wallet_id
				|| !draft.locked.iter().any(|op| outpoints.contains(op))
		});
		Ok(before - inner.drafts.len())
	}
}
