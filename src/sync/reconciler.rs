//! The per-wallet reconciliation pass.
//!
//! Fetches address histories, classifies and persists new transactions in
//! chunks, makes the remote UTXO set authoritative over the local one,
//! retracts replaced transactions, recomputes the running balance, and
//! expands the address gap when activity reaches the tail. Safe to re-run at
//! any time; each chunk's writes land before the next chunk starts.

use crate::chain::{ChainClient, ChainClientError, ChainTransaction, HistoryItem, RemoteUtxo};
use crate::config::SyncSettings;
use crate::events::{names, EventSink};
use crate::model::*;
use crate::repository::{
	AddressRepository, DraftInvalidator, RepositoryError, TransactionRepository, UtxoRepository,
	WalletRepository,
};
use crate::sync::balance::{chronological, running_balances};
use crate::sync::classify::{classify_output, classify_transaction, ResolvedInput};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("wallet {0} not found")]
	WalletNotFound(String),

	#[error("chain-data error: {0}")]
	Chain(#[from] ChainClientError),

	#[error("repository error: {0}")]
	Repository(#[from] RepositoryError),

	#[error("every address query failed for wallet {0}")]
	AllAddressQueriesFailed(String),
}

impl SyncError {
	/// Transient failures are retried by the scheduler's backoff policy.
	pub fn is_transient(&self) -> bool {
		!matches!(self, SyncError::WalletNotFound(_))
	}
}

/// Summary of one completed reconciliation.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
	pub new_transactions: usize,
	pub new_utxos: usize,
	pub spent_utxos: usize,
	pub replaced_transactions: usize,
	pub balance_sat: i64,
	pub balance_changed: bool,
}

/// Unit of work the scheduler drives. The reconciler is the production
/// implementation; tests substitute failing or counting executors.
#[async_trait]
pub trait SyncExecutor: Send + Sync {
	async fn sync_wallet(&self, wallet_id: &str) -> Result<SyncOutcome, SyncError>;
}

/// External collaborator that derives and persists further addresses for a
/// wallet when gap-limit expansion demands them.
#[async_trait]
pub trait AddressGenerator: Send + Sync {
	async fn generate(
		&self,
		wallet_id: &str,
		count: u32,
	) -> Result<Vec<WalletAddress>, RepositoryError>;
}

/// Generator for deployments without derivation wired in; never expands.
pub struct NoopAddressGenerator;

#[async_trait]
impl AddressGenerator for NoopAddressGenerator {
	async fn generate(
		&self,
		_wallet_id: &str,
		_count: u32,
	) -> Result<Vec<WalletAddress>, RepositoryError> {
		Ok(Vec::new())
	}
}

pub struct Reconciler {
	client: Arc<dyn ChainClient>,
	wallets: Arc<dyn WalletRepository>,
	addresses: Arc<dyn AddressRepository>,
	transactions: Arc<dyn TransactionRepository>,
	utxos: Arc<dyn UtxoRepository>,
	drafts: Arc<dyn DraftInvalidator>,
	address_gen: Arc<dyn AddressGenerator>,
	events: Arc<dyn EventSink>,
	settings: SyncSettings,
}

/// Result of one round of history/UTXO fetching over a set of addresses.
struct RoundState {
	/// Histories per successfully queried address.
	histories: HashMap<String, Vec<HistoryItem>>,
	/// Every txid referenced by this round's histories.
	seen_txids: HashSet<String>,
}

impl Reconciler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		client: Arc<dyn ChainClient>,
		wallets: Arc<dyn WalletRepository>,
		addresses: Arc<dyn AddressRepository>,
		transactions: Arc<dyn TransactionRepository>,
		utxos: Arc<dyn UtxoRepository>,
		drafts: Arc<dyn DraftInvalidator>,
		address_gen: Arc<dyn AddressGenerator>,
		events: Arc<dyn EventSink>,
		settings: SyncSettings,
	) -> Self {
		Self {
			client,
			wallets,
			addresses,
			transactions,
			utxos,
			drafts,
			address_gen,
			events,
			settings,
		}
	}

	async fn run(&self, wallet_id: &str) -> Result<SyncOutcome, SyncError> {
		let wallet = self
			.wallets
			.find(wallet_id)
			.await?
			.ok_or_else(|| SyncError::WalletNotFound(wallet_id.to_string()))?;

		let all_addresses = self.addresses.for_wallet(wallet_id).await?;
		let mut own: HashSet<String> =
			all_addresses.iter().map(|a| a.address.clone()).collect();

		let prior_balance = {
			let mut txs = self.transactions.list_for_wallet(wallet_id).await?;
			chronological(&mut txs);
			running_balances(&txs).1
		};

		let tip_height = self.client.subscribe_headers().await?;
		let mut prevout_cache: HashMap<String, ChainTransaction> = HashMap::new();
		let mut outcome = SyncOutcome::default();

		// First round covers every known address; each expansion round is
		// restricted to the freshly generated tail, bounded by depth.
		let mut targets = all_addresses;
		let mut depth = 0u32;
		loop {
			if targets.is_empty() {
				break;
			}
			self.sync_round(
				&wallet,
				&targets,
				&own,
				tip_height,
				&mut prevout_cache,
				&mut outcome,
			)
			.await?;

			match self.expand_gap(&wallet, depth).await? {
				Some(new_addresses) if !new_addresses.is_empty() => {
					own.extend(new_addresses.iter().map(|a| a.address.clone()));
					targets = new_addresses;
					depth += 1;
				}
				_ => break,
			}
		}

		let final_balance = self.recompute_balances(wallet_id).await?;
		outcome.balance_sat = final_balance;
		outcome.balance_changed = final_balance != prior_balance;
		if outcome.balance_changed {
			self.events
				.emit(
					names::BALANCE_CHANGED,
					json!({
						"walletId": wallet_id,
						"balanceSat": final_balance,
						"previousBalanceSat": prior_balance,
					}),
				)
				.await;
		}

		info!(
			"reconciled wallet {}: {} new txs, {} new utxos, {} spent, balance {}",
			wallet_id,
			outcome.new_transactions,
			outcome.new_utxos,
			outcome.spent_utxos,
			final_balance
		);
		Ok(outcome)
	}

	async fn sync_round(
		&self,
		wallet: &Wallet,
		targets: &[WalletAddress],
		own: &HashSet<String>,
		tip_height: u32,
		prevout_cache: &mut HashMap<String, ChainTransaction>,
		outcome: &mut SyncOutcome,
	) -> Result<(), SyncError> {
		let round = self.fetch_histories(wallet, targets).await?;

		for (address, history) in &round.histories {
			if !history.is_empty() {
				self.addresses.mark_used(&wallet.id, address).await?;
			}
		}

		self.process_new_transactions(wallet, &round, own, tip_height, prevout_cache, outcome)
			.await?;

		self.reconcile_utxos(wallet, targets, &round, tip_height, outcome)
			.await?;

		Ok(())
	}

	/// Fetch histories in batches, falling back to one-by-one queries for
	/// addresses a batch call failed on. Only a total failure aborts the
	/// sync; partial failure narrows this round's authority.
	async fn fetch_histories(
		&self,
		wallet: &Wallet,
		targets: &[WalletAddress],
	) -> Result<RoundState, SyncError> {
		let mut histories = HashMap::new();
		let mut history_ok = HashSet::new();

		for chunk in targets.chunks(self.settings.history_batch_size.max(1)) {
			let names: Vec<String> = chunk.iter().map(|a| a.address.clone()).collect();
			match self.client.address_history_batch(&names).await {
				Ok(batch) => {
					for (address, items) in batch {
						history_ok.insert(address.clone());
						histories.insert(address, items);
					}
				}
				Err(e) => {
					warn!(
						"batched history fetch failed for wallet {}, retrying one-by-one: {}",
						wallet.id, e
					);
					for address in &names {
						match self.client.address_history(address).await {
							Ok(items) => {
								history_ok.insert(address.clone());
								histories.insert(address.clone(), items);
							}
							Err(e) => {
								warn!("history fetch failed for {}: {}", address, e);
							}
						}
					}
				}
			}
		}

		if history_ok.is_empty() && !targets.is_empty() {
			return Err(SyncError::AllAddressQueriesFailed(wallet.id.clone()));
		}

		let seen_txids = histories
			.values()
			.flatten()
			.map(|item| item.txid.clone())
			.collect();

		Ok(RoundState {
			histories,
			seen_txids,
		})
	}

	/// Diff the round's txid union against persisted rows and classify,
	/// persist and announce the truly new transactions, chunk by chunk.
	async fn process_new_transactions(
		&self,
		wallet: &Wallet,
		round: &RoundState,
		own: &HashSet<String>,
		tip_height: u32,
		prevout_cache: &mut HashMap<String, ChainTransaction>,
		outcome: &mut SyncOutcome,
	) -> Result<(), SyncError> {
		let known = self.transactions.known_txids(&wallet.id).await?;

		// Order confirmed-first so balances accrue in chain order even if a
		// later chunk never runs.
		let mut seen: HashSet<&str> = HashSet::new();
		let mut new_items: Vec<&HistoryItem> = round
			.histories
			.values()
			.flatten()
			.filter(|item| !known.contains(&item.txid) && seen.insert(item.txid.as_str()))
			.collect();
		new_items.sort_by_key(|item| item.height.unwrap_or(u32::MAX));

		if new_items.is_empty() {
			return Ok(());
		}
		debug!(
			"wallet {}: {} new transactions to process",
			wallet.id,
			new_items.len()
		);

		let chunk_size = self.settings.tx_chunk_size.max(1);
		for chunk in new_items.chunks(chunk_size) {
			for item in chunk {
				if let Some(()) = self
					.ingest_transaction(wallet, &item.txid, own, tip_height, prevout_cache)
					.await?
				{
					outcome.new_transactions += 1;
				}
			}
		}
		Ok(())
	}

	/// Fetch, classify and persist one transaction. Returns `Some(())` when
	/// a row was inserted.
	async fn ingest_transaction(
		&self,
		wallet: &Wallet,
		txid: &str,
		own: &HashSet<String>,
		tip_height: u32,
		prevout_cache: &mut HashMap<String, ChainTransaction>,
	) -> Result<Option<()>, SyncError> {
		let tx = self.fetch_cached(txid, prevout_cache).await?;
		let resolved = self.resolve_inputs(&tx, prevout_cache).await;

		let Some(classification) =
			classify_transaction(&tx, &resolved, own, self.settings.max_sane_fee_sat)
		else {
			debug!("transaction {} does not touch wallet {}", txid, wallet.id);
			return Ok(None);
		};

		let confirmations = confirmations_at(tip_height, tx.block_height);
		let record = WalletTransaction {
			row_id: 0,
			wallet_id: wallet.id.clone(),
			txid: tx.txid.clone(),
			direction: classification.direction,
			amount_sat: classification.amount_sat,
			fee_sat: classification.fee_sat,
			block_height: tx.block_height,
			block_time: tx.block_time,
			confirmations,
			balance_after: 0,
			rbf_status: RbfStatus::Active,
			created_at: Utc::now(),
		};

		let inputs: Vec<TxInputRecord> = resolved
			.iter()
			.map(|input| TxInputRecord {
				wallet_id: wallet.id.clone(),
				txid: tx.txid.clone(),
				prev_txid: input.prev_txid.clone(),
				prev_vout: input.prev_vout,
				address: input.address.clone(),
				amount_sat: input.value_sat,
				is_ours: input.is_ours(own),
			})
			.collect();

		let outputs: Vec<TxOutputRecord> = tx
			.outputs
			.iter()
			.enumerate()
			.map(|(vout, output)| {
				let is_ours = output
					.address
					.as_ref()
					.map(|a| own.contains(a))
					.unwrap_or(false);
				TxOutputRecord {
					wallet_id: wallet.id.clone(),
					txid: tx.txid.clone(),
					vout: vout as u32,
					address: output.address.clone(),
					amount_sat: output.value_sat,
					kind: classify_output(classification.direction, is_ours),
					is_ours,
				}
			})
			.collect();

		let inserted = self.transactions.insert(record, inputs, outputs).await?;
		if inserted.is_none() {
			return Ok(None);
		}

		let event = match classification.direction {
			TxDirection::Received => names::TX_RECEIVED,
			TxDirection::Sent | TxDirection::Consolidation => names::TX_SENT,
		};
		self.events
			.emit(
				event,
				json!({
					"walletId": wallet.id,
					"txid": tx.txid,
					"amountSat": classification.amount_sat,
					"feeSat": classification.fee_sat,
					"confirmations": confirmations,
				}),
			)
			.await;
		Ok(Some(()))
	}

	async fn fetch_cached(
		&self,
		txid: &str,
		cache: &mut HashMap<String, ChainTransaction>,
	) -> Result<ChainTransaction, SyncError> {
		if let Some(tx) = cache.get(txid) {
			return Ok(tx.clone());
		}
		let tx = self.client.transaction(txid).await?;
		cache.insert(txid.to_string(), tx.clone());
		Ok(tx)
	}

	/// Resolve each input's address and value through its previous
	/// transaction. Unresolvable prevouts degrade to unknowns; fee math then
	/// reports the fee as unknown rather than guessing.
	async fn resolve_inputs(
		&self,
		tx: &ChainTransaction,
		cache: &mut HashMap<String, ChainTransaction>,
	) -> Vec<ResolvedInput> {
		let mut resolved = Vec::with_capacity(tx.inputs.len());
		for input in &tx.inputs {
			let prevout = match self.fetch_cached(&input.prev_txid, cache).await {
				Ok(prev) => prev.outputs.get(input.prev_vout as usize).cloned(),
				Err(e) => {
					debug!(
						"could not resolve prevout {}:{}: {}",
						input.prev_txid, input.prev_vout, e
					);
					None
				}
			};
			resolved.push(ResolvedInput {
				prev_txid: input.prev_txid.clone(),
				prev_vout: input.prev_vout,
				address: prevout.as_ref().and_then(|o| o.address.clone()),
				value_sat: prevout.as_ref().map(|o| o.value_sat),
			});
		}
		resolved
	}

	/// Make the remote UTXO set authoritative. A stored unspent UTXO absent
	/// from the remote union is marked spent only when its owning address
	/// was successfully queried this round; a transient per-address failure
	/// must never produce false spent marks.
	async fn reconcile_utxos(
		&self,
		wallet: &Wallet,
		targets: &[WalletAddress],
		round: &RoundState,
		tip_height: u32,
		outcome: &mut SyncOutcome,
	) -> Result<(), SyncError> {
		let mut remote: HashMap<String, Vec<RemoteUtxo>> = HashMap::new();
		let mut utxo_ok: HashSet<String> = HashSet::new();

		for chunk in targets.chunks(self.settings.utxo_batch_size.max(1)) {
			let names: Vec<String> = chunk.iter().map(|a| a.address.clone()).collect();
			match self.client.address_utxos_batch(&names).await {
				Ok(batch) => {
					for (address, utxos) in batch {
						utxo_ok.insert(address.clone());
						remote.insert(address, utxos);
					}
				}
				Err(e) => {
					warn!(
						"batched utxo fetch failed for wallet {}, retrying one-by-one: {}",
						wallet.id, e
					);
					for address in &names {
						match self.client.address_utxos(address).await {
							Ok(utxos) => {
								utxo_ok.insert(address.clone());
								remote.insert(address.clone(), utxos);
							}
							Err(e) => {
								warn!("utxo fetch failed for {}: {}", address, e);
							}
						}
					}
				}
			}
		}

		let remote_outpoints: HashSet<OutPoint> = remote
			.values()
			.flatten()
			.map(|u| OutPoint::new(u.txid.clone(), u.vout))
			.collect();

		let previously_known: HashSet<OutPoint> = self
			.utxos
			.for_wallet(&wallet.id)
			.await?
			.iter()
			.map(|u| OutPoint::new(u.txid.clone(), u.vout))
			.collect();

		// Insert/refresh everything the chain reports as unspent.
		for (address, utxos) in &remote {
			for utxo in utxos {
				let stored = WalletUtxo {
					wallet_id: wallet.id.clone(),
					txid: utxo.txid.clone(),
					vout: utxo.vout,
					address: address.clone(),
					amount_sat: utxo.value_sat,
					confirmations: confirmations_at(tip_height, utxo.height),
					block_height: utxo.height,
					spent: false,
				};
				self.utxos.upsert(stored).await?;
			}
		}

		// Retract what the chain no longer supports.
		let mut newly_spent: Vec<OutPoint> = Vec::new();
		for stored in self.utxos.for_wallet(&wallet.id).await? {
			if stored.spent || !utxo_ok.contains(&stored.address) {
				continue;
			}
			let outpoint = OutPoint::new(stored.txid.clone(), stored.vout);
			if !remote_outpoints.contains(&outpoint) {
				if self.utxos.mark_spent(&outpoint).await? {
					newly_spent.push(outpoint);
				}
			}
		}

		outcome.new_utxos += remote_outpoints
			.iter()
			.filter(|op| !previously_known.contains(*op))
			.count();
		outcome.spent_utxos += newly_spent.len();

		if !newly_spent.is_empty() {
			self.retract_replaced(wallet, &newly_spent, &round.seen_txids, outcome)
				.await?;
		}
		Ok(())
	}

	/// Spent inputs invalidate drafts locking them, and retract pending
	/// transactions the chain superseded (a confirmed RBF replacement).
	async fn retract_replaced(
		&self,
		wallet: &Wallet,
		newly_spent: &[OutPoint],
		seen_txids: &HashSet<String>,
		outcome: &mut SyncOutcome,
	) -> Result<(), SyncError> {
		let invalidated = self
			.drafts
			.invalidate_drafts_locking(&wallet.id, newly_spent)
			.await?;
		if invalidated > 0 {
			info!(
				"invalidated {} transaction drafts for wallet {} after spends",
				invalidated, wallet.id
			);
		}

		for pending in self.transactions.pending_active(&wallet.id).await? {
			if seen_txids.contains(&pending.txid) {
				continue;
			}
			let inputs = self
				.transactions
				.inputs_for_tx(&wallet.id, &pending.txid)
				.await?;
			let superseded = inputs.iter().any(|input| {
				newly_spent
					.iter()
					.any(|op| op.txid == input.prev_txid && op.vout == input.prev_vout)
			});
			if superseded {
				self.transactions.mark_replaced(pending.row_id).await?;
				outcome.replaced_transactions += 1;
				self.events
					.emit(
						names::TX_REPLACED,
						json!({
							"walletId": wallet.id,
							"txid": pending.txid,
						}),
					)
					.await;
			}
		}
		Ok(())
	}

	/// Re-derive `balance_after` for the whole wallet, once per pass, after
	/// all insertions settle. Returns the final balance.
	async fn recompute_balances(&self, wallet_id: &str) -> Result<i64, SyncError> {
		let mut txs = self.transactions.list_for_wallet(wallet_id).await?;
		chronological(&mut txs);
		let (assignments, final_balance) = running_balances(&txs);
		for (tx, (row_id, balance)) in txs.iter().zip(assignments) {
			if tx.balance_after != balance {
				self.transactions.set_balance_after(row_id, balance).await?;
			}
		}
		Ok(final_balance)
	}

	/// Keep `gap_limit` unused addresses generated past the highest used
	/// index. Returns the freshly generated addresses, or `None` once the
	/// expansion depth bound is reached.
	async fn expand_gap(
		&self,
		wallet: &Wallet,
		depth: u32,
	) -> Result<Option<Vec<WalletAddress>>, SyncError> {
		if depth >= self.settings.max_expansion_depth {
			warn!(
				"gap expansion depth bound reached for wallet {}, deferring to next sync",
				wallet.id
			);
			return Ok(None);
		}

		let addresses = self.addresses.for_wallet(&wallet.id).await?;
		let Some(highest_used) = addresses.iter().filter(|a| a.used).map(|a| a.index).max()
		else {
			return Ok(None);
		};
		let trailing_unused = addresses.iter().filter(|a| a.index > highest_used).count() as u32;
		if trailing_unused >= self.settings.gap_limit {
			return Ok(None);
		}

		let needed = self.settings.gap_limit - trailing_unused;
		info!(
			"wallet {}: expanding address gap by {} (highest used index {})",
			wallet.id, needed, highest_used
		);
		let generated = self.address_gen.generate(&wallet.id, needed).await?;
		Ok(Some(generated))
	}
}

fn confirmations_at(tip_height: u32, block_height: Option<u32>) -> u32 {
	match block_height {
		Some(height) if height <= tip_height => tip_height - height + 1,
		_ => 0,
	}
}

#[async_trait]
impl SyncExecutor for Reconciler {
	async fn sync_wallet(&self, wallet_id: &str) -> Result<SyncOutcome, SyncError> {
		self.run(wallet_id).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{ChainTxIn, ChainTxOut, MemoryChainClient};
	use crate::events::RecordingEventSink;
	use crate::repository::MemoryRepository;

	struct TestHarness {
		client: Arc<MemoryChainClient>,
		repo: Arc<MemoryRepository>,
		events: Arc<RecordingEventSink>,
		reconciler: Reconciler,
	}

	fn harness(settings: SyncSettings) -> TestHarness {
		let client = Arc::new(MemoryChainClient::new());
		let repo = Arc::new(MemoryRepository::new());
		let events = Arc::new(RecordingEventSink::new());
		let reconciler = Reconciler::new(
			client.clone(),
			repo.clone(),
			repo.clone(),
			repo.clone(),
			repo.clone(),
			repo.clone(),
			Arc::new(NoopAddressGenerator),
			events.clone(),
			settings,
		);
		TestHarness {
			client,
			repo,
			events,
			reconciler,
		}
	}

	async fn seed_wallet(h: &TestHarness, wallet_id: &str, addresses: &[&str]) {
		WalletRepository::save(h.repo.as_ref(), Wallet::new(wallet_id, Network::Regtest))
			.await
			.unwrap();
		for (i, address) in addresses.iter().enumerate() {
			AddressRepository::insert(
				h.repo.as_ref(),
				WalletAddress {
					wallet_id: wallet_id.to_string(),
					address: address.to_string(),
					derivation_path: format!("m/84'/0'/0'/0/{}", i),
					index: i as u32,
					used: false,
				},
			)
			.await
			.unwrap();
		}
	}

	fn funding_tx(txid: &str, to: &str, value_sat: u64, height: u32) -> ChainTransaction {
		ChainTransaction {
			txid: txid.to_string(),
			inputs: vec![ChainTxIn {
				prev_txid: format!("ext-{}", txid),
				prev_vout: 0,
			}],
			outputs: vec![ChainTxOut {
				value_sat,
				address: Some(to.to_string()),
			}],
			block_height: Some(height),
			block_time: Some(1_700_000_000 + height as i64),
		}
	}

	#[tokio::test]
	async fn first_sync_ingests_receive_and_utxo() {
		let h = harness(SyncSettings::default());
		seed_wallet(&h, "w1", &["A1", "A2"]).await;
		h.client.connect().await.unwrap();
		h.client.set_tip(105);
		h.client
			.add_transaction(funding_tx("t1", "A1", 200_000, 100), &["A1".to_string()]);
		h.client.set_utxos(
			"A1",
			vec![RemoteUtxo {
				txid: "t1".to_string(),
				vout: 0,
				value_sat: 200_000,
				height: Some(100),
			}],
		);

		let outcome = h.reconciler.sync_wallet("w1").await.unwrap();
		assert_eq!(outcome.new_transactions, 1);
		assert_eq!(outcome.balance_sat, 200_000);
		assert!(outcome.balance_changed);

		let txs = TransactionRepository::list_for_wallet(h.repo.as_ref(), "w1")
			.await
			.unwrap();
		assert_eq!(txs.len(), 1);
		assert_eq!(txs[0].direction, TxDirection::Received);
		assert_eq!(txs[0].confirmations, 6);
		assert_eq!(txs[0].balance_after, 200_000);

		assert_eq!(h.events.count(names::TX_RECEIVED), 1);
		assert_eq!(h.events.count(names::BALANCE_CHANGED), 1);

		// Address with activity is now flagged used.
		let addresses = AddressRepository::for_wallet(h.repo.as_ref(), "w1")
			.await
			.unwrap();
		assert!(addresses[0].used);
		assert!(!addresses[1].used);
	}

	#[tokio::test]
	async fn rerun_against_unchanged_chain_is_idempotent() {
		let h = harness(SyncSettings::default());
		seed_wallet(&h, "w1", &["A1"]).await;
		h.client.connect().await.unwrap();
		h.client.set_tip(105);
		h.client
			.add_transaction(funding_tx("t1", "A1", 50_000, 100), &["A1".to_string()]);
		h.client.set_utxos(
			"A1",
			vec![RemoteUtxo {
				txid: "t1".to_string(),
				vout: 0,
				value_sat: 50_000,
				height: Some(100),
			}],
		);

		let first = h.reconciler.sync_wallet("w1").await.unwrap();
		assert_eq!(first.new_transactions, 1);

		let second = h.reconciler.sync_wallet("w1").await.unwrap();
		assert_eq!(second.new_transactions, 0);
		assert_eq!(second.spent_utxos, 0);
		assert!(!second.balance_changed);
		assert_eq!(
			TransactionRepository::list_for_wallet(h.repo.as_ref(), "w1")
				.await
				.unwrap()
				.len(),
			1
		);
	}

	#[tokio::test]
	async fn absent_utxo_marked_spent_only_for_queried_addresses() {
		let h = harness(SyncSettings::default());
		seed_wallet(&h, "w1", &["A1", "A2"]).await;
		h.client.connect().await.unwrap();
		h.client.set_tip(110);

		for utxo in [
			WalletUtxo {
				wallet_id: "w1".to_string(),
				txid: "t1".to_string(),
				vout: 0,
				address: "A1".to_string(),
				amount_sat: 10_000,
				confirmations: 5,
				block_height: Some(100),
				spent: false,
			},
			WalletUtxo {
				wallet_id: "w1".to_string(),
				txid: "t2".to_string(),
				vout: 0,
				address: "A2".to_string(),
				amount_sat: 20_000,
				confirmations: 5,
				block_height: Some(100),
				spent: false,
			},
		] {
			UtxoRepository::upsert(h.repo.as_ref(), utxo).await.unwrap();
		}

		// A2's queries fail this round; its UTXO must stay untouched even
		// though the remote union has nothing for it.
		h.client.fail_address("A2");

		let outcome = h.reconciler.sync_wallet("w1").await.unwrap();
		assert_eq!(outcome.spent_utxos, 1);

		let utxos = UtxoRepository::for_wallet(h.repo.as_ref(), "w1")
			.await
			.unwrap();
		let a1 = utxos.iter().find(|u| u.txid == "t1").unwrap();
		let a2 = utxos.iter().find(|u| u.txid == "t2").unwrap();
		assert!(a1.spent);
		assert!(!a2.spent);
	}

	#[tokio::test]
	async fn confirmed_spend_retracts_pending_replacement() {
		let h = harness(SyncSettings::default());
		seed_wallet(&h, "w1", &["A1"]).await;
		h.client.connect().await.unwrap();
		h.client.set_tip(100);

		// Pending RBF-active transaction spending t0:0, known locally but no
		// longer on the chain.
		UtxoRepository::upsert(
			h.repo.as_ref(),
			WalletUtxo {
				wallet_id: "w1".to_string(),
				txid: "t0".to_string(),
				vout: 0,
				address: "A1".to_string(),
				amount_sat: 100_000,
				confirmations: 10,
				block_height: Some(90),
				spent: false,
			},
		)
		.await
		.unwrap();
		let row_id = TransactionRepository::insert(
			h.repo.as_ref(),
			WalletTransaction {
				row_id: 0,
				wallet_id: "w1".to_string(),
				txid: "pending-send".to_string(),
				direction: TxDirection::Sent,
				amount_sat: -40_000,
				fee_sat: Some(200),
				block_height: None,
				block_time: None,
				confirmations: 0,
				balance_after: 0,
				rbf_status: RbfStatus::Active,
				created_at: Utc::now(),
			},
			vec![TxInputRecord {
				wallet_id: "w1".to_string(),
				txid: "pending-send".to_string(),
				prev_txid: "t0".to_string(),
				prev_vout: 0,
				address: Some("A1".to_string()),
				amount_sat: Some(100_000),
				is_ours: true,
			}],
			vec![],
		)
		.await
		.unwrap()
		.unwrap();

		// A draft locks the same outpoint.
		h.repo.add_draft("w1", vec![OutPoint::new("t0", 0)]);

		// Remote view: t0:0 gone (replacement confirmed elsewhere), empty
		// history for A1.
		h.client.set_utxos("A1", vec![]);

		let outcome = h.reconciler.sync_wallet("w1").await.unwrap();
		assert_eq!(outcome.spent_utxos, 1);
		assert_eq!(outcome.replaced_transactions, 1);
		assert_eq!(h.repo.draft_count(), 0);
		assert_eq!(h.events.count(names::TX_REPLACED), 1);

		let txs = TransactionRepository::list_for_wallet(h.repo.as_ref(), "w1")
			.await
			.unwrap();
		let pending = txs.iter().find(|t| t.row_id == row_id).unwrap();
		assert_eq!(pending.rbf_status, RbfStatus::Replaced);
	}

	struct CountingGenerator {
		repo: Arc<MemoryRepository>,
		calls: std::sync::atomic::AtomicU32,
	}

	#[async_trait]
	impl AddressGenerator for CountingGenerator {
		async fn generate(
			&self,
			wallet_id: &str,
			count: u32,
		) -> Result<Vec<WalletAddress>, RepositoryError> {
			self.calls
				.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			let existing = AddressRepository::for_wallet(self.repo.as_ref(), wallet_id).await?;
			let next = existing.iter().map(|a| a.index + 1).max().unwrap_or(0);
			let mut generated = Vec::new();
			for i in 0..count {
				let address = WalletAddress {
					wallet_id: wallet_id.to_string(),
					address: format!("gen-{}", next + i),
					derivation_path: format!("m/84'/0'/0'/0/{}", next + i),
					index: next + i,
					used: false,
				};
				AddressRepository::insert(self.repo.as_ref(), address.clone()).await?;
				generated.push(address);
			}
			Ok(generated)
		}
	}

	#[tokio::test]
	async fn gap_expansion_is_depth_bounded() {
		let settings = SyncSettings {
			gap_limit: 2,
			max_expansion_depth: 2,
			..SyncSettings::default()
		};
		let client = Arc::new(MemoryChainClient::new());
		let repo = Arc::new(MemoryRepository::new());
		let events = Arc::new(RecordingEventSink::new());
		let generator = Arc::new(CountingGenerator {
			repo: repo.clone(),
			calls: std::sync::atomic::AtomicU32::new(0),
		});
		let reconciler = Reconciler::new(
			client.clone(),
			repo.clone(),
			repo.clone(),
			repo.clone(),
			repo.clone(),
			repo.clone(),
			generator.clone(),
			events,
			settings,
		);

		WalletRepository::save(repo.as_ref(), Wallet::new("w1", Network::Regtest))
			.await
			.unwrap();
		AddressRepository::insert(
			repo.as_ref(),
			WalletAddress {
				wallet_id: "w1".to_string(),
				address: "A0".to_string(),
				derivation_path: "m/84'/0'/0'/0/0".to_string(),
				index: 0,
				used: false,
			},
		)
		.await
		.unwrap();

		client.connect().await.unwrap();
		client.set_tip(100);
		// Activity on A0 leaves zero trailing unused addresses.
		client.add_transaction(funding_tx("t1", "A0", 5_000, 90), &["A0".to_string()]);
		// Adversarial server: every generated address also shows activity,
		// so expansion would recurse forever without the depth bound.
		for i in 1..=10 {
			let addr = format!("gen-{}", i);
			client.add_transaction(
				funding_tx(&format!("t{}", i + 1), &addr, 1_000, 90 + i),
				&[addr.clone()],
			);
		}

		reconciler.sync_wallet("w1").await.unwrap();
		let calls = generator.calls.load(std::sync::atomic::Ordering::SeqCst);
		assert_eq!(calls, 2);
	}
}
