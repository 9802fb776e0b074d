//! In-process simulated chain-data source.
//!
//! Serves scripted histories, transactions and UTXO sets, and lets tests
//! inject per-address failures and push notifications. Also usable as the
//! demo wiring in `main` when no real transport is configured.

use crate::chain::client::{ChainClient, NotificationStream};
use crate::chain::types::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

#[derive(Default)]
struct ChainData {
	tip_height: u32,
	histories: HashMap<String, Vec<HistoryItem>>,
	transactions: HashMap<String, ChainTransaction>,
	utxos: HashMap<String, Vec<RemoteUtxo>>,
	/// Queries against these addresses fail, simulating partial outages.
	failing_addresses: HashSet<String>,
	subscribed: HashSet<String>,
}

pub struct MemoryChainClient {
	data: Mutex<ChainData>,
	connected: AtomicBool,
	offline: AtomicBool,
	notify_tx: broadcast::Sender<ChainNotification>,
}

impl Default for MemoryChainClient {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryChainClient {
	pub fn new() -> Self {
		let (notify_tx, _) = broadcast::channel(256);
		Self {
			data: Mutex::new(ChainData::default()),
			connected: AtomicBool::new(false),
			offline: AtomicBool::new(false),
			notify_tx,
		}
	}

	pub fn set_tip(&self, height: u32) {
		self.data.lock().unwrap().tip_height = height;
	}

	pub fn tip(&self) -> u32 {
		self.data.lock().unwrap().tip_height
	}

	/// Register a transaction and append it to the history of every address
	/// among its outputs that matches `history_addresses`.
	pub fn add_transaction(&self, tx: ChainTransaction, history_addresses: &[String]) {
		let mut data = self.data.lock().unwrap();
		let item = HistoryItem {
			txid: tx.txid.clone(),
			height: tx.block_height,
		};
		for address in history_addresses {
			let entries = data.histories.entry(address.clone()).or_default();
			if !entries.iter().any(|e| e.txid == item.txid) {
				entries.push(item.clone());
			}
		}
		data.transactions.insert(tx.txid.clone(), tx);
	}

	pub fn set_utxos(&self, address: &str, utxos: Vec<RemoteUtxo>) {
		self.data
			.lock()
			.unwrap()
			.utxos
			.insert(address.to_string(), utxos);
	}

	pub fn fail_address(&self, address: &str) {
		self.data
			.lock()
			.unwrap()
			.failing_addresses
			.insert(address.to_string());
	}

	pub fn restore_address(&self, address: &str) {
		self.data.lock().unwrap().failing_addresses.remove(address);
	}

	pub fn subscribed_addresses(&self) -> HashSet<String> {
		self.data.lock().unwrap().subscribed.clone()
	}

	/// Advance the tip and push a new-block notification.
	pub fn mine_block(&self) -> u32 {
		let height = {
			let mut data = self.data.lock().unwrap();
			data.tip_height += 1;
			data.tip_height
		};
		let _ = self.notify_tx.send(ChainNotification::NewBlock { height });
		height
	}

	pub fn push_address_activity(&self, address: &str) {
		let _ = self.notify_tx.send(ChainNotification::AddressActivity {
			address: address.to_string(),
		});
	}

	/// Simulate a network outage: live operations fail and reconnection
	/// attempts are refused until the flag is cleared.
	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
		if offline {
			self.connected.store(false, Ordering::SeqCst);
		}
	}

	fn ensure_connected(&self) -> Result<(), ChainClientError> {
		if self.offline.load(Ordering::SeqCst) {
			return Err(ChainClientError::Transport("simulated outage".to_string()));
		}
		if self.connected.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(ChainClientError::NotConnected)
		}
	}

	fn check_address(data: &ChainData, address: &str) -> Result<(), ChainClientError> {
		if data.failing_addresses.contains(address) {
			Err(ChainClientError::Transport(format!(
				"simulated failure for {}",
				address
			)))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl ChainClient for MemoryChainClient {
	async fn connect(&self) -> Result<(), ChainClientError> {
		if self.offline.load(Ordering::SeqCst) {
			return Err(ChainClientError::Transport("simulated outage".to_string()));
		}
		self.connected.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn server_version(&self) -> Result<String, ChainClientError> {
		self.ensure_connected()?;
		Ok("MemoryChain 1.0 (protocol 1.4)".to_string())
	}

	async fn ping(&self) -> Result<(), ChainClientError> {
		self.ensure_connected()
	}

	async fn address_history(&self, address: &str) -> Result<Vec<HistoryItem>, ChainClientError> {
		self.ensure_connected()?;
		let data = self.data.lock().unwrap();
		Self::check_address(&data, address)?;
		Ok(data.histories.get(address).cloned().unwrap_or_default())
	}

	async fn address_history_batch(
		&self,
		addresses: &[String],
	) -> Result<HashMap<String, Vec<HistoryItem>>, ChainClientError> {
		self.ensure_connected()?;
		let data = self.data.lock().unwrap();
		let mut result = HashMap::new();
		for address in addresses {
			// Whole-batch failure semantics, as on a real batched RPC.
			Self::check_address(&data, address)?;
			result.insert(
				address.clone(),
				data.histories.get(address).cloned().unwrap_or_default(),
			);
		}
		Ok(result)
	}

	async fn transaction(&self, txid: &str) -> Result<ChainTransaction, ChainClientError> {
		self.ensure_connected()?;
		self.data
			.lock()
			.unwrap()
			.transactions
			.get(txid)
			.cloned()
			.ok_or_else(|| ChainClientError::Protocol(format!("unknown transaction {}", txid)))
	}

	async fn address_utxos(&self, address: &str) -> Result<Vec<RemoteUtxo>, ChainClientError> {
		self.ensure_connected()?;
		let data = self.data.lock().unwrap();
		Self::check_address(&data, address)?;
		Ok(data.utxos.get(address).cloned().unwrap_or_default())
	}

	async fn address_utxos_batch(
		&self,
		addresses: &[String],
	) -> Result<HashMap<String, Vec<RemoteUtxo>>, ChainClientError> {
		self.ensure_connected()?;
		let data = self.data.lock().unwrap();
		let mut result = HashMap::new();
		for address in addresses {
			Self::check_address(&data, address)?;
			result.insert(
				address.clone(),
				data.utxos.get(address).cloned().unwrap_or_default(),
			);
		}
		Ok(result)
	}

	async fn broadcast(&self, raw_hex: &str) -> Result<String, ChainClientError> {
		self.ensure_connected()?;
		if raw_hex.is_empty() {
			return Err(ChainClientError::Protocol("empty transaction".to_string()));
		}
		// Fake txid: the simulation does not parse wire bytes.
		Ok(hex::encode(&raw_hex.as_bytes()[..raw_hex.len().min(32)]))
	}

	async fn estimate_fee(&self, target_blocks: u16) -> Result<f64, ChainClientError> {
		self.ensure_connected()?;
		Ok(match target_blocks {
			0..=1 => 20.0,
			2..=6 => 8.0,
			_ => 2.0,
		})
	}

	async fn block_header(&self, height: u32) -> Result<String, ChainClientError> {
		self.ensure_connected()?;
		let tip = self.data.lock().unwrap().tip_height;
		if height > tip {
			return Err(ChainClientError::Protocol(format!(
				"height {} beyond tip {}",
				height, tip
			)));
		}
		Ok(format!("{:0>160}", height))
	}

	async fn subscribe_headers(&self) -> Result<u32, ChainClientError> {
		self.ensure_connected()?;
		Ok(self.data.lock().unwrap().tip_height)
	}

	async fn subscribe_address(&self, address: &str) -> Result<(), ChainClientError> {
		self.ensure_connected()?;
		let mut data = self.data.lock().unwrap();
		Self::check_address(&data, address)?;
		data.subscribed.insert(address.to_string());
		Ok(())
	}

	async fn subscribe_address_batch(&self, addresses: &[String]) -> Result<(), ChainClientError> {
		self.ensure_connected()?;
		let mut data = self.data.lock().unwrap();
		for address in addresses {
			Self::check_address(&data, address)?;
		}
		for address in addresses {
			data.subscribed.insert(address.clone());
		}
		Ok(())
	}

	async fn unsubscribe_address(&self, address: &str) -> Result<(), ChainClientError> {
		self.data.lock().unwrap().subscribed.remove(address);
		Ok(())
	}

	fn supports_address_subscriptions(&self) -> bool {
		true
	}

	fn notifications(&self) -> NotificationStream {
		let rx = self.notify_tx.subscribe();
		Box::pin(futures::stream::unfold(rx, |mut rx| async move {
			loop {
				match rx.recv().await {
					Ok(notification) => return Some((notification, rx)),
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						tracing::warn!("notification stream lagged, skipped {}", skipped);
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			}
		}))
	}
}
