use bitcoin_wallet_sync::chain::{
	ChainTransaction, ChainTxIn, ChainTxOut, MemoryChainClient, RemoteUtxo,
};
use bitcoin_wallet_sync::config::SyncSettings;
use bitcoin_wallet_sync::deadletter::DeadLetterRecorder;
use bitcoin_wallet_sync::events::TracingEventSink;
use bitcoin_wallet_sync::lock::{LockManager, LockStore, MemoryLockStore};
use bitcoin_wallet_sync::model::{Network, SyncPriority, Wallet, WalletAddress};
use bitcoin_wallet_sync::repository::{AddressRepository, MemoryRepository, WalletRepository};
use bitcoin_wallet_sync::scheduler::{MemoryJobBackend, SyncScheduler};
use bitcoin_wallet_sync::subscription::{ConfirmationRefresher, SubscriptionManager};
use bitcoin_wallet_sync::sync::{NoopAddressGenerator, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");
	let settings = match SyncSettings::load() {
		Ok(settings) => settings,
		Err(e) => {
			error!("could not load configuration: {}", e);
			std::process::exit(1);
		}
	};
	let network = Network::Regtest;

	// Demo wiring: in-memory chain source, repositories and lock store. A
	// deployment substitutes its own implementations of the same traits.
	let chain = Arc::new(MemoryChainClient::new());
	seed_demo_chain(&chain);
	let repo = Arc::new(MemoryRepository::new());
	seed_demo_wallet(&repo).await;

	let lock_store = Arc::new(MemoryLockStore::new());
	let locks = Arc::new(LockManager::new(
		lock_store as Arc<dyn LockStore>,
		Duration::from_millis(settings.lock_poll_interval_ms),
	));
	locks.start_sweeper(Duration::from_secs(60));

	let events = Arc::new(TracingEventSink);
	let dead_letters = Arc::new(DeadLetterRecorder::new(
		settings.dead_letter_capacity,
		Duration::from_secs(settings.dead_letter_ttl_secs),
	));
	let purge_task = dead_letters.start_purge_task(Duration::from_secs(3600));

	let reconciler = Arc::new(Reconciler::new(
		chain.clone(),
		repo.clone(),
		repo.clone(),
		repo.clone(),
		repo.clone(),
		repo.clone(),
		Arc::new(NoopAddressGenerator),
		events.clone(),
		settings.clone(),
	));

	let scheduler = Arc::new(SyncScheduler::new(
		reconciler,
		repo.clone(),
		locks.clone(),
		Arc::new(MemoryJobBackend::new(settings.queue_capacity)),
		dead_letters.clone(),
		events.clone(),
		settings.clone(),
	));
	scheduler.start();

	let refresher = Arc::new(ConfirmationRefresher::new(
		repo.clone(),
		repo.clone(),
		events.clone(),
	));
	let subscriptions = Arc::new(SubscriptionManager::new(
		chain.clone(),
		locks.clone(),
		repo.clone(),
		scheduler.clone(),
		refresher,
		events.clone(),
		settings.clone(),
		network,
	));
	subscriptions.start();

	match WalletRepository::list(repo.as_ref()).await {
		Ok(wallets) => {
			for wallet in wallets {
				scheduler.request(&wallet.id, SyncPriority::Normal).await;
			}
		}
		Err(e) => error!("could not list wallets for the initial sync: {}", e),
	}

	info!("Wallet sync service running, press ctrl-c to stop");
	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("could not listen for shutdown signal: {}", e);
	}

	info!("Shutting down");
	subscriptions.stop().await;
	scheduler.shutdown().await;
	purge_task.abort();
	locks.shutdown().await;
	info!("Shutdown complete");
}

async fn seed_demo_wallet(repo: &MemoryRepository) {
	let wallet = Wallet::new("demo", Network::Regtest);
	if let Err(e) = WalletRepository::save(repo, wallet).await {
		error!("could not seed demo wallet: {}", e);
		return;
	}
	for (index, address) in ["bcrt1-demo-0", "bcrt1-demo-1"].iter().enumerate() {
		let result = AddressRepository::insert(
			repo,
			WalletAddress {
				wallet_id: "demo".to_string(),
				address: address.to_string(),
				derivation_path: format!("m/84'/1'/0'/0/{}", index),
				index: index as u32,
				used: false,
			},
		)
		.await;
		if let Err(e) = result {
			error!("could not seed demo address {}: {}", address, e);
		}
	}
}

fn seed_demo_chain(chain: &MemoryChainClient) {
	chain.set_tip(105);
	chain.add_transaction(
		ChainTransaction {
			txid: "demo-funding".to_string(),
			inputs: vec![ChainTxIn {
				prev_txid: "demo-coinbase".to_string(),
				prev_vout: 0,
			}],
			outputs: vec![ChainTxOut {
				value_sat: 250_000,
				address: Some("bcrt1-demo-0".to_string()),
			}],
			block_height: Some(100),
			block_time: Some(1_700_000_000),
		},
		&["bcrt1-demo-0".to_string()],
	);
	chain.set_utxos(
		"bcrt1-demo-0",
		vec![RemoteUtxo {
			txid: "demo-funding".to_string(),
			vout: 0,
			value_sat: 250_000,
			height: Some(100)
		}],
	);
}
