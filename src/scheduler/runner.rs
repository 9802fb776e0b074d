//! Dispatch, retry and sweep machinery around the job queue.
//!
//! Every execution happens under the cluster-wide `sync:{wallet_id}` lock, so
//! at most one reconciliation runs per wallet across all processes. Lock
//! contention is not a failure: the other owner is responsible for eventual
//! completion, and this process's staleness sweep will catch anything that
//! slips through.

use crate::config::SyncSettings;
use crate::deadletter::DeadLetterRecorder;
use crate::events::{EventSink, names};
use crate::lock::LockManager;
use crate::model::{SyncJob, SyncPriority, SyncStatus, WalletId};
use crate::repository::WalletRepository;
use crate::scheduler::queue::{JobBackend, PushOutcome};
use crate::sync::SyncExecutor;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use async_trait::async_trait;

/// How other components ask for a wallet sync without holding the whole
/// scheduler type.
#[async_trait]
pub trait SyncRequester: Send + Sync {
	async fn request_sync(&self, wallet_id: &str, priority: SyncPriority);
}

pub struct SyncScheduler {
	executor: Arc<dyn SyncExecutor>,
	wallets: Arc<dyn WalletRepository>,
	locks: Arc<LockManager>,
	backend: Arc<dyn JobBackend>,
	dead_letters: Arc<DeadLetterRecorder>,
	events: Arc<dyn EventSink>,
	settings: SyncSettings,
	/// Wallets this process is executing right now. Authoritative while the
	/// process lives; the persisted flag only aids crash recovery.
	running: Mutex<HashSet<WalletId>>,
	retry_timers: Mutex<HashMap<WalletId, JoinHandle<()>>>,
	wake: Notify,
	accepting: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
	pub fn new(
		executor: Arc<dyn SyncExecutor>,
		wallets: Arc<dyn WalletRepository>,
		locks: Arc<LockManager>,
		backend: Arc<dyn JobBackend>,
		dead_letters: Arc<DeadLetterRecorder>,
		events: Arc<dyn EventSink>,
		settings: SyncSettings,
	) -> Self {
		Self {
			executor,
			wallets,
			locks,
			backend,
			dead_letters,
			events,
			settings,
			running: Mutex::new(HashSet::new()),
			retry_timers: Mutex::new(HashMap::new()),
			wake: Notify::new(),
			accepting: AtomicBool::new(true),
			tasks: Mutex::new(Vec::new()),
		}
	}

	/// Spawn the dispatch loop and the periodic sweep. Idempotent.
	pub fn start(self: &Arc<Self>) {
		let mut tasks = self.tasks.lock().unwrap();
		if !tasks.is_empty() {
			return;
		}
		self.accepting.store(true, Ordering::SeqCst);

		let scheduler = Arc::clone(self);
		tasks.push(tokio::spawn(async move {
			scheduler.dispatch_loop().await;
		}));
		let scheduler = Arc::clone(self);
		tasks.push(tokio::spawn(async move {
			scheduler.sweep_loop().await;
		}));
		info!("sync scheduler started");
	}

	/// Submit a wallet for syncing. A no-op while that wallet is already
	/// executing here; queue backpressure may reject or evict (logged, not
	/// surfaced).
	pub async fn request(&self, wallet_id: &str, priority: SyncPriority) {
		if !self.accepting.load(Ordering::SeqCst) {
			debug!("scheduler stopped, dropping sync request for {}", wallet_id);
			return;
		}
		if self.running.lock().unwrap().contains(wallet_id) {
			debug!("wallet {} already syncing, dropping request", wallet_id);
			return;
		}
		match self.backend.push(SyncJob::new(wallet_id, priority)).await {
			PushOutcome::RejectedFull => {
				warn!("sync queue full, rejected {:?} request for {}", priority, wallet_id);
			}
			PushOutcome::Evicted(evicted) => {
				warn!(
					"sync queue full, evicted {} to admit {:?} request for {}",
					evicted.wallet_id, priority, wallet_id
				);
			}
			_ => {}
		}
		self.wake.notify_one();
	}

	pub fn pending_retries(&self) -> usize {
		self.retry_timers.lock().unwrap().len()
	}

	pub fn running_count(&self) -> usize {
		self.running.lock().unwrap().len()
	}

	/// Stop admission, cancel retry timers, clear the queue and release all
	/// held locks. In-flight reconciliations finish on their own; their
	/// cleanup paths release their own locks.
	pub async fn shutdown(&self) {
		self.accepting.store(false, Ordering::SeqCst);
		for task in self.tasks.lock().unwrap().drain(..) {
			task.abort();
		}
		let timers: Vec<JoinHandle<()>> = {
			let mut map = self.retry_timers.lock().unwrap();
			map.drain().map(|(_, t)| t).collect()
		};
		for timer in timers {
			timer.abort();
		}
		self.backend.clear().await;
		self.locks.release_all().await;
		info!(
			"sync scheduler stopped, {} in-flight reconciliations left to finish",
			self.running_count()
		);
	}

	async fn dispatch_loop(self: Arc<Self>) {
		loop {
			self.dispatch_ready().await;
			tokio::select! {
				_ = self.wake.notified() => {}
				_ = tokio::time::sleep(Duration::from_millis(500)) => {}
			}
		}
	}

	async fn dispatch_ready(self: &Arc<Self>) {
		loop {
			if !self.accepting.load(Ordering::SeqCst) {
				return;
			}
			if self.running.lock().unwrap().len() >= self.settings.max_concurrent_syncs {
				return;
			}
			let Some(job) = self.backend.pop().await else {
				return;
			};
			if !self.running.lock().unwrap().insert(job.wallet_id.clone()) {
				// Raced with an execution that started after the push.
				continue;
			}
			let scheduler = Arc::clone(self);
			tokio::spawn(async move {
				scheduler.execute(job).await;
			});
		}
	}

	async fn execute(self: Arc<Self>, job: SyncJob) {
		let wallet_id = job.wallet_id.clone();
		let key = format!("sync:{}", wallet_id);
		let lock = match self
			.locks
			.acquire(&key, self.settings.sync_lock_ttl(), Duration::ZERO)
			.await
		{
			Some(handle) => handle,
			None => {
				// Another process owns this wallet and is responsible for
				// completing it.
				debug!("sync of {} owned elsewhere, dropping", wallet_id);
				self.finish(&wallet_id);
				return;
			}
		};

		let attempt = job.retry_count + 1;
		self.events
			.emit(
				names::SYNC_STARTED,
				json!({
					"walletId": wallet_id,
					"attempt": attempt,
					"priority": format!("{:?}", job.priority),
				}),
			)
			.await;
		if let Err(e) = self.wallets.set_sync_in_progress(&wallet_id, true).await {
			warn!("could not persist in-progress flag for {}: {}", wallet_id, e);
		}

		// Soft watchdog: cancelling mid-write would race a retry holding no
		// lock, so it only warns. The lock TTL is the hard bound.
		let watchdog = {
			let wallet_id = wallet_id.clone();
			let budget = self.settings.max_sync_duration();
			tokio::spawn(async move {
				tokio::time::sleep(budget).await;
				warn!(
					"sync of {} still running after {:?}, letting it finish",
					wallet_id, budget
				);
			})
		};

		let result = self.executor.sync_wallet(&wallet_id).await;
		watchdog.abort();

		match result {
			Ok(outcome) => {
				self.record_success(&wallet_id).await;
				self.events
					.emit(
						names::SYNC_COMPLETED,
						json!({
							"walletId": wallet_id,
							"newTransactions": outcome.new_transactions,
							"newUtxos": outcome.new_utxos,
							"spentUtxos": outcome.spent_utxos,
							"balanceSat": outcome.balance_sat,
						}),
					)
					.await;
				if !self.locks.release(&lock).await {
					warn!(
						"lock for {} was lost during sync, another process may have taken over",
						wallet_id
					);
				}
			}
			Err(error) => {
				if let Err(e) = self.wallets.set_sync_in_progress(&wallet_id, false).await {
					warn!("could not clear in-progress flag for {}: {}", wallet_id, e);
				}
				// Released before the retry timer arms so other processes
				// compete fairly for the next attempt.
				self.locks.release(&lock).await;
				if error.is_transient() && attempt < self.settings.max_retry_attempts {
					let delay = self.settings.retry_delay(job.retry_count);
					warn!(
						"sync of {} failed (attempt {}/{}), retrying in {:?}: {}",
						wallet_id, attempt, self.settings.max_retry_attempts, delay, error
					);
					self.arm_retry(job, delay);
				} else {
					self.record_terminal_failure(&job, attempt, &error).await;
				}
			}
		}
		self.finish(&wallet_id);
	}

	fn finish(&self, wallet_id: &str) {
		self.running.lock().unwrap().remove(wallet_id);
		self.wake.notify_one();
	}

	async fn record_success(&self, wallet_id: &str) {
		match self.wallets.find(wallet_id).await {
			Ok(Some(mut wallet)) => {
				wallet.last_synced_at = Some(Utc::now());
				wallet.last_sync_status = Some(SyncStatus::Synced);
				wallet.last_sync_error = None;
				wallet.sync_in_progress = false;
				if let Err(e) = self.wallets.save(wallet).await {
					warn!("could not persist sync result for {}: {}", wallet_id, e);
				}
			}
			Ok(None) => {}
			Err(e) => warn!("could not load wallet {} after sync: {}", wallet_id, e),
		}
	}

	fn arm_retry(self: &Arc<Self>, mut job: SyncJob, delay: Duration) {
		job.retry_count += 1;
		let wallet_id = job.wallet_id.clone();
		let scheduler = Arc::clone(self);
		let timer = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			scheduler.retry_timers.lock().unwrap().remove(&job.wallet_id);
			if !scheduler.accepting.load(Ordering::SeqCst) {
				return;
			}
			scheduler.backend.push(job).await;
			scheduler.wake.notify_one();
		});
		if let Some(previous) = self
			.retry_timers
			.lock()
			.unwrap()
			.insert(wallet_id, timer)
		{
			previous.abort();
		}
	}

	async fn record_terminal_failure(
		&self,
		job: &SyncJob,
		attempts: u32,
		error: &crate::sync::SyncError,
	) {
		error!(
			"sync of {} failed terminally after {} attempts: {}",
			job.wallet_id, attempts, error
		);
		match self.wallets.find(&job.wallet_id).await {
			Ok(Some(mut wallet)) => {
				wallet.last_sync_status = Some(SyncStatus::Failed);
				wallet.last_sync_error = Some(error.to_string());
				wallet.sync_in_progress = false;
				if let Err(e) = self.wallets.save(wallet).await {
					warn!("could not persist failure for {}: {}", job.wallet_id, e);
				}
			}
			Ok(None) => {}
			Err(e) => warn!("could not load wallet {}: {}", job.wallet_id, e),
		}
		self.dead_letters.record(
			"sync",
			"wallet-sync",
			json!({
				"walletId": job.wallet_id,
				"priority": format!("{:?}", job.priority),
			}),
			&error.to_string(),
			attempts,
		);
		self.events
			.emit(
				names::SYNC_FAILED,
				json!({
					"walletId": job.wallet_id,
					"error": error.to_string(),
					"attempts": attempts,
				}),
			)
			.await;
	}

	async fn sweep_loop(self: Arc<Self>) {
		let mut ticker =
			tokio::time::interval(Duration::from_secs(self.settings.sync_interval_secs));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			ticker.tick().await;
			if !self.accepting.load(Ordering::SeqCst) {
				return;
			}
			self.sweep().await;
		}
	}

	/// Self-heal flags left behind by a crashed process and re-enqueue
	/// wallets whose last sync is older than the staleness threshold.
	async fn sweep(&self) {
		let wallets = match self.wallets.list().await {
			Ok(wallets) => wallets,
			Err(e) => {
				warn!("staleness sweep could not list wallets: {}", e);
				return;
			}
		};
		let now = Utc::now();
		let threshold = self.settings.staleness_threshold();

		for wallet in wallets {
			let running = self.running.lock().unwrap().contains(&wallet.id);
			if wallet.sync_in_progress && !running {
				warn!("clearing stale in-progress flag for wallet {}", wallet.id);
				if let Err(e) = self.wallets.set_sync_in_progress(&wallet.id, false).await {
					warn!("could not clear in-progress flag for {}: {}", wallet.id, e);
				}
			}
			let stale = wallet
				.last_synced_at
				.map(|at| now - at > threshold)
				.unwrap_or(true);
			if stale && !running {
				self.request(&wallet.id, SyncPriority::Low).await;
			}
		}
	}
}

#[async_trait]
impl SyncRequester for SyncScheduler {
	async fn request_sync(&self, wallet_id: &str, priority: SyncPriority) {
		self.request(wallet_id, priority).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::RecordingEventSink;
	use crate::lock::{LockStore, MemoryLockStore};
	use crate::model::{Network, Wallet};
	use crate::repository::MemoryRepository;
	use crate::scheduler::queue::MemoryJobBackend;
	use crate::sync::{SyncError, SyncOutcome};
	use crate::chain::ChainClientError;
	use std::sync::atomic::AtomicUsize;

	/// Executor that tracks how many reconciliations overlap.
	struct OverlapExecutor {
		current: AtomicUsize,
		max_seen: AtomicUsize,
		completions: AtomicUsize,
	}

	#[async_trait]
	impl SyncExecutor for OverlapExecutor {
		async fn sync_wallet(&self, _wallet_id: &str) -> Result<SyncOutcome, SyncError> {
			let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_seen.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(50)).await;
			self.current.fetch_sub(1, Ordering::SeqCst);
			self.completions.fetch_add(1, Ordering::SeqCst);
			Ok(SyncOutcome::default())
		}
	}

	struct AlwaysFailExecutor;

	#[async_trait]
	impl SyncExecutor for AlwaysFailExecutor {
		async fn sync_wallet(&self, _wallet_id: &str) -> Result<SyncOutcome, SyncError> {
			Err(SyncError::Chain(ChainClientError::Transport(
				"simulated outage".to_string(),
			)))
		}
	}

	fn test_settings() -> SyncSettings {
		SyncSettings {
			sync_interval_secs: 3600,
			retry_delay_secs: vec![0],
			..SyncSettings::default()
		}
	}

	fn build_scheduler(
		executor: Arc<dyn SyncExecutor>,
		repo: Arc<MemoryRepository>,
		store: Arc<MemoryLockStore>,
		events: Arc<RecordingEventSink>,
		settings: SyncSettings,
	) -> Arc<SyncScheduler> {
		let locks = Arc::new(LockManager::new(
			store as Arc<dyn LockStore>,
			Duration::from_millis(10),
		));
		let dead_letters = Arc::new(DeadLetterRecorder::new(100, Duration::from_secs(3600)));
		Arc::new(SyncScheduler::new(
			executor,
			repo,
			locks,
			Arc::new(MemoryJobBackend::new(settings.queue_capacity)),
			dead_letters,
			events,
			settings,
		))
	}

	async fn seed_wallet(repo: &MemoryRepository, wallet_id: &str) {
		let mut wallet = Wallet::new(wallet_id, Network::Regtest);
		wallet.last_synced_at = Some(Utc::now());
		WalletRepository::save(repo, wallet).await.unwrap();
	}

	#[tokio::test]
	async fn one_wallet_never_syncs_concurrently_across_schedulers() {
		let store = Arc::new(MemoryLockStore::new());
		let repo = Arc::new(MemoryRepository::new());
		seed_wallet(&repo, "w1").await;
		let executor = Arc::new(OverlapExecutor {
			current: AtomicUsize::new(0),
			max_seen: AtomicUsize::new(0),
			completions: AtomicUsize::new(0),
		});
		let events = Arc::new(RecordingEventSink::new());

		// Two scheduler instances sharing one lock store, as two processes
		// would.
		let a = build_scheduler(
			executor.clone(),
			repo.clone(),
			store.clone(),
			events.clone(),
			test_settings(),
		);
		let b = build_scheduler(
			executor.clone(),
			repo.clone(),
			store.clone(),
			events.clone(),
			test_settings(),
		);
		a.start();
		b.start();

		for _ in 0..5 {
			a.request("w1", SyncPriority::High).await;
			b.request("w1", SyncPriority::High).await;
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		tokio::time::sleep(Duration::from_millis(300)).await;

		assert!(executor.completions.load(Ordering::SeqCst) >= 1);
		assert_eq!(executor.max_seen.load(Ordering::SeqCst), 1);

		a.shutdown().await;
		b.shutdown().await;
	}

	#[tokio::test]
	async fn exhausted_retries_produce_one_dead_letter() {
		let store = Arc::new(MemoryLockStore::new());
		let repo = Arc::new(MemoryRepository::new());
		seed_wallet(&repo, "w1").await;
		let events = Arc::new(RecordingEventSink::new());
		let settings = test_settings();
		assert_eq!(settings.max_retry_attempts, 3);

		let scheduler = build_scheduler(
			Arc::new(AlwaysFailExecutor),
			repo.clone(),
			store,
			events.clone(),
			settings,
		);
		scheduler.start();
		scheduler.request("w1", SyncPriority::Normal).await;

		// Three zero-delay attempts settle well within this window.
		tokio::time::sleep(Duration::from_millis(500)).await;

		assert_eq!(scheduler.dead_letters.len(), 1);
		let entry = &scheduler.dead_letters.entries()[0];
		assert_eq!(entry.attempts, 3);
		assert_eq!(entry.payload["walletId"], "w1");
		assert_eq!(scheduler.pending_retries(), 0);
		assert_eq!(events.count(names::SYNC_FAILED), 1);
		assert_eq!(events.count(names::SYNC_STARTED), 3);

		let wallet = WalletRepository::find(repo.as_ref(), "w1")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(wallet.last_sync_status, Some(SyncStatus::Failed));
		assert!(wallet.last_sync_error.is_some());
		assert!(!wallet.sync_in_progress);

		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn success_persists_status_and_emits_lifecycle_events() {
		let store = Arc::new(MemoryLockStore::new());
		let repo = Arc::new(MemoryRepository::new());
		seed_wallet(&repo, "w1").await;
		let events = Arc::new(RecordingEventSink::new());
		let executor = Arc::new(OverlapExecutor {
			current: AtomicUsize::new(0),
			max_seen: AtomicUsize::new(0),
			completions: AtomicUsize::new(0),
		});

		let scheduler = build_scheduler(
			executor,
			repo.clone(),
			store.clone(),
			events.clone(),
			test_settings(),
		);
		scheduler.start();
		scheduler.request("w1", SyncPriority::Normal).await;
		tokio::time::sleep(Duration::from_millis(300)).await;

		assert_eq!(events.count(names::SYNC_STARTED), 1);
		assert_eq!(events.count(names::SYNC_COMPLETED), 1);
		let wallet = WalletRepository::find(repo.as_ref(), "w1")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(wallet.last_sync_status, Some(SyncStatus::Synced));
		assert!(!wallet.sync_in_progress);

		// The execution lock was released on completion.
		assert!(!store.is_held("sync:w1").await.unwrap());

		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn shutdown_stops_admission_and_clears_queue() {
		let store = Arc::new(MemoryLockStore::new());
		let repo = Arc::new(MemoryRepository::new());
		let events = Arc::new(RecordingEventSink::new());
		let executor = Arc::new(OverlapExecutor {
			current: AtomicUsize::new(0),
			max_seen: AtomicUsize::new(0),
			completions: AtomicUsize::new(0),
		});

		let scheduler = build_scheduler(executor, repo, store, events.clone(), test_settings());
		scheduler.shutdown().await;
		scheduler.request("w1", SyncPriority::High).await;
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(events.count(names::SYNC_STARTED), 0);
		assert_eq!(scheduler.backend.len().await, 0);
	}

	#[tokio::test]
	async fn sweep_heals_stale_in_progress_flag() {
		let store = Arc::new(MemoryLockStore::new());
		let repo = Arc::new(MemoryRepository::new());
		// A crashed process left the flag set and the wallet never synced.
		let mut wallet = Wallet::new("w1", Network::Regtest);
		wallet.sync_in_progress = true;
		WalletRepository::save(repo.as_ref(), wallet).await.unwrap();

		let events = Arc::new(RecordingEventSink::new());
		let executor = Arc::new(OverlapExecutor {
			current: AtomicUsize::new(0),
			max_seen: AtomicUsize::new(0),
			completions: AtomicUsize::new(0),
		});
		let settings = SyncSettings {
			sync_interval_secs: 1,
			..test_settings()
		};

		let scheduler = build_scheduler(executor, repo.clone(), store, events.clone(), settings);
		scheduler.start();
		// First sweep tick fires immediately.
		tokio::time::sleep(Duration::from_millis(300)).await;

		let wallet = WalletRepository::find(repo.as_ref(), "w1")
			.await
			.unwrap()
			.unwrap();
		assert!(!wallet.sync_in_progress);
		// Never-synced wallet was re-enqueued at low priority and completed.
		assert!(events.count(names::SYNC_COMPLETED) >= 1);
		assert_eq!(wallet.last_sync_status, Some(SyncStatus::Synced));

		scheduler.shutdown().await;
	}
}
