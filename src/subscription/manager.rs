//! Real-time chain subscriptions for one network.
//!
//! Exactly one process per deployment drives subscriptions: managers compete
//! for a cross-process ownership lock and only the holder connects. The lock
//! is refreshed on a cadence shorter than its TTL; a failed refresh tears
//! everything down immediately, because notifications delivered without
//! ownership would be duplicated by the new holder.

use crate::chain::{ChainClient, ChainClientError, ChainNotification, NotificationStream};
use crate::config::SyncSettings;
use crate::events::{EventSink, names};
use crate::lock::{LockHandle, LockManager};
use crate::model::{Network, SyncPriority, WalletId};
use crate::repository::AddressRepository;
use crate::scheduler::SyncRequester;
use crate::subscription::confirmations::ConfirmationRefresher;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a connected session ended.
enum SessionEnd {
	/// Transport trouble; reconnect with backoff.
	Disconnected,
	/// Ownership refresh failed; another process may now be the owner.
	LockLost,
	/// Explicit stop.
	Stopped,
}

pub struct SubscriptionManager {
	client: Arc<dyn ChainClient>,
	locks: Arc<LockManager>,
	addresses: Arc<dyn AddressRepository>,
	requester: Arc<dyn SyncRequester>,
	refresher: Arc<ConfirmationRefresher>,
	events: Arc<dyn EventSink>,
	settings: SyncSettings,
	network: Network,
	/// Address to wallet resolution cache, rebuilt from the database on each
	/// reconciliation pass. Never a source of truth across restarts.
	wallet_cache: Mutex<HashMap<String, WalletId>>,
	subscribed: Mutex<HashSet<String>>,
	current_height: AtomicU32,
	ownership: Mutex<Option<LockHandle>>,
	stopping: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		client: Arc<dyn ChainClient>,
		locks: Arc<LockManager>,
		addresses: Arc<dyn AddressRepository>,
		requester: Arc<dyn SyncRequester>,
		refresher: Arc<ConfirmationRefresher>,
		events: Arc<dyn EventSink>,
		settings: SyncSettings,
		network: Network,
	) -> Self {
		Self {
			client,
			locks,
			addresses,
			requester,
			refresher,
			events,
			settings,
			network,
			wallet_cache: Mutex::new(HashMap::new()),
			subscribed: Mutex::new(HashSet::new()),
			current_height: AtomicU32::new(0),
			ownership: Mutex::new(None),
			stopping: AtomicBool::new(false),
			task: Mutex::new(None),
		}
	}

	pub fn start(self: &Arc<Self>) {
		if !self.settings.subscriptions_enabled {
			info!("subscriptions disabled, relying on periodic polling only");
			return;
		}
		let mut task = self.task.lock().unwrap();
		if task.is_some() {
			return;
		}
		let manager = Arc::clone(self);
		*task = Some(tokio::spawn(async move {
			manager.run().await;
		}));
	}

	pub async fn stop(&self) {
		self.stopping.store(true, Ordering::SeqCst);
		if let Some(task) = self.task.lock().unwrap().take() {
			task.abort();
		}
		self.teardown().await;
		info!("subscription manager for {} stopped", self.network);
	}

	pub fn current_height(&self) -> u32 {
		self.current_height.load(Ordering::SeqCst)
	}

	pub fn is_owner(&self) -> bool {
		self.ownership.lock().unwrap().is_some()
	}

	async fn run(self: Arc<Self>) {
		let key = format!("subscriptions:{}", self.network);
		let ttl = Duration::from_secs(self.settings.subscription_lock_ttl_secs.max(1));
		let retry = Duration::from_secs(self.settings.subscription_lock_refresh_secs.max(1));

		loop {
			if self.stopping.load(Ordering::SeqCst) {
				return;
			}
			let Some(handle) = self.locks.acquire(&key, ttl, Duration::ZERO).await else {
				// Another process owns subscriptions; keep polling in case it
				// dies.
				tokio::time::sleep(retry).await;
				continue;
			};
			info!("acquired subscription ownership for {}", self.network);
			*self.ownership.lock().unwrap() = Some(handle);

			let end = self.drive().await;
			self.teardown().await;
			match end {
				SessionEnd::Stopped => return,
				SessionEnd::LockLost => {
					warn!(
						"subscription ownership for {} lost, re-entering the contest",
						self.network
					);
				}
				SessionEnd::Disconnected => {}
			}
		}
	}

	/// Connect-and-serve loop under one ownership tenure. Reconnects with
	/// exponential backoff forever; attempts past the loud threshold escalate
	/// the log level but never give up.
	async fn drive(&self) -> SessionEnd {
		// A backoff sleep must never outlast the ownership lock: the extend
		// granted before the sleep covers a full TTL, so capping the sleep
		// at half of it keeps the lock alive across every outage.
		let lock_ttl = Duration::from_secs(self.settings.subscription_lock_ttl_secs.max(1));
		let max_delay = Duration::from_secs(self.settings.reconnect_max_delay_secs.max(1))
			.min(lock_ttl / 2);
		let mut policy = ExponentialBackoff {
			max_interval: max_delay,
			max_elapsed_time: None,
			..ExponentialBackoff::default()
		};
		let mut attempts: u32 = 0;

		loop {
			if self.stopping.load(Ordering::SeqCst) {
				return SessionEnd::Stopped;
			}
			match self.establish().await {
				Ok(mut stream) => {
					attempts = 0;
					policy.reset();
					match self.session(&mut stream).await {
						SessionEnd::Disconnected => {}
						end => return end,
					}
				}
				Err(e) => {
					warn!("subscription connect to {} failed: {}", self.network, e);
				}
			}

			attempts += 1;
			let delay = bounded_delay(&mut policy, max_delay);
			if attempts >= self.settings.reconnect_loud_threshold {
				error!(
					"{} subscription connection down for {} attempts, next retry in {:?}",
					self.network, attempts, delay
				);
			} else {
				info!(
					"reconnecting {} subscriptions in {:?} (attempt {})",
					self.network, delay, attempts
				);
			}
			if !self.refresh_ownership().await {
				return SessionEnd::LockLost;
			}
			tokio::time::sleep(delay).await;
			// Ownership may have lapsed while we slept; prove it again
			// before resubscribing anything.
			if !self.refresh_ownership().await {
				return SessionEnd::LockLost;
			}
		}
	}

	/// Connect, handshake, subscribe headers and the full address set.
	async fn establish(&self) -> Result<NotificationStream, ChainClientError> {
		self.client.connect().await?;
		let stream = self.client.notifications();

		// Version handshake is best-effort; an odd server is worth a log
		// line, not a refusal to sync.
		match self.client.server_version().await {
			Ok(version) => debug!("{} chain server: {}", self.network, version),
			Err(e) => warn!("version handshake with {} server failed: {}", self.network, e),
		}

		let tip = self.client.subscribe_headers().await?;
		self.current_height.store(tip, Ordering::SeqCst);
		info!("subscribed to {} headers at height {}", self.network, tip);

		if self.client.supports_address_subscriptions() {
			self.reconcile_subscriptions().await;
		} else {
			info!(
				"{} chain source lacks address subscriptions, polling only",
				self.network
			);
		}
		Ok(stream)
	}

	async fn session(&self, stream: &mut NotificationStream) -> SessionEnd {
		let mut refresh = self.ticker(self.settings.subscription_lock_refresh_secs);
		let mut reconcile = self.ticker(self.settings.subscription_reconcile_secs);
		let mut health = self.ticker(self.settings.health_check_secs);
		let mut confirmations = self.ticker(self.settings.confirmation_refresh_secs);
		// Swallow the immediate first ticks; establish() already did this
		// work.
		refresh.tick().await;
		reconcile.tick().await;
		health.tick().await;
		confirmations.tick().await;

		loop {
			if self.stopping.load(Ordering::SeqCst) {
				return SessionEnd::Stopped;
			}
			tokio::select! {
				notification = stream.next() => match notification {
					Some(notification) => self.handle_notification(notification).await,
					None => {
						warn!("{} notification stream closed", self.network);
						return SessionEnd::Disconnected;
					}
				},
				_ = refresh.tick() => {
					if !self.refresh_ownership().await {
						return SessionEnd::LockLost;
					}
				}
				_ = reconcile.tick() => {
					if self.client.supports_address_subscriptions() {
						self.reconcile_subscriptions().await;
					}
				}
				_ = health.tick() => {
					if let Err(e) = self.client.ping().await {
						warn!("{} health check failed: {}", self.network, e);
						return SessionEnd::Disconnected;
					}
				}
				_ = confirmations.tick() => {
					self.refresher.refresh_all(self.current_height()).await;
				}
			}
		}
	}

	fn ticker(&self, secs: u64) -> tokio::time::Interval {
		let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		interval
	}

	async fn handle_notification(&self, notification: ChainNotification) {
		match notification {
			ChainNotification::NewBlock { height } => {
				self.current_height.store(height, Ordering::SeqCst);
				debug!("{} tip advanced to {}", self.network, height);
				self.events
					.emit(
						names::NEW_BLOCK,
						json!({
							"network": self.network.to_string(),
							"height": height,
						}),
					)
					.await;
				// Refresh immediately instead of waiting out the poll cycle.
				self.refresher.refresh_all(height).await;
			}
			ChainNotification::AddressActivity { address } => {
				let cached = self.wallet_cache.lock().unwrap().get(&address).cloned();
				let wallet_id = match cached {
					Some(id) => Some(id),
					None => match self.addresses.wallet_for_address(&address).await {
						Ok(Some(id)) => {
							self.wallet_cache
								.lock()
								.unwrap()
								.insert(address.clone(), id.clone());
							Some(id)
						}
						Ok(None) => None,
						Err(e) => {
							warn!("could not resolve wallet for {}: {}", address, e);
							None
						}
					},
				};
				match wallet_id {
					Some(id) => {
						info!("activity on {} triggers sync of wallet {}", address, id);
						self.requester.request_sync(&id, SyncPriority::High).await;
					}
					None => debug!("activity on unknown address {}", address),
				}
			}
		}
	}

	/// Extend the ownership lock. Returns false when it is gone, at which
	/// point this process must stop delivering notifications.
	async fn refresh_ownership(&self) -> bool {
		let handle = self.ownership.lock().unwrap().clone();
		let Some(handle) = handle else {
			return false;
		};
		let ttl = Duration::from_secs(self.settings.subscription_lock_ttl_secs.max(1));
		match self.locks.extend(&handle, ttl).await {
			Some(renewed) => {
				*self.ownership.lock().unwrap() = Some(renewed);
				true
			}
			None => {
				*self.ownership.lock().unwrap() = None;
				false
			}
		}
	}

	/// Walk all addresses in bounded pages and bring the live subscription
	/// set in line: subscribe newly-seen addresses, unsubscribe deleted ones.
	pub async fn reconcile_subscriptions(&self) {
		let desired = match self.load_all_addresses().await {
			Ok(desired) => desired,
			Err(e) => {
				warn!("subscription reconciliation could not page addresses: {}", e);
				return;
			}
		};

		let current: HashSet<String> = self.subscribed.lock().unwrap().clone();
		let to_add: Vec<String> = desired
			.keys()
			.filter(|a| !current.contains(*a))
			.cloned()
			.collect();
		let to_remove: Vec<String> = current
			.iter()
			.filter(|a| !desired.contains_key(*a))
			.cloned()
			.collect();

		self.subscribe_batched(&to_add).await;
		for address in &to_remove {
			if let Err(e) = self.client.unsubscribe_address(address).await {
				debug!("unsubscribe of {} failed: {}", address, e);
			}
			self.subscribed.lock().unwrap().remove(address);
		}
		if !to_add.is_empty() || !to_remove.is_empty() {
			info!(
				"{} subscriptions reconciled: +{} -{}",
				self.network,
				to_add.len(),
				to_remove.len()
			);
		}

		*self.wallet_cache.lock().unwrap() = desired;
	}

	async fn load_all_addresses(
		&self,
	) -> Result<HashMap<String, WalletId>, crate::repository::RepositoryError> {
		let page_size = self.settings.address_page_size.max(1);
		let mut out = HashMap::new();
		let mut after: Option<String> = None;
		loop {
			let page = self.addresses.page(after.as_deref(), page_size).await?;
			let Some(last) = page.last() else {
				break;
			};
			after = Some(last.address.clone());
			for address in page {
				out.insert(address.address, address.wallet_id);
			}
		}
		Ok(out)
	}

	/// Subscribe in bounded batches, one round trip each, falling back to
	/// one-by-one subscription for addresses a batch call failed on.
	async fn subscribe_batched(&self, addresses: &[String]) {
		for chunk in addresses.chunks(self.settings.subscribe_batch_size.max(1)) {
			match self.client.subscribe_address_batch(chunk).await {
				Ok(()) => {
					let mut subscribed = self.subscribed.lock().unwrap();
					for address in chunk {
						subscribed.insert(address.clone());
					}
				}
				Err(e) => {
					warn!(
						"batch subscription of {} addresses failed, retrying one-by-one: {}",
						chunk.len(),
						e
					);
					for address in chunk {
						match self.client.subscribe_address(address).await {
							Ok(()) => {
								self.subscribed.lock().unwrap().insert(address.clone());
							}
							Err(e) => warn!("subscription of {} failed: {}", address, e),
						}
					}
				}
			}
		}
	}

	/// Drop all live subscriptions and surrender the ownership lock.
	async fn teardown(&self) {
		let subscribed: Vec<String> = self.subscribed.lock().unwrap().drain().collect();
		for address in subscribed {
			let _ = self.client.unsubscribe_address(&address).await;
		}
		let handle = self.ownership.lock().unwrap().take();
		if let Some(handle) = handle {
			self.locks.release(&handle).await;
		}
	}
}

/// Next reconnect delay, hard-capped so a sleep can never outrun the
/// ownership lock extended just before it.
fn bounded_delay(policy: &mut ExponentialBackoff, cap: Duration) -> Duration {
	policy.next_backoff().unwrap_or(cap).min(cap)
}
