//! Lock acquisition, release and extension with shared-store fallback.

use crate::lock::store::{LockStore, MemoryLockStore};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which backend served a lock. Callers must not assume one or the other;
/// the origin only routes release/extend back to the right store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOrigin {
	Shared,
	LocalFallback,
}

/// Proof of lock ownership. Only the holder of the matching token may
/// release or extend the lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
	pub key: String,
	pub token: String,
	pub expires_at: Instant,
	pub origin: LockOrigin,
}

/// Distributed lock manager.
///
/// Acquisition goes to the shared store first; any backend error degrades
/// transparently to the in-process fallback store so a flaky shared store
/// never takes the engine down with it. Failures during release or extend
/// are reported as "lock lost" and never retried blindly.
pub struct LockManager {
	shared: Arc<dyn LockStore>,
	fallback: Arc<MemoryLockStore>,
	/// Handles this manager currently holds, for release_all on shutdown.
	held: Mutex<HashMap<String, LockHandle>>,
	sweeper: Mutex<Option<JoinHandle<()>>>,
	poll_interval: Duration,
}

impl LockManager {
	pub fn new(shared: Arc<dyn LockStore>, poll_interval: Duration) -> Self {
		Self {
			shared,
			fallback: Arc::new(MemoryLockStore::new()),
			held: Mutex::new(HashMap::new()),
			sweeper: Mutex::new(None),
			poll_interval,
		}
	}

	fn new_token() -> String {
		let mut bytes = [0u8; 16];
		rand::rng().fill(&mut bytes);
		hex::encode(bytes)
	}

	/// Acquire `key` for `ttl`. With `wait` zero this returns immediately on
	/// contention; otherwise it polls until the wait budget is spent.
	pub async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Option<LockHandle> {
		let deadline = Instant::now() + wait;
		loop {
			if let Some(handle) = self.try_acquire_once(key, ttl).await {
				return Some(handle);
			}
			if Instant::now() >= deadline {
				return None;
			}
			tokio::time::sleep(self.poll_interval).await;
		}
	}

	async fn try_acquire_once(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
		let token = Self::new_token();

		let (acquired, origin) = match self.shared.try_acquire(key, &token, ttl).await {
			Ok(acquired) => (acquired, LockOrigin::Shared),
			Err(e) => {
				warn!(
					"shared lock store unavailable for {}, falling back to local locking: {}",
					key, e
				);
				let acquired = self
					.fallback
					.try_acquire(key, &token, ttl)
					.await
					.unwrap_or(false);
				(acquired, LockOrigin::LocalFallback)
			}
		};

		if !acquired {
			return None;
		}

		let handle = LockHandle {
			key: key.to_string(),
			token,
			expires_at: Instant::now() + ttl,
			origin,
		};
		self.held
			.lock()
			.unwrap()
			.insert(key.to_string(), handle.clone());
		debug!("acquired lock {} via {:?}", key, handle.origin);
		Some(handle)
	}

	fn store_for(&self, origin: LockOrigin) -> Arc<dyn LockStore> {
		match origin {
			LockOrigin::Shared => Arc::clone(&self.shared),
			LockOrigin::LocalFallback => {
				Arc::clone(&self.fallback) as Arc<dyn LockStore>
			}
		}
	}

	/// Drop the tracking entry for `handle` only while it still refers to
	/// this exact grant; a stale handle must not untrack a newer lock held
	/// under the same key, or release_all would skip it on shutdown.
	fn untrack(&self, handle: &LockHandle) {
		let mut held = self.held.lock().unwrap();
		if held
			.get(&handle.key)
			.is_some_and(|tracked| tracked.token == handle.token)
		{
			held.remove(&handle.key);
		}
	}

	/// Release a held lock. Returns false when the lock was already lost
	/// (expired and re-acquired elsewhere, or the store call failed).
	pub async fn release(&self, handle: &LockHandle) -> bool {
		self.untrack(handle);
		match self
			.store_for(handle.origin)
			.release_if(&handle.key, &handle.token)
			.await
		{
			Ok(released) => {
				if !released {
					debug!("lock {} already lost at release", handle.key);
				}
				released
			}
			Err(e) => {
				warn!("release of lock {} failed, treating as lost: {}", handle.key, e);
				false
			}
		}
	}

	/// Extend a held lock's TTL. `None` means the lock was lost; the caller
	/// must re-acquire before trusting any further work under this key.
	pub async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Option<LockHandle> {
		match self
			.store_for(handle.origin)
			.extend_if(&handle.key, &handle.token, ttl)
			.await
		{
			Ok(true) => {
				let renewed = LockHandle {
					expires_at: Instant::now() + ttl,
					..handle.clone()
				};
				self.held
					.lock()
					.unwrap()
					.insert(handle.key.clone(), renewed.clone());
				Some(renewed)
			}
			Ok(false) => {
				debug!("lock {} lost before extend", handle.key);
				self.untrack(handle);
				None
			}
			Err(e) => {
				warn!("extend of lock {} failed, treating as lost: {}", handle.key, e);
				self.untrack(handle);
				None
			}
		}
	}

	pub async fn is_locked(&self, key: &str) -> bool {
		match self.shared.is_held(key).await {
			Ok(held) if held => true,
			Ok(_) => self.fallback.is_held(key).await.unwrap_or(false),
			Err(_) => self.fallback.is_held(key).await.unwrap_or(false),
		}
	}

	/// Release every lock this manager holds. Called on shutdown so other
	/// processes do not have to wait out TTLs.
	pub async fn release_all(&self) {
		let handles: Vec<LockHandle> = self.held.lock().unwrap().values().cloned().collect();
		for handle in handles {
			self.release(&handle).await;
		}
	}

	/// Start the fallback-store expiry sweep. Idempotent; the task is
	/// aborted by [`shutdown`](Self::shutdown) and never blocks exit.
	pub fn start_sweeper(&self, interval: Duration) {
		let mut sweeper = self.sweeper.lock().unwrap();
		if sweeper.is_some() {
			return;
		}
		let fallback = Arc::clone(&self.fallback);
		*sweeper = Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				fallback.sweep();
			}
		}));
	}

	pub async fn shutdown(&self) {
		if let Some(task) = self.sweeper.lock().unwrap().take() {
			task.abort();
		}
		self.release_all().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::lock::store::LockError;
	use async_trait::async_trait;

	/// Shared store that always errors, to exercise the fallback path.
	struct DownStore;

	#[async_trait]
	impl LockStore for DownStore {
		async fn try_acquire(
			&self,
			_key: &str,
			_token: &str,
			_ttl: Duration,
		) -> Result<bool, LockError> {
			Err(LockError::Unavailable("connection refused".into()))
		}

		async fn release_if(&self, _key: &str, _token: &str) -> Result<bool, LockError> {
			Err(LockError::Unavailable("connection refused".into()))
		}

		async fn extend_if(
			&self,
			_key: &str,
			_token: &str,
			_ttl: Duration,
		) -> Result<bool, LockError> {
			Err(LockError::Unavailable("connection refused".into()))
		}

		async fn is_held(&self, _key: &str) -> Result<bool, LockError> {
			Err(LockError::Unavailable("connection refused".into()))
		}
	}

	fn manager_with_memory_store() -> (LockManager, Arc<MemoryLockStore>) {
		let store = Arc::new(MemoryLockStore::new());
		let manager = LockManager::new(
			Arc::clone(&store) as Arc<dyn LockStore>,
			Duration::from_millis(10),
		);
		(manager, store)
	}

	#[tokio::test]
	async fn acquire_release_round_trip() {
		let (manager, _) = manager_with_memory_store();
		let handle = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.expect("acquire");
		assert_eq!(handle.origin, LockOrigin::Shared);
		assert!(manager.is_locked("sync:w1").await);
		assert!(manager.release(&handle).await);
		assert!(!manager.is_locked("sync:w1").await);
	}

	#[tokio::test]
	async fn contended_acquire_with_zero_wait_fails_fast() {
		let (manager, _) = manager_with_memory_store();
		let _held = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.unwrap();
		assert!(manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.is_none());
	}

	#[tokio::test]
	async fn wait_budget_polls_until_lock_frees() {
		let store = Arc::new(MemoryLockStore::new());
		let manager = Arc::new(LockManager::new(
			store as Arc<dyn LockStore>,
			Duration::from_millis(10),
		));
		let held = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.unwrap();

		let releaser = {
			let manager = Arc::clone(&manager);
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(30)).await;
				manager.release(&held).await;
			})
		};

		let reacquired = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::from_millis(500))
			.await;
		assert!(reacquired.is_some());
		releaser.await.unwrap();
	}

	#[tokio::test]
	async fn shared_store_failure_falls_back_locally() {
		let manager = LockManager::new(Arc::new(DownStore), Duration::from_millis(10));
		let handle = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.expect("fallback acquire");
		assert_eq!(handle.origin, LockOrigin::LocalFallback);

		// Same token semantics on the fallback: a second acquire contends.
		assert!(manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.is_none());
		assert!(manager.release(&handle).await);
	}

	#[tokio::test]
	async fn stale_handle_cannot_disturb_new_owner() {
		let (manager, store) = manager_with_memory_store();
		let stale = manager
			.acquire("sync:w1", Duration::from_millis(10), Duration::ZERO)
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;

		let fresh = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.expect("reacquire after expiry");

		assert!(!manager.release(&stale).await);
		assert!(manager.extend(&stale, Duration::from_secs(5)).await.is_none());
		assert!(store.is_held("sync:w1").await.unwrap());
		assert!(manager.release(&fresh).await);
	}

	#[tokio::test]
	async fn stale_release_leaves_newer_lock_tracked() {
		let (manager, store) = manager_with_memory_store();
		let stale = manager
			.acquire("sync:w1", Duration::from_millis(10), Duration::ZERO)
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		let _fresh = manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.expect("reacquire after expiry");

		assert!(!manager.release(&stale).await);
		assert!(manager.extend(&stale, Duration::from_secs(5)).await.is_none());

		// The newer grant survived the stale calls and is still released
		// on shutdown instead of waiting out its TTL.
		manager.release_all().await;
		assert!(!store.is_held("sync:w1").await.unwrap());
	}

	#[tokio::test]
	async fn release_all_frees_every_held_key() {
		let (manager, store) = manager_with_memory_store();
		manager
			.acquire("sync:w1", Duration::from_secs(5), Duration::ZERO)
			.await
			.unwrap();
		manager
			.acquire("sync:w2", Duration::from_secs(5), Duration::ZERO)
			.await
			.unwrap();
		manager.release_all().await;
		assert!(!store.is_held("sync:w1").await.unwrap());
		assert!(!store.is_held("sync:w2").await.unwrap());
	}
}
