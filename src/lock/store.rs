//! Lock store backends.
//!
//! A [`LockStore`] is the minimal atomic surface a lock backend must offer:
//! set-if-absent with TTL, compare-and-delete, compare-and-extend, and an
//! existence probe. The shared-store implementation (Redis or similar) is
//! injected by the embedding process; this crate ships [`MemoryLockStore`],
//! which doubles as the in-process fallback backend and the test store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
	#[error("lock store unavailable: {0}")]
	Unavailable(String),

	#[error("lock store operation failed: {0}")]
	Backend(String),
}

/// Atomic operations a lock backend must provide. Every method keys on the
/// caller's fencing token; the store never exposes stored tokens.
#[async_trait]
pub trait LockStore: Send + Sync {
	/// Set `key -> token` with `ttl` only if `key` is absent (or expired).
	/// Returns whether the caller now holds the lock.
	async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

	/// Delete `key` only if it still stores `token`.
	async fn release_if(&self, key: &str, token: &str) -> Result<bool, LockError>;

	/// Reset the TTL of `key` only if it still stores `token`.
	async fn extend_if(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

	/// Whether `key` currently holds an unexpired lock.
	async fn is_held(&self, key: &str) -> Result<bool, LockError>;
}

struct StoredLock {
	token: String,
	expires_at: Instant,
}

/// In-memory lock store with lazy expiry.
///
/// Shared between processes it is not; shared between components of one
/// process (or several scheduler instances in a test) it is, via `Arc`.
#[derive(Default)]
pub struct MemoryLockStore {
	locks: Mutex<HashMap<String, StoredLock>>,
}

impl MemoryLockStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Evict expired entries. Called by the fallback sweeper so abandoned
	/// keys do not accumulate between acquisitions.
	pub fn sweep(&self) -> usize {
		let now = Instant::now();
		let mut locks = self.locks.lock().unwrap();
		let before = locks.len();
		locks.retain(|_, stored| stored.expires_at > now);
		before - locks.len()
	}

	pub fn len(&self) -> usize {
		self.locks.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.locks.lock().unwrap().is_empty()
	}
}

#[async_trait]
impl LockStore for MemoryLockStore {
	async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
		let now = Instant::now();
		let mut locks = self.locks.lock().unwrap();
		match locks.get(key) {
			Some(stored) if stored.expires_at > now => Ok(false),
			_ => {
				locks.insert(
					key.to_string(),
					StoredLock {
						token: token.to_string(),
						expires_at: now + ttl,
					},
				);
				Ok(true)
			}
		}
	}

	async fn release_if(&self, key: &str, token: &str) -> Result<bool, LockError> {
		let now = Instant::now();
		let mut locks = self.locks.lock().unwrap();
		match locks.get(key) {
			Some(stored) if stored.expires_at > now && stored.token == token => {
				locks.remove(key);
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn extend_if(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
		let now = Instant::now();
		let mut locks = self.locks.lock().unwrap();
		match locks.get_mut(key) {
			Some(stored) if stored.expires_at > now && stored.token == token => {
				stored.expires_at = now + ttl;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn is_held(&self, key: &str) -> Result<bool, LockError> {
		let now = Instant::now();
		let locks = self.locks.lock().unwrap();
		Ok(locks
			.get(key)
			.map(|stored| stored.expires_at > now)
			.unwrap_or(false))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn acquire_is_exclusive_until_expiry() {
		let store = MemoryLockStore::new();
		assert!(store
			.try_acquire("k", "t1", Duration::from_secs(10))
			.await
			.unwrap());
		assert!(!store
			.try_acquire("k", "t2", Duration::from_secs(10))
			.await
			.unwrap());
		assert!(store.is_held("k").await.unwrap());
	}

	#[tokio::test]
	async fn expired_lock_can_be_reacquired() {
		let store = MemoryLockStore::new();
		assert!(store
			.try_acquire("k", "t1", Duration::from_millis(10))
			.await
			.unwrap());
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(!store.is_held("k").await.unwrap());
		assert!(store
			.try_acquire("k", "t2", Duration::from_secs(10))
			.await
			.unwrap());
	}

	#[tokio::test]
	async fn release_and_extend_are_token_gated() {
		let store = MemoryLockStore::new();
		store
			.try_acquire("k", "t1", Duration::from_secs(10))
			.await
			.unwrap();

		assert!(!store.release_if("k", "wrong").await.unwrap());
		assert!(!store
			.extend_if("k", "wrong", Duration::from_secs(20))
			.await
			.unwrap());
		// Unaffected by the failed attempts.
		assert!(store.is_held("k").await.unwrap());

		assert!(store
			.extend_if("k", "t1", Duration::from_secs(20))
			.await
			.unwrap());
		assert!(store.release_if("k", "t1").await.unwrap());
		assert!(!store.is_held("k").await.unwrap());
	}

	#[tokio::test]
	async fn sweep_drops_only_expired_entries() {
		let store = MemoryLockStore::new();
		store
			.try_acquire("short", "t", Duration::from_millis(5))
			.await
			.unwrap();
		store
			.try_acquire("long", "t", Duration::from_secs(60))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(store.sweep(), 1);
		assert_eq!(store.len(), 1);
	}
}
