//! Bounded log of operations that exhausted their retries.
//!
//! Entries are kept in a ring: the oldest is evicted once capacity is
//! reached, and entries older than the TTL are purged by a periodic task.
//! The recorder exists for operator visibility and manual replay; nothing in
//! the engine reads it back on its own.

use crate::model::DeadLetterEntry;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct DeadLetterRecorder {
	entries: Mutex<VecDeque<DeadLetterEntry>>,
	capacity: usize,
	ttl: ChronoDuration,
	next_id: AtomicU64,
}

impl DeadLetterRecorder {
	pub fn new(capacity: usize, ttl: Duration) -> Self {
		Self {
			entries: Mutex::new(VecDeque::with_capacity(capacity)),
			capacity,
			ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(7)),
			next_id: AtomicU64::new(1),
		}
	}

	/// Record a terminally failed operation. Evicts the oldest entry when the
	/// ring is full.
	pub fn record(
		&self,
		category: &str,
		operation: &str,
		payload: serde_json::Value,
		error: &str,
		attempts: u32,
	) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let now = Utc::now();
		let entry = DeadLetterEntry {
			id,
			category: category.to_string(),
			operation: operation.to_string(),
			payload,
			error: error.to_string(),
			attempts,
			first_failed_at: now,
			last_failed_at: now,
		};

		warn!(
			"dead-letter recorded: category={} operation={} attempts={} error={}",
			category, operation, attempts, error
		);

		let mut entries = self.entries.lock().unwrap();
		if entries.len() >= self.capacity {
			if let Some(evicted) = entries.pop_front() {
				debug!("dead-letter ring full, evicted entry {}", evicted.id);
			}
		}
		entries.push_back(entry);
		id
	}

	/// Drop entries older than the TTL. Returns how many were purged.
	pub fn purge_expired(&self) -> usize {
		let cutoff = Utc::now() - self.ttl;
		let mut entries = self.entries.lock().unwrap();
		let before = entries.len();
		entries.retain(|entry| entry.last_failed_at >= cutoff);
		let purged = before - entries.len();
		if purged > 0 {
			debug!("purged {} expired dead-letter entries", purged);
		}
		purged
	}

	pub fn entries(&self) -> Vec<DeadLetterEntry> {
		self.entries.lock().unwrap().iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().unwrap().is_empty()
	}

	/// Spawn the periodic purge task. The handle is aborted on shutdown; the
	/// task never blocks process exit.
	pub fn start_purge_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
		let recorder = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				recorder.purge_expired();
			}
		})
	}
}
