//! Bounded priority queue for sync jobs.
//!
//! One entry per wallet: a re-submission upgrades the queued job's priority
//! (never downgrades) instead of adding a second entry. At capacity the queue
//! applies explicit backpressure rather than growing: low-priority
//! submissions are rejected outright, and a higher-priority submission evicts
//! the lowest-priority queued job to make room.

use crate::model::{SyncJob, SyncPriority, WalletId};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::sync::Mutex;
use tracing::debug;

/// What `push` did with a submission. Rejection and eviction are policy, not
/// errors; callers log and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
	Queued,
	/// Already queued; priority was raised in place.
	Upgraded,
	/// Already queued at an equal or higher priority.
	AlreadyQueued,
	/// Queue full and the submission could not displace anything.
	RejectedFull,
	/// Queue full; this lower-priority job was dropped to admit the new one.
	Evicted(SyncJob),
}

pub struct SyncQueue {
	jobs: Vec<SyncJob>,
	capacity: usize,
}

impl SyncQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			jobs: Vec::new(),
			capacity: capacity.max(1),
		}
	}

	pub fn len(&self) -> usize {
		self.jobs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.jobs.is_empty()
	}

	pub fn contains(&self, wallet_id: &str) -> bool {
		self.jobs.iter().any(|j| j.wallet_id == wallet_id)
	}

	pub fn push(&mut self, job: SyncJob) -> PushOutcome {
		if let Some(existing) = self.jobs.iter_mut().find(|j| j.wallet_id == job.wallet_id) {
			if job.priority > existing.priority {
				existing.priority = job.priority;
				return PushOutcome::Upgraded;
			}
			return PushOutcome::AlreadyQueued;
		}

		if self.jobs.len() >= self.capacity {
			if job.priority == SyncPriority::Low {
				return PushOutcome::RejectedFull;
			}
			let victim = self
				.jobs
				.iter()
				.enumerate()
				.filter(|(_, j)| j.priority < job.priority)
				.min_by_key(|(i, j)| (j.priority, j.requested_at, *i))
				.map(|(i, _)| i);
			return match victim {
				Some(i) => {
					let evicted = self.jobs.remove(i);
					self.jobs.push(job);
					PushOutcome::Evicted(evicted)
				}
				None => PushOutcome::RejectedFull,
			};
		}

		self.jobs.push(job);
		PushOutcome::Queued
	}

	/// Take the next job: highest priority first, oldest request within a
	/// priority.
	pub fn pop(&mut self) -> Option<SyncJob> {
		let idx = self
			.jobs
			.iter()
			.enumerate()
			.min_by_key(|(i, j)| (Reverse(j.priority), j.requested_at, *i))
			.map(|(i, _)| i)?;
		Some(self.jobs.remove(idx))
	}

	pub fn clear(&mut self) {
		self.jobs.clear();
	}
}

/// Seam between the scheduler and job storage. The scheduler owns lock
/// discipline and execution; the backend owns admission and ordering. A
/// durable deployment substitutes a database-backed implementation here and
/// keeps the rest of the scheduler unchanged.
#[async_trait]
pub trait JobBackend: Send + Sync {
	async fn push(&self, job: SyncJob) -> PushOutcome;
	async fn pop(&self) -> Option<SyncJob>;
	async fn contains(&self, wallet_id: &str) -> bool;
	async fn len(&self) -> usize;
	async fn clear(&self);
}

/// The shipped backend: process-local, bounded, lost on restart. The
/// periodic staleness sweep is what makes losing it acceptable.
pub struct MemoryJobBackend {
	queue: Mutex<SyncQueue>,
}

impl MemoryJobBackend {
	pub fn new(capacity: usize) -> Self {
		Self {
			queue: Mutex::new(SyncQueue::new(capacity)),
		}
	}
}

#[async_trait]
impl JobBackend for MemoryJobBackend {
	async fn push(&self, job: SyncJob) -> PushOutcome {
		let wallet_id: WalletId = job.wallet_id.clone();
		let outcome = self.queue.lock().unwrap().push(job);
		debug!("queued sync for {}: {:?}", wallet_id, outcome);
		outcome
	}

	async fn pop(&self) -> Option<SyncJob> {
		self.queue.lock().unwrap().pop()
	}

	async fn contains(&self, wallet_id: &str) -> bool {
		self.queue.lock().unwrap().contains(wallet_id)
	}

	async fn len(&self) -> usize {
		self.queue.lock().unwrap().len()
	}

	async fn clear(&self) {
		self.queue.lock().unwrap().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn job(wallet_id: &str, priority: SyncPriority) -> SyncJob {
		SyncJob::new(wallet_id, priority)
	}

	#[test]
	fn pops_by_priority_then_request_order() {
		let mut queue = SyncQueue::new(10);
		queue.push(job("w1", SyncPriority::Low));
		queue.push(job("w2", SyncPriority::High));
		queue.push(job("w3", SyncPriority::Normal));
		queue.push(job("w4", SyncPriority::High));

		let order: Vec<String> = std::iter::from_fn(|| queue.pop())
			.map(|j| j.wallet_id)
			.collect();
		assert_eq!(order, vec!["w2", "w4", "w3", "w1"]);
	}

	#[test]
	fn resubmission_upgrades_but_never_downgrades() {
		let mut queue = SyncQueue::new(10);
		queue.push(job("w1", SyncPriority::Normal));
		assert_eq!(
			queue.push(job("w1", SyncPriority::High)),
			PushOutcome::Upgraded
		);
		assert_eq!(
			queue.push(job("w1", SyncPriority::Low)),
			PushOutcome::AlreadyQueued
		);
		assert_eq!(queue.len(), 1);
		assert_eq!(queue.pop().unwrap().priority, SyncPriority::High);
	}

	#[test]
	fn full_queue_rejects_low_submissions() {
		let mut queue = SyncQueue::new(2);
		queue.push(job("w1", SyncPriority::Normal));
		queue.push(job("w2", SyncPriority::Normal));
		assert_eq!(
			queue.push(job("w3", SyncPriority::Low)),
			PushOutcome::RejectedFull
		);
		assert_eq!(queue.len(), 2);
	}

	#[test]
	fn full_queue_evicts_lower_priority_for_high() {
		let mut queue = SyncQueue::new(2);
		queue.push(job("w1", SyncPriority::Normal));
		queue.push(job("w2", SyncPriority::Normal));

		match queue.push(job("w3", SyncPriority::High)) {
			PushOutcome::Evicted(evicted) => assert_eq!(evicted.wallet_id, "w1"),
			other => panic!("expected eviction, got {:?}", other),
		}
		assert_eq!(queue.len(), 2);
		assert!(queue.contains("w3"));
		assert!(!queue.contains("w1"));
	}

	#[test]
	fn full_queue_of_equal_priority_rejects_equal_submission() {
		let mut queue = SyncQueue::new(2);
		queue.push(job("w1", SyncPriority::High));
		queue.push(job("w2", SyncPriority::High));
		assert_eq!(
			queue.push(job("w3", SyncPriority::High)),
			PushOutcome::RejectedFull
		);
	}
}
