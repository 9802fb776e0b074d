//! Engine configuration, loaded once at startup.
//!
//! Every knob has a default so the engine can run with no config file at all.
//! A JSON file named by the `SYNC_CONFIG` environment variable overrides the
//! defaults field by field.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Io {
		path: String,
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	Parse {
		path: String,
		source: serde_json::Error,
	},
}

/// All tunables of the sync engine. Durations are plain seconds in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
	/// Periodic full-sweep interval for stale wallets.
	pub sync_interval_secs: u64,
	/// Interval of the fallback confirmation-refresh poll.
	pub confirmation_refresh_secs: u64,
	/// Bounded concurrency of the scheduler's dispatch loop.
	pub max_concurrent_syncs: usize,
	/// Attempt budget for a wallet sync before it goes terminal.
	pub max_retry_attempts: u32,
	/// Per-attempt retry delays; the final entry repeats past its end.
	pub retry_delay_secs: Vec<u64>,
	/// Soft watchdog threshold for a single sync. The sync lock TTL is this
	/// plus `lock_ttl_buffer_secs`.
	pub max_sync_duration_secs: u64,
	pub lock_ttl_buffer_secs: u64,
	/// Wallets not synced within this window are enqueued at low priority.
	pub staleness_threshold_secs: u64,
	/// Polling cadence while waiting on a contended lock.
	pub lock_poll_interval_ms: u64,
	/// Whether this process competes for real-time subscription ownership.
	pub subscriptions_enabled: bool,
	pub subscription_lock_ttl_secs: u64,
	/// Must be shorter than the lock TTL; a failed refresh drops ownership.
	pub subscription_lock_refresh_secs: u64,
	pub subscription_reconcile_secs: u64,
	pub health_check_secs: u64,
	pub reconnect_max_delay_secs: u64,
	/// Reconnect attempts past this count are logged at error level.
	pub reconnect_loud_threshold: u32,
	pub queue_capacity: usize,
	pub history_batch_size: usize,
	pub utxo_batch_size: usize,
	pub subscribe_batch_size: usize,
	/// Transactions processed and persisted per chunk; a crash loses at most
	/// one chunk of progress.
	pub tx_chunk_size: usize,
	pub address_page_size: usize,
	pub gap_limit: u32,
	/// Upper bound on recursive gap-limit expansion within one sync pass.
	pub max_expansion_depth: u32,
	pub dead_letter_capacity: usize,
	pub dead_letter_ttl_secs: u64,
	/// Computed fees above this are treated as implausible and not stored.
	pub max_sane_fee_sat: u64,
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			sync_interval_secs: 600,
			confirmation_refresh_secs: 120,
			max_concurrent_syncs: 3,
			max_retry_attempts: 3,
			retry_delay_secs: vec![30, 120, 600],
			max_sync_duration_secs: 300,
			lock_ttl_buffer_secs: 60,
			staleness_threshold_secs: 3600,
			lock_poll_interval_ms: 100,
			subscriptions_enabled: true,
			subscription_lock_ttl_secs: 90,
			subscription_lock_refresh_secs: 30,
			subscription_reconcile_secs: 300,
			health_check_secs: 60,
			reconnect_max_delay_secs: 300,
			reconnect_loud_threshold: 10,
			queue_capacity: 100,
			history_batch_size: 50,
			utxo_batch_size: 50,
			subscribe_batch_size: 100,
			tx_chunk_size: 25,
			address_page_size: 500,
			gap_limit: 20,
			max_expansion_depth: 3,
			dead_letter_capacity: 500,
			dead_letter_ttl_secs: 7 * 24 * 3600,
			max_sane_fee_sat: 100_000_000,
		}
	}
}

impl SyncSettings {
	/// Load settings from the file named by `SYNC_CONFIG`, falling back to
	/// defaults when the variable is unset.
	pub fn load() -> Result<Self, ConfigError> {
		match std::env::var("SYNC_CONFIG") {
			Ok(path) => Self::from_file(&path),
			Err(_) => Ok(Self::default()),
		}
	}

	pub fn from_file(path: &str) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_string(),
			source,
		})?;
		serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
			path: path.to_string(),
			source,
		})
	}

	pub fn sync_lock_ttl(&self) -> Duration {
		Duration::from_secs(self.max_sync_duration_secs + self.lock_ttl_buffer_secs)
	}

	pub fn max_sync_duration(&self) -> Duration {
		Duration::from_secs(self.max_sync_duration_secs)
	}

	pub fn staleness_threshold(&self) -> chrono::Duration {
		chrono::Duration::seconds(self.staleness_threshold_secs as i64)
	}

	/// Delay before retry attempt `retry_count` (0-based). The final
	/// configured delay repeats past the end of the schedule.
	pub fn retry_delay(&self, retry_count: u32) -> Duration {
		let idx = (retry_count as usize).min(self.retry_delay_secs.len().saturating_sub(1));
		Duration::from_secs(self.retry_delay_secs.get(idx).copied().unwrap_or(60))
	}
}
