//! Fire-and-forget event emission toward downstream consumers.
//!
//! The engine signals sync lifecycle, balance and transaction changes through
//! an [`EventSink`]. Delivery is best-effort: sinks must not fail the caller,
//! so `emit` returns nothing and implementations swallow their own errors.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tracing::info;

/// Event names emitted by the engine.
pub mod names {
	pub const SYNC_STARTED: &str = "sync.started";
	pub const SYNC_COMPLETED: &str = "sync.completed";
	pub const SYNC_FAILED: &str = "sync.failed";
	pub const BALANCE_CHANGED: &str = "balance.changed";
	pub const TX_SENT: &str = "transaction.sent";
	pub const TX_RECEIVED: &str = "transaction.received";
	pub const TX_CONFIRMED: &str = "transaction.confirmed";
	pub const TX_REPLACED: &str = "transaction.replaced";
	pub const NEW_BLOCK: &str = "block.new";
}

/// Sink for engine events. Fire-and-forget: no acknowledgement, no delivery
/// guarantee, and no error surface back into the sync path.
#[async_trait]
pub trait EventSink: Send + Sync {
	async fn emit(&self, name: &str, payload: Value);
}

/// Sink that logs every event. The default wiring for a bare deployment.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
	async fn emit(&self, name: &str, payload: Value) {
		info!("event {}: {}", name, payload);
	}
}

/// Sink that records events in memory, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventSink {
	events: Mutex<Vec<(String, Value)>>,
}

impl RecordingEventSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn events(&self) -> Vec<(String, Value)> {
		self.events.lock().unwrap().clone()
	}

	pub fn names(&self) -> Vec<String> {
		self.events
			.lock()
			.unwrap()
			.iter()
			.map(|(name, _)| name.clone())
			.collect()
	}

	pub fn count(&self, name: &str) -> usize {
		self.events
			.lock()
			.unwrap()
			.iter()
			.filter(|(n, _)| n == name)
			.count()
	}
}

#[async_trait]
impl EventSink for RecordingEventSink {
	async fn emit(&self, name: &str, payload: Value) {
		self.events
			.lock()
			.unwrap()
			.push((name.to_string(), payload));
	}
}
