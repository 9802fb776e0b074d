//! Confirmation-depth refresh against the current tip.

use crate::events::{EventSink, names};
use crate::model::RbfStatus;
use crate::repository::{TransactionRepository, WalletRepository};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Recomputes confirmation depths for confirmed transactions whenever the tip
/// moves, emitting a confirmed event on the 0 to >=1 transition.
pub struct ConfirmationRefresher {
	wallets: Arc<dyn WalletRepository>,
	transactions: Arc<dyn TransactionRepository>,
	events: Arc<dyn EventSink>,
}

impl ConfirmationRefresher {
	pub fn new(
		wallets: Arc<dyn WalletRepository>,
		transactions: Arc<dyn TransactionRepository>,
		events: Arc<dyn EventSink>,
	) -> Self {
		Self {
			wallets,
			transactions,
			events,
		}
	}

	pub async fn refresh_all(&self, tip_height: u32) {
		let wallets = match self.wallets.list().await {
			Ok(wallets) => wallets,
			Err(e) => {
				warn!("confirmation refresh could not list wallets: {}", e);
				return;
			}
		};
		for wallet in wallets {
			if let Err(e) = self.refresh_wallet(&wallet.id, tip_height).await {
				warn!("confirmation refresh failed for {}: {}", wallet.id, e);
			}
		}
	}

	async fn refresh_wallet(
		&self,
		wallet_id: &str,
		tip_height: u32,
	) -> Result<(), crate::repository::RepositoryError> {
		let mut updated = 0usize;
		for tx in self.transactions.list_for_wallet(wallet_id).await? {
			if tx.rbf_status == RbfStatus::Replaced {
				continue;
			}
			let Some(height) = tx.block_height else {
				continue;
			};
			if height > tip_height {
				continue;
			}
			let confirmations = tip_height - height + 1;
			if confirmations == tx.confirmations {
				continue;
			}
			self.transactions
				.set_confirmations(tx.row_id, confirmations)
				.await?;
			updated += 1;
			if tx.confirmations == 0 {
				self.events
					.emit(
						names::TX_CONFIRMED,
						json!({
							"walletId": wallet_id,
							"txid": tx.txid,
							"confirmations": confirmations,
						}),
					)
					.await;
			}
		}
		if updated > 0 {
			debug!(
				"refreshed confirmations of {} transactions for {}",
				updated, wallet_id
			);
		}
		Ok(())
	}
}
