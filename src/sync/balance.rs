//! Running-balance assignment.
//!
//! `balance_after` is a prefix sum over the wallet's transactions in
//! chronological order: confirmation time ascending, with the repository's
//! insertion order breaking ties for same-block and unconfirmed
//! transactions. Replaced transactions never materialized on chain, so they
//! are carried at the running balance without contributing to it.

use crate::model::{RbfStatus, WalletTransaction};

/// Sort into the order balances are assigned in. Unconfirmed transactions
/// (no block time) sort after all confirmed ones.
pub fn chronological(transactions: &mut [WalletTransaction]) {
	transactions.sort_by_key(|tx| (tx.block_time.unwrap_or(i64::MAX), tx.row_id));
}

/// Compute `(row_id, balance_after)` assignments for the given transactions,
/// which must already be in chronological order. Returns the assignments and
/// the final balance.
pub fn running_balances(transactions: &[WalletTransaction]) -> (Vec<(u64, i64)>, i64) {
	let mut balance: i64 = 0;
	let mut assignments = Vec::with_capacity(transactions.len());
	for tx in transactions {
		if tx.rbf_status != RbfStatus::Replaced {
			balance += tx.amount_sat;
		}
		assignments.push((tx.row_id, balance));
	}
	(assignments, balance)
}
