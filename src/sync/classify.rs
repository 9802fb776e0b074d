//! Transaction classification.
//!
//! Given a chain transaction, its resolved inputs and the wallet's address
//! set, decide whether the wallet sent, received or consolidated, compute the
//! signed amount and, for spends, the fee. Classification priority is
//! consolidation > sent > received.

use crate::chain::ChainTransaction;
use crate::model::{OutputKind, TxDirection};
use std::collections::HashSet;

/// A transaction input with its prevout resolved (where possible) to the
/// address and value of the output it spends.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
	pub prev_txid: String,
	pub prev_vout: u32,
	pub address: Option<String>,
	pub value_sat: Option<u64>,
}

impl ResolvedInput {
	pub fn is_ours(&self, own: &HashSet<String>) -> bool {
		self.address
			.as_ref()
			.map(|a| own.contains(a))
			.unwrap_or(false)
	}
}

/// Result of classifying one transaction against one wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
	pub direction: TxDirection,
	/// Signed satoshi amount; negative for outflows.
	pub amount_sat: i64,
	/// Present only for spend-type transactions with a plausible fee.
	pub fee_sat: Option<u64>,
}

/// Fee = total inputs − total outputs, computable only when every input
/// value resolved. A non-positive or implausibly large result is treated as
/// unknown rather than stored.
pub fn compute_fee(inputs: &[ResolvedInput], total_output_sat: u64, max_sane_fee: u64) -> Option<u64> {
	let mut total_input: u64 = 0;
	for input in inputs {
		// Prevout values come off the wire; an overflowing sum is as
		// implausible as a negative fee and reported the same way.
		total_input = total_input.checked_add(input.value_sat?)?;
	}
	let fee = total_input.checked_sub(total_output_sat)?;
	if fee > 0 && fee <= max_sane_fee {
		Some(fee)
	} else {
		None
	}
}

/// Classify a transaction for the wallet owning `own`. Returns `None` when
/// the transaction touches none of the wallet's addresses.
pub fn classify_transaction(
	tx: &ChainTransaction,
	inputs: &[ResolvedInput],
	own: &HashSet<String>,
	max_sane_fee: u64,
) -> Option<Classification> {
	let is_sent = inputs.iter().any(|i| i.is_ours(own));

	let mut returned_sat: u64 = 0;
	let mut external_sat: u64 = 0;
	for output in &tx.outputs {
		match output.address.as_ref().filter(|a| own.contains(*a)) {
			Some(_) => returned_sat += output.value_sat,
			None => external_sat += output.value_sat,
		}
	}
	let is_received = returned_sat > 0;

	if !is_sent && !is_received {
		return None;
	}

	if is_sent {
		let fee = compute_fee(inputs, tx.total_output_sat(), max_sane_fee);
		if external_sat == 0 {
			// Everything returns to the wallet: internal move, only the fee
			// leaves.
			return Some(Classification {
				direction: TxDirection::Consolidation,
				amount_sat: -(fee.unwrap_or(0) as i64),
				fee_sat: fee,
			});
		}
		return Some(Classification {
			direction: TxDirection::Sent,
			amount_sat: -((external_sat + fee.unwrap_or(0)) as i64),
			fee_sat: fee,
		});
	}

	Some(Classification {
		direction: TxDirection::Received,
		amount_sat: returned_sat as i64,
		fee_sat: None,
	})
}

/// Classify one output relative to the transaction's direction.
pub fn classify_output(direction: TxDirection, is_ours: bool) -> OutputKind {
	match (direction, is_ours) {
		(TxDirection::Sent, true) => OutputKind::Change,
		(TxDirection::Sent, false) => OutputKind::Recipient,
		(TxDirection::Consolidation, true) => OutputKind::Consolidation,
		(TxDirection::Consolidation, false) => OutputKind::Recipient,
		(TxDirection::Received, true) => OutputKind::Recipient,
		(TxDirection::Received, false) => OutputKind::Unknown,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{ChainTxIn, ChainTxOut};

	const MAX_FEE: u64 = 100_000_000;

	fn own(addresses: &[&str]) -> HashSet<String> {
		addresses.iter().map(|a| a.to_string()).collect()
	}

	fn tx(txid: &str, outputs: Vec<(u64, Option<&str>)>) -> ChainTransaction {
		ChainTransaction {
			txid: txid.to_string(),
			inputs: vec![ChainTxIn {
				prev_txid: "prev".to_string(),
				prev_vout: 0,
			}],
			outputs: outputs
				.into_iter()
				.map(|(value_sat, address)| ChainTxOut {
					value_sat,
					address: address.map(|a| a.to_string()),
				})
				.collect(),
			block_height: Some(100),
			block_time: Some(1_700_000_000),
		}
	}

	fn input(address: &str, value_sat: u64) -> ResolvedInput {
		ResolvedInput {
			prev_txid: "prev".to_string(),
			prev_vout: 0,
			address: Some(address.to_string()),
			value_sat: Some(value_sat),
		}
	}

	#[test]
	fn send_with_change_computes_fee_and_amount() {
		// Spends 50_000 from A1; 30_000 to external X, 15_000 change to A2.
		let own = own(&["A1", "A2"]);
		let tx = tx("t1", vec![(30_000, Some("X")), (15_000, Some("A2"))]);
		let inputs = vec![input("A1", 50_000)];

		let c = classify_transaction(&tx, &inputs, &own, MAX_FEE).unwrap();
		assert_eq!(c.direction, TxDirection::Sent);
		assert_eq!(c.fee_sat, Some(5_000));
		assert_eq!(c.amount_sat, -35_000);

		assert_eq!(classify_output(c.direction, false), OutputKind::Recipient);
		assert_eq!(classify_output(c.direction, true), OutputKind::Change);
	}

	#[test]
	fn all_outputs_returning_is_a_consolidation() {
		// 80_000 in from A1+A2, 79_500 back to A1.
		let own = own(&["A1", "A2"]);
		let tx = tx("t1", vec![(79_500, Some("A1"))]);
		let inputs = vec![input("A1", 30_000), input("A2", 50_000)];

		let c = classify_transaction(&tx, &inputs, &own, MAX_FEE).unwrap();
		assert_eq!(c.direction, TxDirection::Consolidation);
		assert_eq!(c.fee_sat, Some(500));
		assert_eq!(c.amount_sat, -500);
		assert_eq!(classify_output(c.direction, true), OutputKind::Consolidation);
	}

	#[test]
	fn pure_receive_sums_all_own_outputs() {
		// Two outputs to the same wallet in one transaction.
		let own = own(&["A1", "A2"]);
		let tx = tx(
			"t1",
			vec![(10_000, Some("A1")), (2_500, Some("A2")), (90_000, Some("X"))],
		);
		let inputs = vec![input("theirs", 150_000)];

		let c = classify_transaction(&tx, &inputs, &own, MAX_FEE).unwrap();
		assert_eq!(c.direction, TxDirection::Received);
		assert_eq!(c.amount_sat, 12_500);
		assert_eq!(c.fee_sat, None);
	}

	#[test]
	fn unrelated_transaction_is_ignored() {
		let own = own(&["A1"]);
		let tx = tx("t1", vec![(10_000, Some("X"))]);
		let inputs = vec![input("theirs", 11_000)];
		assert!(classify_transaction(&tx, &inputs, &own, MAX_FEE).is_none());
	}

	#[test]
	fn fee_unknown_when_an_input_value_is_unresolved() {
		let own = own(&["A1"]);
		let tx = tx("t1", vec![(30_000, Some("X"))]);
		let inputs = vec![
			input("A1", 20_000),
			ResolvedInput {
				prev_txid: "p2".to_string(),
				prev_vout: 1,
				address: None,
				value_sat: None,
			},
		];

		let c = classify_transaction(&tx, &inputs, &own, MAX_FEE).unwrap();
		assert_eq!(c.direction, TxDirection::Sent);
		assert_eq!(c.fee_sat, None);
		// Amount degrades to the external total without the fee.
		assert_eq!(c.amount_sat, -30_000);
	}

	#[test]
	fn implausible_fee_is_not_stored() {
		// Inputs wildly exceed outputs: over the 1 BTC sanity bound.
		let own = own(&["A1"]);
		let tx = tx("t1", vec![(1_000, Some("X"))]);
		let inputs = vec![input("A1", 200_000_000)];

		let c = classify_transaction(&tx, &inputs, &own, MAX_FEE).unwrap();
		assert_eq!(c.fee_sat, None);

		// Negative computed fee (outputs exceed inputs) is unknown too.
		assert_eq!(compute_fee(&[input("A1", 500)], 1_000, MAX_FEE), None);
	}

	#[test]
	fn overflowing_input_sum_is_an_unknown_fee() {
		// Adversarial prevout values must not wrap the input total.
		let inputs = vec![input("A1", u64::MAX), input("A2", u64::MAX)];
		assert_eq!(compute_fee(&inputs, 1_000, MAX_FEE), None);
		assert_eq!(compute_fee(&[input("A1", u64::MAX)], 0, MAX_FEE), None);
	}
}
