// src/tx_completer.rs
// Late fee reconciliation: balance a funded draft against the fee estimate
// that arrives after assembly, fixing up change or re-funding from scratch.

use crate::transaction::{Transaction, TxOutput, ELA_ASSET_ID};
use crate::wallet::{FundingError, Wallet};
use log::debug;

pub struct TransactionCompleter<'a> {
    transaction: Transaction,
    wallet: &'a dyn Wallet,
}

impl<'a> TransactionCompleter<'a> {
    pub fn new(transaction: Transaction, wallet: &'a dyn Wallet) -> Self {
        TransactionCompleter { transaction, wallet }
    }

    /// Balance the draft against `actual_fee`. If the existing input set has
    /// enough headroom, the change output absorbs the exact difference;
    /// otherwise the draft is discarded and the wallet assembles a new one
    /// for the same destination, amount, remark, and memo. Either way every
    /// placeholder asset id is resolved and the content hash recomputed.
    pub fn complete(self, actual_fee: u64) -> Result<Transaction, FundingError> {
        if self.transaction.outputs.is_empty() {
            return Err(FundingError::NoOutputs);
        }
        let input_amount = self.inputs_amount()?;
        let output_amount = self.transaction.outputs[0].amount;
        let change_amount = self.transaction.outputs.get(1).map(|o| o.amount).unwrap_or(0);

        let mut result = if input_amount > output_amount
            && input_amount - output_amount - change_amount >= actual_fee
        {
            let mut tx = self.transaction;
            Self::set_change(self.wallet, &mut tx, input_amount - output_amount - actual_fee)?;
            tx
        } else {
            debug!(
                "draft headroom {} below fee {}, re-funding",
                input_amount.saturating_sub(output_amount + change_amount),
                actual_fee
            );
            let to_hash = self.transaction.outputs[0].program_hash;
            let to_address = self
                .wallet
                .address_for_program_hash(&to_hash)
                .ok_or_else(|| FundingError::UnresolvableAddress(hex::encode(to_hash)))?;
            let memo = self.transaction.memo();
            self.wallet.create_transaction(
                actual_fee,
                output_amount,
                &to_address,
                &self.transaction.remark,
                &memo,
            )?
        };

        for output in &mut result.outputs {
            if output.asset_id == [0u8; 32] {
                output.asset_id = ELA_ASSET_ID;
            }
        }
        result.reset_hash();
        result.hash();
        Ok(result)
    }

    /// Sum the draft's inputs by resolving each referenced prior output.
    /// Any input the wallet cannot resolve is a hard error, never a value
    /// to guess at.
    fn inputs_amount(&self) -> Result<u64, FundingError> {
        let mut amount: u64 = 0;
        for input in &self.transaction.inputs {
            let prior = self.wallet.transaction_for_hash(&input.tx_hash).ok_or_else(|| {
                FundingError::UnresolvableInput {
                    tx_hash: hex::encode(input.tx_hash),
                    index: input.index,
                }
            })?;
            let output = prior.outputs.get(input.index as usize).ok_or_else(|| {
                FundingError::UnresolvableInput {
                    tx_hash: hex::encode(input.tx_hash),
                    index: input.index,
                }
            })?;
            amount += output.amount;
        }
        Ok(amount)
    }

    fn set_change(wallet: &dyn Wallet, tx: &mut Transaction, actual_change: u64) -> Result<(), FundingError> {
        if tx.outputs.len() >= 2 {
            tx.outputs[1].amount = actual_change;
        } else {
            let change_address = wallet.default_change_address();
            let program_hash = wallet
                .program_hash_for_address(&change_address)
                .ok_or_else(|| FundingError::UnresolvableAddress(change_address))?;
            tx.outputs.push(TxOutput {
                asset_id: ELA_ASSET_ID,
                amount: actual_change,
                output_lock: 0,
                program_hash,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxInput, TX_TYPE_TRANSFER_ASSET};
    use crate::wallet::MemoryWallet;

    const CHANGE_HASH: [u8; 21] = [1u8; 21];
    const RECIPIENT_HASH: [u8; 21] = [2u8; 21];

    fn wallet_with_prior_output(amount: u64) -> (MemoryWallet, [u8; 32]) {
        let wallet = MemoryWallet::new("EChange", CHANGE_HASH);
        wallet.register_address("ERecipient", RECIPIENT_HASH);
        let mut prior = Transaction::new(TX_TYPE_TRANSFER_ASSET);
        prior.outputs.push(TxOutput {
            asset_id: ELA_ASSET_ID,
            amount,
            output_lock: 0,
            program_hash: CHANGE_HASH,
        });
        let prior_hash = prior.hash();
        wallet.register_transaction(prior.clone());
        wallet.add_utxo(prior_hash, 0, amount);
        (wallet, prior_hash)
    }

    fn draft(prior_hash: [u8; 32], out: u64, change: Option<u64>) -> Transaction {
        let mut tx = Transaction::new(TX_TYPE_TRANSFER_ASSET);
        tx.inputs.push(TxInput { tx_hash: prior_hash, index: 0, sequence: 0 });
        tx.outputs.push(TxOutput {
            asset_id: [0u8; 32],
            amount: out,
            output_lock: 0,
            program_hash: RECIPIENT_HASH,
        });
        if let Some(c) = change {
            tx.outputs.push(TxOutput {
                asset_id: ELA_ASSET_ID,
                amount: c,
                output_lock: 0,
                program_hash: CHANGE_HASH,
            });
        }
        tx
    }

    #[test]
    fn headroom_adjusts_change_in_place() {
        let (wallet, prior_hash) = wallet_with_prior_output(1000);
        let tx = draft(prior_hash, 700, Some(200));
        let completed = TransactionCompleter::new(tx, &wallet).complete(50).unwrap();
        assert_eq!(completed.inputs.len(), 1);
        assert_eq!(completed.outputs.len(), 2);
        assert_eq!(completed.outputs[0].amount, 700);
        assert_eq!(completed.outputs[1].amount, 250);
    }

    #[test]
    fn fee_exceeding_headroom_refunds_from_wallet() {
        let (wallet, prior_hash) = wallet_with_prior_output(1000);
        // headroom is 1000-700-200=100, fee 400 cannot be absorbed in place
        wallet.add_utxo([0xaa; 32], 0, 5000);
        let tx = draft(prior_hash, 700, Some(200));
        let completed = TransactionCompleter::new(tx, &wallet).complete(400).unwrap();
        assert_eq!(completed.outputs[0].amount, 700);
        assert_eq!(completed.outputs[0].program_hash, RECIPIENT_HASH);
        // wallet had to reach for the larger coin
        assert!(completed.inputs.iter().any(|i| i.tx_hash == [0xaa; 32]));
    }

    #[test]
    fn refund_failure_surfaces_insufficient_funds() {
        let (wallet, prior_hash) = wallet_with_prior_output(1000);
        let tx = draft(prior_hash, 700, Some(200));
        assert!(matches!(
            TransactionCompleter::new(tx, &wallet).complete(5000),
            Err(FundingError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn missing_change_output_is_created() {
        let (wallet, prior_hash) = wallet_with_prior_output(1000);
        let tx = draft(prior_hash, 700, None);
        let completed = TransactionCompleter::new(tx, &wallet).complete(50).unwrap();
        assert_eq!(completed.outputs.len(), 2);
        assert_eq!(completed.outputs[1].amount, 250);
        assert_eq!(completed.outputs[1].program_hash, CHANGE_HASH);
    }

    #[test]
    fn unknown_input_is_a_hard_error() {
        let (wallet, _) = wallet_with_prior_output(1000);
        let tx = draft([0xee; 32], 700, Some(200));
        assert!(matches!(
            TransactionCompleter::new(tx, &wallet).complete(50),
            Err(FundingError::UnresolvableInput { .. })
        ));
    }

    #[test]
    fn placeholder_asset_ids_are_resolved_and_hash_refreshed() {
        let (wallet, prior_hash) = wallet_with_prior_output(1000);
        let mut tx = draft(prior_hash, 700, Some(200));
        let stale = tx.hash();
        let mut completed = TransactionCompleter::new(tx, &wallet).complete(50).unwrap();
        assert!(completed.outputs.iter().all(|o| o.asset_id == ELA_ASSET_ID));
        assert_ne!(completed.hash(), stale);
    }
}
