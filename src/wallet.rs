// src/wallet.rs
// Wallet seam consumed by the funding engine: prior-output lookup, draft
// assembly, and address/program-hash resolution.

use crate::transaction::{
    Attribute, Transaction, TxInput, TxOutput, ATTRIBUTE_USAGE_NONCE, ELA_ASSET_ID,
    TX_TYPE_TRANSFER_ASSET,
};
use crate::utxo::UtxoList;
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FundingError {
    #[error("input {index} of tx {tx_hash} references an unknown prior output")]
    UnresolvableInput { tx_hash: String, index: u16 },
    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("address {0} cannot be resolved to a program hash")]
    UnresolvableAddress(String),
}

pub trait Wallet: Send + Sync {
    /// Look up a previously seen transaction by content hash.
    fn transaction_for_hash(&self, hash: &[u8; 32]) -> Option<Transaction>;

    /// Assemble a fresh single-recipient draft funded at the given fee.
    fn create_transaction(
        &self,
        fee: u64,
        amount: u64,
        to_address: &str,
        remark: &str,
        memo: &str,
    ) -> Result<Transaction, FundingError>;

    fn default_change_address(&self) -> String;
    fn program_hash_for_address(&self, address: &str) -> Option<[u8; 21]>;
    fn address_for_program_hash(&self, program_hash: &[u8; 21]) -> Option<String>;
}

/// Wallet backed by in-process maps. Key derivation and signing live behind
/// other interfaces; this supplies just enough to fund and track drafts.
pub struct MemoryWallet {
    transactions: Mutex<HashMap<[u8; 32], Transaction>>,
    utxos: Mutex<UtxoList>,
    addresses: Mutex<Vec<(String, [u8; 21])>>,
    change_address: String,
}

impl MemoryWallet {
    pub fn new(change_address: &str, change_program_hash: [u8; 21]) -> Self {
        MemoryWallet {
            transactions: Mutex::new(HashMap::new()),
            utxos: Mutex::new(UtxoList::new()),
            addresses: Mutex::new(vec![(change_address.to_string(), change_program_hash)]),
            change_address: change_address.to_string(),
        }
    }

    pub fn register_address(&self, address: &str, program_hash: [u8; 21]) {
        self.addresses.lock().unwrap().push((address.to_string(), program_hash));
    }

    pub fn register_transaction(&self, mut tx: Transaction) {
        let hash = tx.hash();
        self.transactions.lock().unwrap().insert(hash, tx);
    }

    pub fn add_utxo(&self, hash: [u8; 32], index: u16, amount: u64) {
        self.utxos.lock().unwrap().add(hash, index, amount);
    }

    pub fn utxo_count(&self) -> usize {
        self.utxos.lock().unwrap().len()
    }
}

impl Wallet for MemoryWallet {
    fn transaction_for_hash(&self, hash: &[u8; 32]) -> Option<Transaction> {
        self.transactions.lock().unwrap().get(hash).cloned()
    }

    fn create_transaction(
        &self,
        fee: u64,
        amount: u64,
        to_address: &str,
        remark: &str,
        memo: &str,
    ) -> Result<Transaction, FundingError> {
        let to_program_hash = self
            .program_hash_for_address(to_address)
            .ok_or_else(|| FundingError::UnresolvableAddress(to_address.to_string()))?;
        let required = amount + fee;

        let mut candidates = self.utxos.lock().unwrap().clone();
        candidates.sort_by_output_amount(amount, fee);

        let mut tx = Transaction::new(TX_TYPE_TRANSFER_ASSET);
        // nonce attribute keeps otherwise-identical drafts from colliding on
        // content hash
        tx.attributes.push(Attribute {
            usage: ATTRIBUTE_USAGE_NONCE,
            data: rand::random::<u64>().to_string().into_bytes(),
        });
        let mut gathered: u64 = 0;
        for utxo in candidates.iter() {
            if gathered >= required {
                break;
            }
            tx.inputs.push(TxInput { tx_hash: utxo.hash, index: utxo.index, sequence: 0 });
            gathered += utxo.amount;
        }
        if gathered < required {
            return Err(FundingError::InsufficientFunds { available: gathered, required });
        }
        debug!("funded draft with {} inputs totalling {} for spend {} + fee {}",
            tx.inputs.len(), gathered, amount, fee);

        tx.outputs.push(TxOutput {
            asset_id: ELA_ASSET_ID,
            amount,
            output_lock: 0,
            program_hash: to_program_hash,
        });
        if gathered > required {
            let change_hash = self
                .program_hash_for_address(&self.change_address)
                .ok_or_else(|| FundingError::UnresolvableAddress(self.change_address.clone()))?;
            tx.outputs.push(TxOutput {
                asset_id: ELA_ASSET_ID,
                amount: gathered - required,
                output_lock: 0,
                program_hash: change_hash,
            });
        }
        tx.remark = remark.to_string();
        tx.add_memo(memo);
        tx.reset_hash();
        Ok(tx)
    }

    fn default_change_address(&self) -> String {
        self.change_address.clone()
    }

    fn program_hash_for_address(&self, address: &str) -> Option<[u8; 21]> {
        self.addresses
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, ph)| *ph)
    }

    fn address_for_program_hash(&self, program_hash: &[u8; 21]) -> Option<String> {
        self.addresses
            .lock()
            .unwrap()
            .iter()
            .find(|(_, ph)| ph == program_hash)
            .map(|(a, _)| a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_with_coins(amounts: &[u64]) -> MemoryWallet {
        let wallet = MemoryWallet::new("EChange", [1u8; 21]);
        wallet.register_address("ERecipient", [2u8; 21]);
        for (i, &a) in amounts.iter().enumerate() {
            wallet.add_utxo([i as u8; 32], 0, a);
        }
        wallet
    }

    #[test]
    fn create_transaction_adds_change_for_excess_inputs() {
        let wallet = wallet_with_coins(&[300, 500]);
        let tx = wallet.create_transaction(10, 400, "ERecipient", "", "lunch").unwrap();
        let in_total: u64 = tx
            .inputs
            .iter()
            .map(|i| if i.tx_hash == [0u8; 32] { 300 } else { 500 })
            .sum();
        let out_total: u64 = tx.outputs.iter().map(|o| o.amount).sum();
        assert_eq!(tx.outputs[0].amount, 400);
        assert_eq!(tx.outputs[0].program_hash, [2u8; 21]);
        assert_eq!(in_total, out_total + 10);
        assert_eq!(tx.memo(), "lunch");
    }

    #[test]
    fn create_transaction_fails_when_coins_cannot_cover_fee() {
        let wallet = wallet_with_coins(&[100]);
        let err = wallet.create_transaction(20, 90, "ERecipient", "", "").unwrap_err();
        assert_eq!(err, FundingError::InsufficientFunds { available: 100, required: 110 });
    }

    #[test]
    fn create_transaction_rejects_unknown_recipient() {
        let wallet = wallet_with_coins(&[100]);
        assert!(matches!(
            wallet.create_transaction(1, 10, "ENoSuchAddress", "", ""),
            Err(FundingError::UnresolvableAddress(_))
        ));
    }
}
