// src/utxo.rs
// Candidate set of spendable outputs and the selection ordering used when
// funding a transaction.

use crate::transaction::TxInput;

/// One unspent output. Identity is (hash, index); the amount is a lookup
/// result and may be unknown (zero) for entries added from bare inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub hash: [u8; 32],
    pub index: u16,
    pub amount: u64,
}

#[derive(Debug, Clone, Default)]
pub struct UtxoList {
    utxos: Vec<Utxo>,
}

impl UtxoList {
    pub fn new() -> Self {
        UtxoList { utxos: Vec::new() }
    }

    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.utxos.iter().any(|u| &u.hash == hash)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn clear(&mut self) {
        self.utxos.clear();
    }

    pub fn get(&self, i: usize) -> Option<&Utxo> {
        self.utxos.get(i)
    }

    pub fn add(&mut self, hash: [u8; 32], index: u16, amount: u64) {
        self.utxos.push(Utxo { hash, index, amount });
    }

    pub fn add_by_input(&mut self, input: &TxInput) {
        self.utxos.push(Utxo { hash: input.tx_hash, index: input.index, amount: 0 });
    }

    pub fn remove_at(&mut self, index: usize) {
        if index < self.utxos.len() {
            self.utxos.remove(index);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.iter()
    }

    /// Order candidates for selection. Sort ascending by amount, then
    /// reverse the prefix of entries at or below `2*target + fee_per_kb`:
    /// small-enough inputs are offered largest-first while oversized inputs
    /// stay smallest-of-the-large first. A single input slightly above the
    /// need wins over always grabbing the biggest coin.
    pub fn sort_by_output_amount(&mut self, total_output_amount: u64, fee_per_kb: u64) {
        let threshold = total_output_amount.saturating_mul(2).saturating_add(fee_per_kb);
        self.utxos.sort_by_key(|u| u.amount);
        let threshold_index = self
            .utxos
            .iter()
            .position(|u| u.amount > threshold)
            .unwrap_or(0);
        if threshold_index > 0 {
            self.utxos[..threshold_index].reverse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_amounts(amounts: &[u64]) -> UtxoList {
        let mut list = UtxoList::new();
        for (i, &a) in amounts.iter().enumerate() {
            list.add([i as u8; 32], 0, a);
        }
        list
    }

    fn amounts(list: &UtxoList) -> Vec<u64> {
        list.iter().map(|u| u.amount).collect()
    }

    #[test]
    fn sort_reverses_prefix_below_threshold() {
        // target=100, fee=50 -> threshold=250
        let mut list = list_with_amounts(&[400, 30, 250, 800, 120]);
        list.sort_by_output_amount(100, 50);
        assert_eq!(amounts(&list), vec![250, 120, 30, 400, 800]);
    }

    #[test]
    fn sorted_order_keeps_prefix_descending_and_suffix_ascending() {
        let mut list = list_with_amounts(&[7, 900, 42, 13, 600, 77, 250, 3]);
        let target = 60;
        let fee_per_kb = 10;
        let threshold = 2 * target + fee_per_kb;
        list.sort_by_output_amount(target, fee_per_kb);
        let ordered = amounts(&list);
        let split = ordered.iter().position(|&a| a > threshold).unwrap_or(ordered.len());
        let (prefix, suffix) = ordered.split_at(split);
        assert!(prefix.windows(2).all(|w| w[0] >= w[1]));
        assert!(suffix.windows(2).all(|w| w[0] <= w[1]));
        if let (Some(p), Some(s)) = (prefix.iter().max(), suffix.iter().min()) {
            assert!(s >= p);
        }
    }

    #[test]
    fn sort_with_all_amounts_above_threshold_stays_ascending() {
        let mut list = list_with_amounts(&[500, 300, 900]);
        list.sort_by_output_amount(10, 10);
        assert_eq!(amounts(&list), vec![300, 500, 900]);
    }

    #[test]
    fn add_by_input_records_unknown_amount() {
        let mut list = UtxoList::new();
        let input = TxInput { tx_hash: [5u8; 32], index: 2, sequence: 0 };
        list.add_by_input(&input);
        assert!(list.contains(&[5u8; 32]));
        assert_eq!(list.get(0).unwrap().amount, 0);
        assert_eq!(list.get(0).unwrap().index, 2);
    }

    #[test]
    fn remove_at_out_of_range_is_a_no_op() {
        let mut list = list_with_amounts(&[10]);
        list.remove_at(5);
        assert_eq!(list.len(), 1);
    }
}
