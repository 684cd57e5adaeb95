// src/lib.rs
//! SPV client engine for the ELA network: wire codec, peer sessions, and the
//! transaction funding pipeline. The node binary wires these together; other
//! consumers drive `PeerManager`, the wallet, and the completer directly.

pub mod chainparams;
pub mod node_config;
pub mod p2p;
pub mod storage;
pub mod transaction;
pub mod tx_completer;
pub mod utxo;
pub mod wallet;
