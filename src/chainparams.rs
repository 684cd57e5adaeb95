// src/chainparams.rs
// Network parameters for the supported ELA networks.

use crate::p2p::messages::{MAINNET_MAGIC, NODE_NETWORK, TESTNET_MAGIC};

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network_id_string: &'static str,
    pub magic: [u8; 4],
    pub standard_port: u16,
    pub services: u64,
}

pub const MAINNET_PARAMS: ChainParams = ChainParams {
    network_id_string: "ela",
    magic: MAINNET_MAGIC,
    standard_port: 20866,
    services: NODE_NETWORK,
};

pub const TESTNET_PARAMS: ChainParams = ChainParams {
    network_id_string: "ela-test",
    magic: TESTNET_MAGIC,
    standard_port: 21866,
    services: NODE_NETWORK,
};

pub fn params_for_network(network: &str) -> &'static ChainParams {
    match network {
        "testnet" | "ela-test" => &TESTNET_PARAMS,
        _ => &MAINNET_PARAMS,
    }
}
