// src/main.rs
// ELA SPV node entry point. Wires the config, sqlite transaction store,
// in-memory wallet and peer pool together, then runs until ctrl-c.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use ela_spv_rust::chainparams::params_for_network;
use ela_spv_rust::node_config::NodeConfig;
use ela_spv_rust::p2p::messages::{Encodable, MerkleBlockMessage, PeerInfo};
use ela_spv_rust::p2p::peer::{PeerError, PeerListener};
use ela_spv_rust::p2p::peer_manager::{maintain_connections, PeerManager};
use ela_spv_rust::storage::{SqliteTransactionStore, TransactionRecord, TransactionStore};
use ela_spv_rust::transaction::Transaction;
use ela_spv_rust::wallet::{MemoryWallet, Wallet};

/// Glue between the peer pool and the local state: persists relayed
/// transactions, serves wallet transactions back to peers and tracks the
/// best height seen in relayed blocks.
struct SpvNode {
    iso: &'static str,
    store: Arc<dyn TransactionStore>,
    wallet: Arc<MemoryWallet>,
    manager: Arc<PeerManager>,
    fee_per_kb: AtomicU64,
}

impl SpvNode {
    fn new(
        iso: &'static str,
        store: Arc<dyn TransactionStore>,
        wallet: Arc<MemoryWallet>,
        manager: Arc<PeerManager>,
        default_fee_per_kb: u64,
    ) -> Self {
        SpvNode { iso, store, wallet, manager, fee_per_kb: AtomicU64::new(default_fee_per_kb) }
    }
}

impl PeerListener for SpvNode {
    fn on_connected(&self, peer: SocketAddr) {
        info!("peer {} connected", peer);
    }

    fn on_disconnected(&self, peer: SocketAddr, error: Option<PeerError>) {
        match error {
            Some(e) => warn!("peer {} disconnected: {}", peer, e),
            None => info!("peer {} disconnected", peer),
        }
    }

    fn on_relayed_peers(&self, peer: SocketAddr, peers: Vec<PeerInfo>) {
        debug!("peer {} relayed {} address(es)", peer, peers.len());
    }

    fn on_relayed_tx(&self, peer: SocketAddr, mut tx: Transaction) {
        let tx_hash = tx.hash();
        let mut buff = Vec::new();
        if let Err(e) = tx.consensus_encode(&mut Cursor::new(&mut buff)) {
            warn!("failed to serialize tx from {}: {}", peer, e);
            return;
        }
        let record = TransactionRecord {
            tx_hash: hex::encode(tx_hash),
            buff,
            block_height: 0,
            timestamp: chrono::Utc::now().timestamp() as u32,
            remark: tx.remark.clone(),
        };
        if let Err(e) = self.store.put_transaction(self.iso, &record) {
            error!("failed to persist tx {}: {}", record.tx_hash, e);
            return;
        }
        self.wallet.register_transaction(tx);
        debug!("peer {} relayed tx {}", peer, record.tx_hash);
    }

    fn on_has_tx(&self, peer: SocketAddr, tx_hash: [u8; 32]) {
        debug!("peer {} has tx {}", peer, hex::encode(tx_hash));
    }

    fn on_rejected_tx(&self, peer: SocketAddr, tx_hash: [u8; 32], code: u8) {
        warn!("peer {} rejected tx {} (code {:#04x})", peer, hex::encode(tx_hash), code);
    }

    fn on_relayed_block(&self, peer: SocketAddr, block: MerkleBlockMessage) {
        let height = block.header.height as u64;
        if height > self.manager.local_height() {
            self.manager.set_local_height(height);
        }
        for tx_hash in block.matched_tx_hashes() {
            let key = hex::encode(tx_hash);
            match self.store.get_transaction(self.iso, &key) {
                Ok(Some(mut record)) => {
                    record.block_height = block.header.height;
                    record.timestamp = block.header.timestamp;
                    if let Err(e) = self.store.update_transaction(self.iso, &record) {
                        error!("failed to confirm tx {}: {}", key, e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("lookup for tx {} failed: {}", key, e),
            }
        }
        debug!("peer {} relayed block {} at height {}", peer, hex::encode(block.block_hash()), height);
    }

    fn on_relayed_ping(&self, peer: SocketAddr) {
        debug!("peer {} pinged us", peer);
    }

    fn on_notfound(&self, peer: SocketAddr, tx_hashes: Vec<[u8; 32]>, block_hashes: Vec<[u8; 32]>) {
        debug!(
            "peer {} reported {} tx and {} block item(s) not found",
            peer,
            tx_hashes.len(),
            block_hashes.len()
        );
    }

    fn on_set_fee_per_kb(&self, peer: SocketAddr, fee_per_kb: u64) {
        let prev = self.fee_per_kb.swap(fee_per_kb, Ordering::SeqCst);
        debug!("peer {} moved our fee floor from {} to {}", peer, prev, fee_per_kb);
    }

    fn on_requested_tx(&self, peer: SocketAddr, tx_hash: [u8; 32]) -> Option<Transaction> {
        debug!("peer {} requested tx {}", peer, hex::encode(tx_hash));
        self.wallet.transaction_for_hash(&tx_hash)
    }

    fn network_is_reachable(&self) -> bool {
        true
    }

    fn on_thread_cleanup(&self, peer: SocketAddr) {
        debug!("session task for {} finished", peer);
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config_path = std::env::args().nth(1);
    let config = match NodeConfig::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    let params = params_for_network(&config.network);
    info!("starting ELA SPV node on {} ({})", config.network, params.network_id_string);

    let store: Arc<dyn TransactionStore> = match SqliteTransactionStore::new(&config.db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("failed to open transaction store at {}: {}", config.db_path, e);
            std::process::exit(1);
        }
    };

    // Standard-address placeholder until keys are loaded, 0x21 prefix byte.
    let wallet = Arc::new(MemoryWallet::new(
        "EXRkgjTvXu2ep6macpS2PgkGqZqDPSbEoG",
        [0x21; 21],
    ));

    let manager = Arc::new(PeerManager::new(
        &config.user_agent,
        params.magic,
        params.services,
        config.earliest_key_time,
    ));

    let node: Arc<dyn PeerListener> = Arc::new(SpvNode::new(
        params.network_id_string,
        Arc::clone(&store),
        Arc::clone(&wallet),
        Arc::clone(&manager),
        config.default_fee_per_kb,
    ));

    let mut seeds = config.seeds.clone();
    for seed in seeds.iter_mut() {
        if !seed.contains(':') {
            seed.push_str(&format!(":{}", params.standard_port));
        }
    }
    if seeds.is_empty() {
        warn!("no seeds configured, the node will idle until peers are added");
    }

    let pool = tokio::spawn(maintain_connections(
        Arc::clone(&manager),
        Arc::clone(&node),
        seeds,
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    manager.disconnect_all();
    pool.abort();
    info!("ELA SPV node stopped");
}
