// src/p2p/peer.rs
// Per-connection protocol state: handshake latches, relay deduplication,
// ping correlation, and the typed handlers the session loop dispatches into.

use crate::p2p::messages::{
    AddrMessage, Decodable, FilterLoadMessage, HeadersMessage, InventoryMessage, InventoryType,
    InventoryVector, MerkleBlockMessage, PeerInfo, PingMessage, PongMessage, VersionMessage,
    NODE_NETWORK,
};
use crate::transaction::Transaction;
use chrono::Utc;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

// Advertised peer timestamps are clamped toward staleness before storage.
const FUTURE_TIMESTAMP_SLACK_SECS: u64 = 10 * 60;
const STALE_TIMESTAMP_AGE_SECS: u64 = 5 * 24 * 60 * 60;
const TIMESTAMP_SKEW_MARGIN_SECS: u64 = 2 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Disconnected,
    Connecting,
    Connected,
    Unknown,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("malformed {command} payload: {reason}")]
    Malformed { command: &'static str, reason: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("disconnect deadline reached")]
    DeadlineReached,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// Frame-level trouble is tolerated; transport, handshake, and deadline
    /// failures end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PeerError::Handshake(_) | PeerError::DeadlineReached | PeerError::Io(_))
    }
}

pub type PingCallback = Box<dyn FnOnce(bool) + Send>;

/// Cross-task requests into a peer session. The session task is the only
/// writer of peer state; everything else goes through this channel.
pub enum PeerCommand {
    SendTx(Transaction),
    LoadFilter(FilterLoadMessage),
    SendPing { callback: PingCallback },
    SendGetBlocks { locators: Vec<[u8; 32]>, hash_stop: [u8; 32] },
    Disconnect,
}

/// Callbacks a peer session raises. Implementations receive these
/// concurrently from every live connection and synchronize their own state;
/// none of them may block a session indefinitely.
pub trait PeerListener: Send + Sync {
    fn on_connected(&self, peer: SocketAddr);
    fn on_disconnected(&self, peer: SocketAddr, error: Option<PeerError>);
    fn on_relayed_peers(&self, peer: SocketAddr, peers: Vec<PeerInfo>);
    fn on_relayed_tx(&self, peer: SocketAddr, tx: Transaction);
    fn on_has_tx(&self, peer: SocketAddr, tx_hash: [u8; 32]);
    fn on_rejected_tx(&self, peer: SocketAddr, tx_hash: [u8; 32], code: u8);
    fn on_relayed_block(&self, peer: SocketAddr, block: MerkleBlockMessage);
    fn on_relayed_ping(&self, peer: SocketAddr);
    fn on_notfound(&self, peer: SocketAddr, tx_hashes: Vec<[u8; 32]>, block_hashes: Vec<[u8; 32]>);
    fn on_set_fee_per_kb(&self, peer: SocketAddr, fee_per_kb: u64);
    fn on_requested_tx(&self, peer: SocketAddr, tx_hash: [u8; 32]) -> Option<Transaction>;
    fn network_is_reachable(&self) -> bool;
    fn on_thread_cleanup(&self, peer: SocketAddr);
}

pub struct Peer {
    pub address: SocketAddr,
    pub status: ConnectStatus,
    pub version: u32,
    pub user_agent: String,
    pub last_block_height: u64,
    pub fee_per_kb: u64,
    pub ping_time_secs: f64,
    pub earliest_key_time: u32,
    pub local_height: u64,
    pub sent_verack: bool,
    pub got_verack: bool,
    pub sent_getaddr: bool,
    pub sent_filter: bool,
    pub sent_getdata: bool,
    pub sent_mempool: bool,
    pub sent_getblocks: bool,
    known_tx_hashes: HashSet<[u8; 32]>,
    // announcements we already asked for, so inv replays cost nothing
    requested_block_hashes: HashSet<[u8; 32]>,
    // blocks already handed to the listener; solicited replies must not
    // land here before delivery
    known_block_hashes: HashSet<[u8; 32]>,
    published_txs: HashMap<[u8; 32], Transaction>,
    current_block: Option<MerkleBlockMessage>,
    current_block_tx_hashes: Vec<[u8; 32]>,
    pong_callbacks: VecDeque<(PingCallback, Option<Instant>)>,
    pub disconnect_deadline: Option<Instant>,
}

impl Peer {
    pub fn new(address: SocketAddr, earliest_key_time: u32, local_height: u64) -> Self {
        Peer {
            address,
            status: ConnectStatus::Connecting,
            version: 0,
            user_agent: String::new(),
            last_block_height: 0,
            fee_per_kb: 0,
            ping_time_secs: 0.0,
            earliest_key_time,
            local_height,
            sent_verack: false,
            got_verack: false,
            sent_getaddr: false,
            sent_filter: false,
            sent_getdata: false,
            sent_mempool: false,
            sent_getblocks: false,
            known_tx_hashes: HashSet::new(),
            requested_block_hashes: HashSet::new(),
            known_block_hashes: HashSet::new(),
            published_txs: HashMap::new(),
            current_block: None,
            current_block_tx_hashes: Vec::new(),
            pong_callbacks: VecDeque::new(),
            disconnect_deadline: None,
        }
    }

    pub fn host(&self) -> String {
        self.address.to_string()
    }

    pub fn set_version_data(&mut self, version_info: &VersionMessage) {
        self.version = version_info.version;
        self.user_agent = version_info.user_agent.clone();
        self.last_block_height = version_info.start_height as u64;
    }

    /// Both verack latches must be set before any post-handshake traffic.
    pub fn is_ready(&self) -> bool {
        self.sent_verack && self.got_verack
    }

    pub fn knows_tx(&self, hash: &[u8; 32]) -> bool {
        self.known_tx_hashes.contains(hash)
    }

    /// Track a transaction we are publishing through this connection so a
    /// later getdata can be answered from the session itself.
    pub fn note_published_tx(&mut self, mut tx: Transaction) -> [u8; 32] {
        let hash = tx.hash();
        self.known_tx_hashes.insert(hash);
        self.published_txs.insert(hash, tx);
        hash
    }

    pub fn register_ping(&mut self, callback: PingCallback, started: Option<Instant>) {
        self.pong_callbacks.push_back((callback, started));
    }

    pub fn pending_ping_count(&self) -> usize {
        self.pong_callbacks.len()
    }

    /// Invoke every buffered ping callback with a failure marker. Runs on
    /// every disconnect path so no caller waits forever on a dead peer.
    pub fn fail_pending_pings(&mut self) {
        while let Some((callback, _)) = self.pong_callbacks.pop_front() {
            callback(false);
        }
    }

    /// Exponential low-pass over round-trip samples, damping one-off jitter.
    pub fn note_rtt_sample(&mut self, sample_secs: f64) {
        self.ping_time_secs = 0.5 * self.ping_time_secs + 0.5 * sample_secs;
    }

    pub fn disconnect(&mut self, listener: &dyn PeerListener, error: Option<PeerError>) {
        if self.status == ConnectStatus::Disconnected {
            return;
        }
        self.status = ConnectStatus::Disconnected;
        self.fail_pending_pings();
        listener.on_disconnected(self.address, error);
    }

    /// addr: relayed peer addresses. Unsolicited batches are ignored, not
    /// punished; entries without full-block service or outside IPv4 are
    /// dropped; timestamps are normalized toward staleness.
    pub fn accept_addr(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<(), PeerError> {
        if !self.sent_getaddr {
            debug!("[{}] unsolicited addr batch ignored", self.host());
            return Ok(());
        }
        let msg = AddrMessage::decode_payload(payload).map_err(|e| PeerError::Malformed {
            command: "addr",
            reason: e.to_string(),
        })?;
        let now = Utc::now().timestamp() as u64;
        let mut peers = Vec::new();
        for mut info in msg.addresses {
            if info.services & NODE_NETWORK == 0 {
                continue;
            }
            if !info.is_ipv4_mapped() {
                continue;
            }
            if info.timestamp > now + FUTURE_TIMESTAMP_SLACK_SECS || info.timestamp == 0 {
                info.timestamp = now.saturating_sub(STALE_TIMESTAMP_AGE_SECS);
            }
            info.timestamp = info.timestamp.saturating_sub(TIMESTAMP_SKEW_MARGIN_SECS);
            peers.push(info);
        }
        debug!("[{}] addr batch kept {} peer(s)", self.host(), peers.len());
        if !peers.is_empty() {
            listener.on_relayed_peers(self.address, peers);
        }
        Ok(())
    }

    /// pong: resolves exactly one outstanding ping, strictly in arrival
    /// order. A pong with nothing outstanding is a protocol violation.
    pub fn accept_pong(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        if payload.len() < 8 {
            return Err(PeerError::Malformed {
                command: "pong",
                reason: format!("payload is {} bytes, expected at least 8", payload.len()),
            });
        }
        if self.pong_callbacks.is_empty() {
            return Err(PeerError::Protocol("pong with no outstanding ping".to_string()));
        }
        let msg = PongMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "pong", reason: e.to_string() }
        })?;
        self.last_block_height = msg.height;
        if let Some((callback, started)) = self.pong_callbacks.pop_front() {
            if let Some(t0) = started {
                self.note_rtt_sample(t0.elapsed().as_secs_f64());
            }
            callback(true);
        }
        Ok(())
    }

    /// ping: reply with our height and let the listener note liveness.
    pub fn accept_ping(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<PongMessage, PeerError> {
        let msg = PingMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "ping", reason: e.to_string() }
        })?;
        self.last_block_height = msg.height;
        listener.on_relayed_ping(self.address);
        Ok(PongMessage::new(self.local_height))
    }

    /// inv: announcements are deduplicated per connection before the
    /// listener hears about them; the returned inventory, if any, is the
    /// getdata request for what we have not seen.
    pub fn accept_inv(
        &mut self,
        payload: &[u8],
        listener: &dyn PeerListener,
    ) -> Result<Option<InventoryMessage>, PeerError> {
        let msg = InventoryMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "inv", reason: e.to_string() }
        })?;
        let mut wanted = Vec::new();
        for item in msg.inventory {
            match item.inv_type {
                InventoryType::Tx => {
                    if self.known_tx_hashes.insert(item.hash) {
                        listener.on_has_tx(self.address, item.hash);
                        wanted.push(InventoryVector { inv_type: InventoryType::Tx, hash: item.hash });
                    }
                }
                InventoryType::Block | InventoryType::FilteredBlock => {
                    if !self.known_block_hashes.contains(&item.hash)
                        && self.requested_block_hashes.insert(item.hash)
                    {
                        wanted.push(InventoryVector {
                            inv_type: InventoryType::FilteredBlock,
                            hash: item.hash,
                        });
                    }
                }
                InventoryType::Error => {}
            }
        }
        if wanted.is_empty() {
            Ok(None)
        } else {
            self.sent_getdata = true;
            Ok(Some(InventoryMessage { inventory: wanted }))
        }
    }

    /// tx: surface the relay and, if a filtered block is mid-assembly,
    /// check this off its expected list.
    pub fn accept_tx(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<(), PeerError> {
        let mut tx = Transaction::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "tx", reason: e.to_string() }
        })?;
        let hash = tx.hash();
        self.known_tx_hashes.insert(hash);
        listener.on_relayed_tx(self.address, tx);
        if let Some(pos) = self.current_block_tx_hashes.iter().position(|h| *h == hash) {
            self.current_block_tx_hashes.remove(pos);
            if self.current_block_tx_hashes.is_empty() {
                if let Some(block) = self.current_block.take() {
                    listener.on_relayed_block(self.address, block);
                }
            }
        }
        Ok(())
    }

    /// merkleblock: a block is surfaced once all its matched transactions
    /// have arrived; with nothing pending it is surfaced immediately.
    /// Replays of a known block hash are dropped.
    pub fn accept_merkleblock(
        &mut self,
        payload: &[u8],
        listener: &dyn PeerListener,
    ) -> Result<(), PeerError> {
        let msg = MerkleBlockMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "merkleblock", reason: e.to_string() }
        })?;
        let block_hash = msg.block_hash();
        if !self.known_block_hashes.insert(block_hash) {
            debug!("[{}] duplicate merkleblock {}", self.host(), hex::encode(block_hash));
            return Ok(());
        }
        let pending: Vec<[u8; 32]> = msg
            .matched_tx_hashes()
            .into_iter()
            .filter(|h| !self.known_tx_hashes.contains(h))
            .collect();
        if pending.is_empty() {
            listener.on_relayed_block(self.address, msg);
        } else {
            if self.current_block.is_some() {
                warn!("[{}] new merkleblock before previous finished assembling", self.host());
            }
            self.current_block = Some(msg);
            self.current_block_tx_hashes = pending;
        }
        Ok(())
    }

    /// headers: each new header is surfaced as a transaction-less block.
    pub fn accept_headers(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<(), PeerError> {
        let msg = HeadersMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "headers", reason: e.to_string() }
        })?;
        debug!("[{}] got {} header(s)", self.host(), msg.headers.len());
        for header in msg.headers {
            let hash = header.get_hash();
            if self.known_block_hashes.insert(hash) {
                listener.on_relayed_block(self.address, MerkleBlockMessage::from_header(header));
            }
        }
        Ok(())
    }

    /// getdata: the peer wants data from us. Transactions the listener can
    /// supply are returned for sending; everything else goes into one
    /// notfound reply.
    pub fn accept_getdata(
        &mut self,
        payload: &[u8],
        listener: &dyn PeerListener,
    ) -> Result<(Vec<Transaction>, Option<InventoryMessage>), PeerError> {
        let msg = InventoryMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "getdata", reason: e.to_string() }
        })?;
        let mut replies = Vec::new();
        let mut missing = Vec::new();
        for item in msg.inventory {
            if item.inv_type == InventoryType::Tx {
                if let Some(tx) = self.published_txs.get(&item.hash) {
                    replies.push(tx.clone());
                    continue;
                }
                match listener.on_requested_tx(self.address, item.hash) {
                    Some(tx) => replies.push(tx),
                    None => missing.push(item),
                }
            } else {
                missing.push(item);
            }
        }
        let notfound = if missing.is_empty() { None } else { Some(InventoryMessage { inventory: missing }) };
        Ok((replies, notfound))
    }

    pub fn accept_notfound(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<(), PeerError> {
        let msg = InventoryMessage::consensus_decode(&mut Cursor::new(payload)).map_err(|e| {
            PeerError::Malformed { command: "notfound", reason: e.to_string() }
        })?;
        let mut tx_hashes = Vec::new();
        let mut block_hashes = Vec::new();
        for item in msg.inventory {
            match item.inv_type {
                InventoryType::Tx => tx_hashes.push(item.hash),
                InventoryType::Block | InventoryType::FilteredBlock => block_hashes.push(item.hash),
                InventoryType::Error => {}
            }
        }
        listener.on_notfound(self.address, tx_hashes, block_hashes);
        Ok(())
    }

    pub fn accept_reject(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<(), PeerError> {
        let msg = crate::p2p::messages::RejectMessage::consensus_decode(&mut Cursor::new(payload))
            .map_err(|e| PeerError::Malformed { command: "reject", reason: e.to_string() })?;
        warn!(
            "[{}] rejected our {}: code={:#04x}, reason='{}'",
            self.host(),
            msg.message_cmd,
            msg.code,
            msg.reason
        );
        if msg.message_cmd == "tx" {
            listener.on_rejected_tx(self.address, msg.data_hash, msg.code);
        }
        Ok(())
    }

    pub fn accept_feefilter(&mut self, payload: &[u8], listener: &dyn PeerListener) -> Result<(), PeerError> {
        if payload.len() < 8 {
            return Err(PeerError::Malformed {
                command: "feefilter",
                reason: format!("payload is {} bytes, expected at least 8", payload.len()),
            });
        }
        let msg = crate::p2p::messages::FeeFilterMessage::consensus_decode(&mut Cursor::new(payload))
            .map_err(|e| PeerError::Malformed { command: "feefilter", reason: e.to_string() })?;
        self.fee_per_kb = msg.fee_per_kb;
        listener.on_set_fee_per_kb(self.address, msg.fee_per_kb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::messages::{BlockHeaderData, Encodable};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        relayed_peers: Mutex<Vec<Vec<PeerInfo>>>,
        has_tx: Mutex<Vec<[u8; 32]>>,
        relayed_tx: Mutex<Vec<[u8; 32]>>,
        relayed_blocks: Mutex<Vec<[u8; 32]>>,
        rejected_tx: Mutex<Vec<([u8; 32], u8)>>,
        notfound: Mutex<Vec<(Vec<[u8; 32]>, Vec<[u8; 32]>)>>,
        fee_updates: Mutex<Vec<u64>>,
        pings: AtomicUsize,
        disconnects: AtomicUsize,
        servable_tx: Mutex<Option<Transaction>>,
    }

    impl PeerListener for Recorder {
        fn on_connected(&self, _peer: SocketAddr) {}
        fn on_disconnected(&self, _peer: SocketAddr, _error: Option<PeerError>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn on_relayed_peers(&self, _peer: SocketAddr, peers: Vec<PeerInfo>) {
            self.relayed_peers.lock().unwrap().push(peers);
        }
        fn on_relayed_tx(&self, _peer: SocketAddr, tx: Transaction) {
            self.relayed_tx.lock().unwrap().push(tx.compute_hash());
        }
        fn on_has_tx(&self, _peer: SocketAddr, tx_hash: [u8; 32]) {
            self.has_tx.lock().unwrap().push(tx_hash);
        }
        fn on_rejected_tx(&self, _peer: SocketAddr, tx_hash: [u8; 32], code: u8) {
            self.rejected_tx.lock().unwrap().push((tx_hash, code));
        }
        fn on_relayed_block(&self, _peer: SocketAddr, block: MerkleBlockMessage) {
            self.relayed_blocks.lock().unwrap().push(block.block_hash());
        }
        fn on_relayed_ping(&self, _peer: SocketAddr) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }
        fn on_notfound(&self, _peer: SocketAddr, tx_hashes: Vec<[u8; 32]>, block_hashes: Vec<[u8; 32]>) {
            self.notfound.lock().unwrap().push((tx_hashes, block_hashes));
        }
        fn on_set_fee_per_kb(&self, _peer: SocketAddr, fee_per_kb: u64) {
            self.fee_updates.lock().unwrap().push(fee_per_kb);
        }
        fn on_requested_tx(&self, _peer: SocketAddr, _tx_hash: [u8; 32]) -> Option<Transaction> {
            self.servable_tx.lock().unwrap().clone()
        }
        fn network_is_reachable(&self) -> bool {
            true
        }
        fn on_thread_cleanup(&self, _peer: SocketAddr) {}
    }

    fn test_peer() -> Peer {
        Peer::new("127.0.0.1:20866".parse().unwrap(), 0, 100)
    }

    fn encode<T: Encodable>(v: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        v.consensus_encode(&mut Cursor::new(&mut buf)).expect("encode");
        buf
    }

    fn inv_payload(items: Vec<InventoryVector>) -> Vec<u8> {
        encode(&InventoryMessage { inventory: items })
    }

    fn header(seed: u8) -> BlockHeaderData {
        BlockHeaderData {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [seed; 32],
            timestamp: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: seed as u32,
            height: seed as u32,
        }
    }

    #[test]
    fn ready_requires_both_verack_latches() {
        let mut peer = test_peer();
        assert!(!peer.is_ready());
        peer.sent_verack = true;
        assert!(!peer.is_ready());
        peer.got_verack = true;
        assert!(peer.is_ready());
    }

    #[test]
    fn rtt_sample_applies_half_half_low_pass() {
        let mut peer = test_peer();
        peer.ping_time_secs = 1.0;
        peer.note_rtt_sample(3.0);
        assert!((peer.ping_time_secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pongs_resolve_callbacks_in_fifo_order() {
        let mut peer = test_peer();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            peer.register_ping(
                Box::new(move |ok| order.lock().unwrap().push((tag, ok))),
                Some(Instant::now() - Duration::from_millis(10)),
            );
        }
        let payload = encode(&PongMessage::new(123));
        peer.accept_pong(&payload).unwrap();
        peer.accept_pong(&payload).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![("first", true), ("second", true)]);
        assert_eq!(peer.last_block_height, 123);
        assert!(peer.ping_time_secs > 0.0);
        assert!(matches!(peer.accept_pong(&payload), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn short_pong_is_malformed_and_keeps_the_queue() {
        let mut peer = test_peer();
        peer.register_ping(Box::new(|_| {}), None);
        assert!(matches!(peer.accept_pong(&[1, 2, 3]), Err(PeerError::Malformed { .. })));
        assert_eq!(peer.pending_ping_count(), 1);
    }

    #[test]
    fn disconnect_fails_pending_pings_once() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let flags = Arc::new(Mutex::new(Vec::new()));
        let flags2 = Arc::clone(&flags);
        peer.register_ping(Box::new(move |ok| flags2.lock().unwrap().push(ok)), None);
        peer.disconnect(&recorder, Some(PeerError::DeadlineReached));
        peer.disconnect(&recorder, None);
        assert_eq!(*flags.lock().unwrap(), vec![false]);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(peer.status, ConnectStatus::Disconnected);
    }

    #[test]
    fn inv_announcements_are_deduplicated_per_connection() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let payload = inv_payload(vec![InventoryVector { inv_type: InventoryType::Tx, hash: [8u8; 32] }]);
        let first = peer.accept_inv(&payload, &recorder).unwrap();
        assert_eq!(first.unwrap().inventory.len(), 1);
        let second = peer.accept_inv(&payload, &recorder).unwrap();
        assert!(second.is_none());
        assert_eq!(recorder.has_tx.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsolicited_addr_batch_is_ignored() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let info = PeerInfo::from_socket_addr("10.0.0.1:20866".parse().unwrap(), 1_700_000_000, NODE_NETWORK);
        let payload = encode(&AddrMessage { addresses: vec![info] });
        peer.accept_addr(&payload, &recorder).unwrap();
        assert!(recorder.relayed_peers.lock().unwrap().is_empty());
    }

    #[test]
    fn addr_filters_services_and_normalizes_timestamps() {
        let mut peer = test_peer();
        peer.sent_getaddr = true;
        let recorder = Recorder::default();
        let now = Utc::now().timestamp() as u64;
        let future = PeerInfo::from_socket_addr("10.0.0.1:20866".parse().unwrap(), now + 86_400, NODE_NETWORK);
        let no_services = PeerInfo::from_socket_addr("10.0.0.2:20866".parse().unwrap(), now, 0);
        let ipv6_only = PeerInfo::new([0x20; 16], 20866, now, NODE_NETWORK);
        let recent = PeerInfo::from_socket_addr("10.0.0.3:20866".parse().unwrap(), now - 60, NODE_NETWORK);
        let payload = encode(&AddrMessage { addresses: vec![future, no_services, ipv6_only, recent] });
        peer.accept_addr(&payload, &recorder).unwrap();

        let batches = recorder.relayed_peers.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let kept = &batches[0];
        assert_eq!(kept.len(), 2);
        let clamped = now - STALE_TIMESTAMP_AGE_SECS - TIMESTAMP_SKEW_MARGIN_SECS;
        assert!(kept[0].timestamp.abs_diff(clamped) <= 2);
        assert!(kept[1].timestamp.abs_diff(now - 60 - TIMESTAMP_SKEW_MARGIN_SECS) <= 2);
    }

    #[test]
    fn oversized_addr_batch_is_rejected_without_events() {
        let mut peer = test_peer();
        peer.sent_getaddr = true;
        let recorder = Recorder::default();
        let count = crate::p2p::messages::MAX_ADDRESSES_PER_MSG + 1;
        let mut payload = Vec::new();
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&vec![0u8; count as usize * crate::p2p::messages::ADDR_ENTRY_SIZE]);
        assert!(matches!(peer.accept_addr(&payload, &recorder), Err(PeerError::Malformed { .. })));
        assert!(recorder.relayed_peers.lock().unwrap().is_empty());
    }

    #[test]
    fn requested_block_is_surfaced_when_its_merkleblock_arrives() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let block = MerkleBlockMessage::from_header(header(3));
        let block_hash = block.block_hash();

        let announce = inv_payload(vec![InventoryVector {
            inv_type: InventoryType::Block,
            hash: block_hash,
        }]);
        let getdata = peer.accept_inv(&announce, &recorder).unwrap();
        assert_eq!(getdata.unwrap().inventory.len(), 1);

        // the solicited reply must reach the listener, not count as a replay
        peer.accept_merkleblock(&encode(&block), &recorder).unwrap();
        assert_eq!(*recorder.relayed_blocks.lock().unwrap(), vec![block_hash]);

        // a re-announcement of a delivered block requests nothing
        assert!(peer.accept_inv(&announce, &recorder).unwrap().is_none());
    }

    #[test]
    fn duplicate_merkleblock_is_dropped() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let block = MerkleBlockMessage::from_header(header(7));
        let payload = encode(&block);
        peer.accept_merkleblock(&payload, &recorder).unwrap();
        peer.accept_merkleblock(&payload, &recorder).unwrap();
        assert_eq!(recorder.relayed_blocks.lock().unwrap().len(), 1);
    }

    #[test]
    fn merkleblock_waits_for_its_matched_transactions() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let mut tx = Transaction::new(crate::transaction::TX_TYPE_TRANSFER_ASSET);
        tx.outputs.push(crate::transaction::TxOutput {
            asset_id: crate::transaction::ELA_ASSET_ID,
            amount: 1,
            output_lock: 0,
            program_hash: [0u8; 21],
        });
        let tx_hash = tx.hash();

        let block = MerkleBlockMessage {
            header: header(9),
            total_tx: 1,
            hashes: vec![tx_hash],
            flags: vec![0x01],
        };
        peer.accept_merkleblock(&encode(&block), &recorder).unwrap();
        assert!(recorder.relayed_blocks.lock().unwrap().is_empty());

        peer.accept_tx(&encode(&tx), &recorder).unwrap();
        assert_eq!(recorder.relayed_blocks.lock().unwrap().len(), 1);
        assert_eq!(*recorder.relayed_tx.lock().unwrap(), vec![tx_hash]);
    }

    #[test]
    fn headers_surface_each_new_header_once() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let payload = encode(&HeadersMessage { headers: vec![header(1), header(2), header(1)] });
        peer.accept_headers(&payload, &recorder).unwrap();
        assert_eq!(recorder.relayed_blocks.lock().unwrap().len(), 2);
    }

    #[test]
    fn getdata_answers_known_tx_and_notfound_for_the_rest() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let mut tx = Transaction::new(crate::transaction::TX_TYPE_TRANSFER_ASSET);
        tx.outputs.push(crate::transaction::TxOutput {
            asset_id: crate::transaction::ELA_ASSET_ID,
            amount: 5,
            output_lock: 0,
            program_hash: [0u8; 21],
        });
        *recorder.servable_tx.lock().unwrap() = Some(tx);

        let payload = inv_payload(vec![
            InventoryVector { inv_type: InventoryType::Tx, hash: [1u8; 32] },
            InventoryVector { inv_type: InventoryType::Block, hash: [2u8; 32] },
        ]);
        let (replies, notfound) = peer.accept_getdata(&payload, &recorder).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(notfound.unwrap().inventory.len(), 1);
    }

    #[test]
    fn published_tx_is_served_from_the_session_on_getdata() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let mut tx = Transaction::new(crate::transaction::TX_TYPE_TRANSFER_ASSET);
        tx.outputs.push(crate::transaction::TxOutput {
            asset_id: crate::transaction::ELA_ASSET_ID,
            amount: 9,
            output_lock: 0,
            program_hash: [0u8; 21],
        });
        let hash = peer.note_published_tx(tx);
        assert!(peer.knows_tx(&hash));

        let payload = inv_payload(vec![InventoryVector { inv_type: InventoryType::Tx, hash }]);
        let (replies, notfound) = peer.accept_getdata(&payload, &recorder).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(notfound.is_none());

        // the announcement of our own tx must not echo back as a relay
        assert!(peer.accept_inv(&payload, &recorder).unwrap().is_none());
        assert!(recorder.has_tx.lock().unwrap().is_empty());
    }

    #[test]
    fn reject_for_tx_reaches_the_listener() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let msg = crate::p2p::messages::RejectMessage {
            message_cmd: "tx".to_string(),
            code: 0x42,
            reason: "insufficient fee".to_string(),
            data_hash: [6u8; 32],
        };
        peer.accept_reject(&encode(&msg), &recorder).unwrap();
        assert_eq!(*recorder.rejected_tx.lock().unwrap(), vec![([6u8; 32], 0x42)]);
    }

    #[test]
    fn feefilter_updates_peer_and_listener() {
        let mut peer = test_peer();
        let recorder = Recorder::default();
        let payload = encode(&crate::p2p::messages::FeeFilterMessage { fee_per_kb: 4242 });
        peer.accept_feefilter(&payload, &recorder).unwrap();
        assert_eq!(peer.fee_per_kb, 4242);
        assert_eq!(*recorder.fee_updates.lock().unwrap(), vec![4242]);
    }
}
