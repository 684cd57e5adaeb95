// src/p2p/peer_manager.rs
// Connection pool and the per-peer session task.

use crate::p2p::connection::{
    connect_and_handshake, read_network_message, send_empty_payload_message, send_payload_message,
};
use crate::p2p::messages::{
    AddrMessage, FilterLoadMessage, GetBlocksMessage, InventoryMessage, InventoryType,
    InventoryVector, MessageHeader, PingMessage, CMD_ADDR, CMD_FEEFILTER, CMD_FILTERLOAD,
    CMD_GETADDR, CMD_GETBLOCKS, CMD_GETDATA, CMD_HEADERS, CMD_INV, CMD_MEMPOOL, CMD_MERKLEBLOCK,
    CMD_NOTFOUND, CMD_PING, CMD_PONG, CMD_REJECT, CMD_TX, CMD_VERACK, PROTOCOL_VERSION,
};
use crate::p2p::peer::{ConnectStatus, Peer, PeerCommand, PeerError, PeerListener, PingCallback};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;

const PING_INTERVAL_SECONDS: u64 = 45;
const RECONNECT_CHECK_SECONDS: u64 = 30;
const MIN_CONNECTED_PEERS: usize = 3;
const SESSION_DEADLINE_SECONDS: u64 = 120;

/// Cross-task face of one live session: everything the pool needs without
/// touching the session's own state.
pub struct PeerHandle {
    pub command_tx: mpsc::UnboundedSender<PeerCommand>,
    pub user_agent: String,
    pub start_height: u32,
}

pub struct PeerManager {
    pub peers: Mutex<HashMap<SocketAddr, PeerHandle>>,
    user_agent: String,
    magic: [u8; 4],
    services: u64,
    earliest_key_time: u32,
    local_height: AtomicU64,
}

impl PeerManager {
    pub fn new(user_agent: &str, magic: [u8; 4], services: u64, earliest_key_time: u32) -> Self {
        PeerManager {
            peers: Mutex::new(HashMap::new()),
            user_agent: user_agent.to_string(),
            magic,
            services,
            earliest_key_time,
            local_height: AtomicU64::new(0),
        }
    }

    pub fn set_local_height(&self, height: u64) {
        self.local_height.store(height, Ordering::SeqCst);
    }

    pub fn local_height(&self) -> u64 {
        self.local_height.load(Ordering::SeqCst)
    }

    pub fn get_peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn remove_peer(&self, addr: &SocketAddr) {
        if self.peers.lock().unwrap().remove(addr).is_some() {
            info!("removed peer {} from pool", addr);
        }
    }

    pub fn best_peer_height(&self) -> Option<u32> {
        self.peers.lock().unwrap().values().map(|h| h.start_height).max()
    }

    /// Hand the completed transaction to every live session for relay.
    pub fn broadcast_transaction(&self, tx: crate::transaction::Transaction) {
        let peers = self.peers.lock().unwrap();
        info!("broadcasting tx to {} peer(s)", peers.len());
        for (addr, handle) in peers.iter() {
            if handle.command_tx.send(PeerCommand::SendTx(tx.clone())).is_err() {
                warn!("session for {} already gone, skipping broadcast", addr);
            }
        }
    }

    pub fn load_bloom_filter(&self, filter: FilterLoadMessage) {
        for handle in self.peers.lock().unwrap().values() {
            let _ = handle.command_tx.send(PeerCommand::LoadFilter(filter.clone()));
        }
    }

    pub fn send_ping(&self, addr: &SocketAddr, callback: PingCallback) {
        let peers = self.peers.lock().unwrap();
        match peers.get(addr) {
            Some(handle) => {
                if handle.command_tx.send(PeerCommand::SendPing { callback }).is_err() {
                    warn!("session for {} already gone, ping dropped", addr);
                }
            }
            None => callback(false),
        }
    }

    pub fn request_blocks(&self, locators: Vec<[u8; 32]>, hash_stop: [u8; 32]) {
        for handle in self.peers.lock().unwrap().values() {
            let _ = handle.command_tx.send(PeerCommand::SendGetBlocks {
                locators: locators.clone(),
                hash_stop,
            });
        }
    }

    pub fn disconnect_all(&self) {
        for handle in self.peers.lock().unwrap().values() {
            let _ = handle.command_tx.send(PeerCommand::Disconnect);
        }
    }
}

/// Connect to the configured seed peers and keep the pool topped up,
/// reconnecting whenever the count drops too low.
pub async fn maintain_connections(
    manager: Arc<PeerManager>,
    listener: Arc<dyn PeerListener>,
    seeds: Vec<String>,
) {
    connect_round(&manager, &listener, &seeds).await;
    info!("initial connection attempts done, {} peer(s) connected", manager.get_peer_count());

    loop {
        time::sleep(Duration::from_secs(RECONNECT_CHECK_SECONDS)).await;
        let count = manager.get_peer_count();
        debug!("pool check: {} active peer(s)", count);
        if count < MIN_CONNECTED_PEERS {
            if !listener.network_is_reachable() {
                warn!("low peer count ({}) but network unreachable, waiting", count);
                continue;
            }
            warn!("low peer count ({}), reconnecting to seeds", count);
            connect_round(&manager, &listener, &seeds).await;
        }
    }
}

async fn connect_round(manager: &Arc<PeerManager>, listener: &Arc<dyn PeerListener>, seeds: &[String]) {
    let mut tasks = Vec::new();
    for seed in seeds {
        let addr: SocketAddr = match seed.parse() {
            Ok(a) => a,
            Err(e) => {
                error!("unparseable seed address {}: {}", seed, e);
                continue;
            }
        };
        if manager.peers.lock().unwrap().contains_key(&addr) {
            continue;
        }
        let manager = Arc::clone(manager);
        let listener = Arc::clone(listener);
        tasks.push(tokio::spawn(async move {
            let start_height = manager.local_height() as u32;
            match connect_and_handshake(addr, manager.magic, manager.services, start_height, &manager.user_agent).await {
                Ok((peer_version, stream)) => {
                    let mut peer = Peer::new(addr, manager.earliest_key_time, manager.local_height());
                    peer.set_version_data(&peer_version);
                    peer.sent_verack = true;
                    peer.got_verack = true;

                    let (command_tx, command_rx) = mpsc::unbounded_channel();
                    manager.peers.lock().unwrap().insert(
                        addr,
                        PeerHandle {
                            command_tx,
                            user_agent: peer_version.user_agent.clone(),
                            start_height: peer_version.start_height,
                        },
                    );
                    tokio::spawn(handle_peer_session(peer, stream, command_rx, listener, manager));
                }
                Err(e) => {
                    warn!("connection to seed {} failed: {}", addr, e);
                }
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Drive one connection: this task is the sole owner of the peer's mutable
/// state, so handshake latches, dedup sets, and the ping queue never need a
/// lock. Cross-task requests arrive on the command channel.
pub async fn handle_peer_session(
    mut peer: Peer,
    mut stream: TcpStream,
    mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
    listener: Arc<dyn PeerListener>,
    manager: Arc<PeerManager>,
) {
    let peer_addr = peer.address;
    let magic = manager.magic;
    peer.status = ConnectStatus::Connected;
    listener.on_connected(peer_addr);
    info!("[{}] session started (agent \"{}\", height {})", peer.host(), peer.user_agent, peer.last_block_height);

    let mut session_error: Option<PeerError> = None;
    if !peer.is_ready() {
        session_error = Some(PeerError::Handshake("verack exchange incomplete".to_string()));
    }

    // One-shot solicitations, latched so they go out at most once per
    // connection lifetime.
    if session_error.is_none() {
        if send_empty_payload_message(&mut stream, magic, *CMD_GETADDR).await.is_ok() {
            peer.sent_getaddr = true;
        } else {
            session_error = Some(PeerError::Handshake("failed to send getaddr".to_string()));
        }
    }
    if session_error.is_none() {
        if send_empty_payload_message(&mut stream, magic, *CMD_MEMPOOL).await.is_ok() {
            peer.sent_mempool = true;
        } else {
            // mempool solicitation failure is not fatal to the session
            warn!("[{}] failed to send mempool request", peer.host());
        }
    }

    if session_error.is_none() {
        let mut ping_interval = time::interval(Duration::from_secs(PING_INTERVAL_SECONDS));
        peer.disconnect_deadline = Some(Instant::now() + Duration::from_secs(SESSION_DEADLINE_SECONDS));

        session_error = loop {
            let deadline = peer.disconnect_deadline;
            tokio::select! {
                biased;
                read_result = read_network_message(&mut stream, magic) => {
                    match read_result {
                        Ok((header, payload)) => {
                            // traffic proves liveness, push the deadline out
                            peer.disconnect_deadline =
                                Some(Instant::now() + Duration::from_secs(SESSION_DEADLINE_SECONDS));
                            match dispatch_message(&mut peer, &mut stream, magic, &header, &payload, listener.as_ref()).await {
                                Ok(()) => {}
                                Err(e) if e.is_fatal() => break Some(e),
                                Err(e) => warn!("[{}] dropped frame: {}", peer.host(), e),
                            }
                        }
                        Err(e) => {
                            if e.kind() == IoErrorKind::UnexpectedEof || e.kind() == IoErrorKind::ConnectionReset {
                                info!("[{}] connection closed by peer", peer.host());
                                break None;
                            }
                            break Some(PeerError::Io(e));
                        }
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::SendTx(tx)) => {
                            // announce via inv; the peer pulls the payload
                            // with getdata, answered from the session itself
                            let hash = peer.note_published_tx(tx);
                            let inv = InventoryMessage {
                                inventory: vec![InventoryVector { inv_type: InventoryType::Tx, hash }],
                            };
                            if let Err(e) = send_payload_message(&mut stream, magic, *CMD_INV, &inv).await {
                                break Some(PeerError::Io(e));
                            }
                            debug!("[{}] announced tx {}", peer.host(), hex::encode(hash));
                        }
                        Some(PeerCommand::LoadFilter(filter)) => {
                            if peer.sent_filter {
                                debug!("[{}] replacing bloom filter", peer.host());
                            }
                            if let Err(e) = send_payload_message(&mut stream, magic, *CMD_FILTERLOAD, &filter).await {
                                break Some(PeerError::Io(e));
                            }
                            peer.sent_filter = true;
                            // retry the mempool request if the session-start
                            // one never went out
                            if !peer.sent_mempool {
                                if send_empty_payload_message(&mut stream, magic, *CMD_MEMPOOL).await.is_ok() {
                                    peer.sent_mempool = true;
                                }
                            }
                        }
                        Some(PeerCommand::SendPing { callback }) => {
                            peer.register_ping(callback, Some(Instant::now()));
                            let ping = PingMessage::new(peer.local_height);
                            if let Err(e) = send_payload_message(&mut stream, magic, *CMD_PING, &ping).await {
                                break Some(PeerError::Io(e));
                            }
                        }
                        Some(PeerCommand::SendGetBlocks { locators, hash_stop }) => {
                            let msg = GetBlocksMessage {
                                version: PROTOCOL_VERSION,
                                block_locator_hashes: locators,
                                hash_stop,
                            };
                            if let Err(e) = send_payload_message(&mut stream, magic, *CMD_GETBLOCKS, &msg).await {
                                break Some(PeerError::Io(e));
                            }
                            let request = if peer.sent_getblocks { "follow-up" } else { "first" };
                            debug!("[{}] sent {} getblocks request", peer.host(), request);
                            peer.sent_getblocks = true;
                        }
                        Some(PeerCommand::Disconnect) | None => break None,
                    }
                }
                _ = ping_interval.tick() => {
                    peer.register_ping(Box::new(|_| {}), Some(Instant::now()));
                    let ping = PingMessage::new(peer.local_height);
                    if let Err(e) = send_payload_message(&mut stream, magic, *CMD_PING, &ping).await {
                        break Some(PeerError::Io(e));
                    }
                    debug!("[{}] sent keepalive ping", peer.host());
                }
                _ = deadline_wait(deadline) => {
                    warn!("[{}] no traffic before deadline, force closing", peer.host());
                    break Some(PeerError::DeadlineReached);
                }
            }
        };
    }

    let _ = stream.shutdown().await;
    match &session_error {
        Some(e) => warn!("[{}] session ended: {}", peer.host(), e),
        None => info!("[{}] session ended", peer.host()),
    }
    peer.disconnect(listener.as_ref(), session_error);
    manager.remove_peer(&peer_addr);
    listener.on_thread_cleanup(peer_addr);
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(d) => time::sleep_until(time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

/// Resolve a frame to its handler. Unknown commands are logged and dropped,
/// never punished, so protocol extensions stay harmless.
async fn dispatch_message(
    peer: &mut Peer,
    stream: &mut TcpStream,
    magic: [u8; 4],
    header: &MessageHeader,
    payload: &[u8],
    listener: &dyn PeerListener,
) -> Result<(), PeerError> {
    let command = &header.command;
    if command == CMD_ADDR {
        peer.accept_addr(payload, listener)
    } else if command == CMD_INV {
        if let Some(getdata) = peer.accept_inv(payload, listener)? {
            send_payload_message(stream, magic, *CMD_GETDATA, &getdata).await?;
        }
        Ok(())
    } else if command == CMD_TX {
        peer.accept_tx(payload, listener)
    } else if command == CMD_MERKLEBLOCK {
        peer.accept_merkleblock(payload, listener)
    } else if command == CMD_HEADERS {
        peer.accept_headers(payload, listener)
    } else if command == CMD_GETDATA {
        let (replies, notfound) = peer.accept_getdata(payload, listener)?;
        for tx in replies {
            send_payload_message(stream, magic, *CMD_TX, &tx).await?;
        }
        if let Some(missing) = notfound {
            send_payload_message(stream, magic, *CMD_NOTFOUND, &missing).await?;
        }
        Ok(())
    } else if command == CMD_NOTFOUND {
        peer.accept_notfound(payload, listener)
    } else if command == CMD_PING {
        let pong = peer.accept_ping(payload, listener)?;
        send_payload_message(stream, magic, *CMD_PONG, &pong).await?;
        Ok(())
    } else if command == CMD_PONG {
        peer.accept_pong(payload)
    } else if command == CMD_REJECT {
        peer.accept_reject(payload, listener)
    } else if command == CMD_FEEFILTER {
        peer.accept_feefilter(payload, listener)
    } else if command == CMD_GETADDR {
        // we relay no third-party addresses yet, answer with an empty batch
        send_payload_message(stream, magic, *CMD_ADDR, &AddrMessage { addresses: Vec::new() }).await?;
        Ok(())
    } else if command == CMD_VERACK {
        if peer.got_verack {
            debug!("[{}] redundant verack ignored", peer.host());
        } else {
            peer.got_verack = true;
        }
        Ok(())
    } else {
        debug!(
            "[{}] unhandled command \"{}\"",
            peer.host(),
            crate::p2p::messages::command_string(command)
        );
        Ok(())
    }
}
