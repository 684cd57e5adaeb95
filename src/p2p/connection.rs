// src/p2p/connection.rs
// Socket framing and the version/verack handshake.

use crate::p2p::messages::{
    Decodable, Encodable, MessageHeader, VersionMessage, CMD_VERACK, CMD_VERSION,
    MIN_PEER_PROTO_VERSION, NODE_NETWORK,
};
use log::{debug, info, warn};
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PAYLOAD_BYTES: u32 = 2 * 1024 * 1024;

pub fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
    let hash = crate::p2p::messages::sha256d(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash[0..4]);
    checksum
}

pub async fn send_message(stream: &mut TcpStream, header: MessageHeader, payload: &[u8]) -> Result<(), IoError> {
    let mut header_bytes = Vec::new();
    header.consensus_encode(&mut Cursor::new(&mut header_bytes))?;
    stream.write_all(&header_bytes).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    Ok(())
}

/// Frame and send any encodable payload under the given command.
pub async fn send_payload_message<T: Encodable>(
    stream: &mut TcpStream,
    magic: [u8; 4],
    command: [u8; 12],
    payload: &T,
) -> Result<(), IoError> {
    let mut payload_bytes = Vec::new();
    payload.consensus_encode(&mut Cursor::new(&mut payload_bytes))?;
    let checksum = calculate_checksum(&payload_bytes);
    let header = MessageHeader::new(magic, command, payload_bytes.len() as u32, checksum);
    send_message(stream, header, &payload_bytes).await
}

pub async fn send_empty_payload_message(
    stream: &mut TcpStream,
    magic: [u8; 4],
    command: [u8; 12],
) -> Result<(), IoError> {
    let checksum = calculate_checksum(&[]);
    let header = MessageHeader::new(magic, command, 0, checksum);
    send_message(stream, header, &[]).await
}

/// Read one frame. Magic, length bound, and checksum are all enforced here
/// so handlers only ever see structurally framed payloads.
pub async fn read_network_message(
    stream: &mut TcpStream,
    magic: [u8; 4],
) -> Result<(MessageHeader, Vec<u8>), IoError> {
    let mut header_buf = [0u8; MessageHeader::SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = MessageHeader::consensus_decode(&mut Cursor::new(&header_buf))?;

    if header.magic != magic {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("invalid magic bytes: {:?}, expected {:?}", header.magic, magic),
        ));
    }
    if header.length > MAX_PAYLOAD_BYTES {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("payload length {} exceeds {} byte limit", header.length, MAX_PAYLOAD_BYTES),
        ));
    }

    let mut payload_buf = vec![0u8; header.length as usize];
    if header.length > 0 {
        stream.read_exact(&mut payload_buf).await?;
    }
    if calculate_checksum(&payload_buf) != header.checksum {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!("checksum mismatch on '{}' frame", crate::p2p::messages::command_string(&header.command)),
        ));
    }
    debug!("received '{}' frame, {} payload byte(s)",
        crate::p2p::messages::command_string(&header.command), payload_buf.len());
    Ok((header, payload_buf))
}

/// Open a socket and run the version/verack exchange. Handshake-phase
/// breaches are fatal: wrong services, stale protocol, self-connection, or
/// any unexpected command ends the attempt.
pub async fn connect_and_handshake(
    peer_addr: SocketAddr,
    magic: [u8; 4],
    our_services: u64,
    our_start_height: u32,
    user_agent: &str,
) -> Result<(VersionMessage, TcpStream), IoError> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer_addr))
        .await
        .map_err(|_| IoError::new(IoErrorKind::TimedOut, format!("connect to {} timed out", peer_addr)))??;
    info!("connected to {}, starting handshake", peer_addr);

    let our_nonce: u64 = rand::random();
    let version_msg = VersionMessage::for_peer(
        peer_addr.ip(),
        peer_addr.port(),
        our_services,
        our_nonce,
        user_agent.to_string(),
        our_start_height,
    );
    send_payload_message(&mut stream, magic, *CMD_VERSION, &version_msg).await?;

    let (peer_version_header, peer_version_payload) = read_network_message(&mut stream, magic).await?;
    if &peer_version_header.command != CMD_VERSION {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!(
                "expected version, got '{}'",
                crate::p2p::messages::command_string(&peer_version_header.command)
            ),
        ));
    }
    let peer_version = VersionMessage::consensus_decode(&mut Cursor::new(&peer_version_payload))?;
    info!(
        "version from {}: v={}, services={}, agent=\"{}\", height={}",
        peer_addr, peer_version.version, peer_version.services, peer_version.user_agent, peer_version.start_height
    );

    if peer_version.nonce == our_nonce {
        return Err(IoError::new(IoErrorKind::Other, "connected to self (same nonce)"));
    }
    if peer_version.version < MIN_PEER_PROTO_VERSION {
        warn!("peer {} protocol {} below minimum {}", peer_addr, peer_version.version, MIN_PEER_PROTO_VERSION);
        return Err(IoError::new(IoErrorKind::Other, "peer protocol version too old"));
    }
    if peer_version.services & NODE_NETWORK == 0 {
        return Err(IoError::new(IoErrorKind::Other, "peer does not serve full blocks"));
    }

    send_empty_payload_message(&mut stream, magic, *CMD_VERACK).await?;

    let (verack_header, _) = read_network_message(&mut stream, magic).await?;
    if &verack_header.command != CMD_VERACK {
        return Err(IoError::new(
            IoErrorKind::InvalidData,
            format!(
                "expected verack, got '{}'",
                crate::p2p::messages::command_string(&verack_header.command)
            ),
        ));
    }
    if verack_header.length != 0 {
        return Err(IoError::new(IoErrorKind::InvalidData, "verack with non-empty payload"));
    }
    info!("handshake with {} complete", peer_addr);
    Ok((peer_version, stream))
}
