// src/p2p/messages.rs
// Wire codec and message catalog for the ELA P2P protocol. Every frame is
// magic + 12-byte command + length + sha256d checksum; payload fields are
// little-endian unless noted.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind, Read, Write};

pub const MAINNET_MAGIC: [u8; 4] = [0x0d, 0x72, 0x6d, 0x21];
pub const TESTNET_MAGIC: [u8; 4] = [0x0d, 0x72, 0x74, 0x21];
pub const PROTOCOL_VERSION: u32 = 70013;
pub const MIN_PEER_PROTO_VERSION: u32 = 70013;
pub const NODE_NETWORK: u64 = 1;

pub const CMD_VERSION: &[u8; 12] = b"version\0\0\0\0\0";
pub const CMD_VERACK: &[u8; 12] = b"verack\0\0\0\0\0\0";
pub const CMD_ADDR: &[u8; 12] = b"addr\0\0\0\0\0\0\0\0";
pub const CMD_INV: &[u8; 12] = b"inv\0\0\0\0\0\0\0\0\0";
pub const CMD_GETDATA: &[u8; 12] = b"getdata\0\0\0\0\0";
pub const CMD_NOTFOUND: &[u8; 12] = b"notfound\0\0\0\0";
pub const CMD_GETBLOCKS: &[u8; 12] = b"getblocks\0\0\0";
pub const CMD_TX: &[u8; 12] = b"tx\0\0\0\0\0\0\0\0\0\0";
pub const CMD_HEADERS: &[u8; 12] = b"headers\0\0\0\0\0";
pub const CMD_GETADDR: &[u8; 12] = b"getaddr\0\0\0\0\0";
pub const CMD_MEMPOOL: &[u8; 12] = b"mempool\0\0\0\0\0";
pub const CMD_PING: &[u8; 12] = b"ping\0\0\0\0\0\0\0\0";
pub const CMD_PONG: &[u8; 12] = b"pong\0\0\0\0\0\0\0\0";
pub const CMD_FILTERLOAD: &[u8; 12] = b"filterload\0\0";
pub const CMD_FILTERADD: &[u8; 12] = b"filteradd\0\0\0";
pub const CMD_FILTERCLEAR: &[u8; 12] = b"filterclear\0";
pub const CMD_MERKLEBLOCK: &[u8; 12] = b"merkleblock\0";
pub const CMD_REJECT: &[u8; 12] = b"reject\0\0\0\0\0\0";
pub const CMD_FEEFILTER: &[u8; 12] = b"feefilter\0\0\0";

pub const MAX_ADDRESSES_PER_MSG: u64 = 1000;
pub const ADDR_ENTRY_SIZE: usize = 30;
pub const MAX_INV_PER_MSG: u64 = 50_000;
pub const MAX_LOCATORS_PER_MSG: u64 = 2000;
pub const MAX_HEADERS_PER_MSG: usize = 2000;

pub fn command_string(command: &[u8; 12]) -> String {
    String::from_utf8_lossy(command).trim_end_matches('\0').to_string()
}

pub fn sha256d(payload: &[u8]) -> [u8; 32] {
    let h1 = Sha256::digest(payload);
    let h2 = Sha256::digest(h1);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h2);
    out
}

pub trait Encodable{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>;}
pub trait Decodable:Sized{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>;}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct MessageHeader{pub magic:[u8;4],pub command:[u8;12],pub length:u32,pub checksum:[u8;4]}
impl MessageHeader{pub const SIZE:usize=24;pub fn new(magic:[u8;4],cmd:[u8;12],len:u32,chk:[u8;4])->Self{Self{magic,command:cmd,length:len,checksum:chk}}}
impl Encodable for MessageHeader{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_all(&self.magic)?;w.write_all(&self.command)?;w.write_u32::<LittleEndian>(self.length)?;w.write_all(&self.checksum)?;Ok(Self::SIZE)}}
impl Decodable for MessageHeader{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let mut mgc=[0u8;4];r.read_exact(&mut mgc)?;let mut cmd=[0u8;12];r.read_exact(&mut cmd)?;let len=r.read_u32::<LittleEndian>()?;let mut chk=[0u8;4];r.read_exact(&mut chk)?;Ok(Self{magic:mgc,command:cmd,length:len,checksum:chk})}}

pub fn write_var_int<W:Write+WriteBytesExt>(w:&mut W,n:u64)->Result<usize,IoError>{if n<0xfd{w.write_u8(n as u8)?;Ok(1)}else if n<=0xffff{w.write_u8(0xfd)?;w.write_u16::<LittleEndian>(n as u16)?;Ok(3)}else if n<=0xffffffff{w.write_u8(0xfe)?;w.write_u32::<LittleEndian>(n as u32)?;Ok(5)}else{w.write_u8(0xff)?;w.write_u64::<LittleEndian>(n)?;Ok(9)}}
pub fn read_var_int<R:Read+ReadBytesExt>(r:&mut R)->Result<u64,IoError>{match r.read_u8()?{0xff=>r.read_u64::<LittleEndian>(),0xfe=>r.read_u32::<LittleEndian>().map(|x|x as u64),0xfd=>r.read_u16::<LittleEndian>().map(|x|x as u64),n=>Ok(n as u64)}}
pub fn write_var_bytes<W:Write+WriteBytesExt>(w:&mut W,b:&[u8])->Result<usize,IoError>{let mut l=write_var_int(w,b.len()as u64)?;w.write_all(b)?;l+=b.len();Ok(l)}
pub fn read_var_bytes<R:Read+ReadBytesExt>(r:&mut R)->Result<Vec<u8>,IoError>{let l=read_var_int(r)?;if l>2*1024*1024{Err(IoError::new(IoErrorKind::InvalidData,"VarBytes too long"))}else{let mut buf=vec![0;l as usize];if l>0{r.read_exact(&mut buf)?;}Ok(buf)}}
pub fn write_var_string<W:Write+WriteBytesExt>(w:&mut W,s:&str)->Result<usize,IoError>{write_var_bytes(w, s.as_bytes())}
pub fn read_var_string<R:Read+ReadBytesExt>(r:&mut R)->Result<String,IoError>{let bytes=read_var_bytes(r)?;String::from_utf8(bytes).map_err(|_|IoError::new(IoErrorKind::InvalidData,"Invalid UTF-8 in VarString"))}

/// A discovered peer. Identity is (address, port); the address is always
/// stored IPv6-mapped even when the peer is IPv4.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub address: [u8; 16],
    pub port: u16,
    pub timestamp: u64,
    pub services: u64,
    pub flags: u8,
}

impl PeerInfo {
    pub fn new(address: [u8; 16], port: u16, timestamp: u64, services: u64) -> Self {
        PeerInfo { address, port, timestamp, services, flags: 0 }
    }

    pub fn from_socket_addr(addr: std::net::SocketAddr, timestamp: u64, services: u64) -> Self {
        let bytes = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            std::net::IpAddr::V6(v6) => v6.octets(),
        };
        PeerInfo::new(bytes, addr.port(), timestamp, services)
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        self.address[0..10] == [0u8; 10] && self.address[10] == 0xff && self.address[11] == 0xff
    }

    pub fn host(&self) -> String {
        if self.is_ipv4_mapped() {
            format!("{}.{}.{}.{}", self.address[12], self.address[13], self.address[14], self.address[15])
        } else {
            std::net::Ipv6Addr::from(self.address).to_string()
        }
    }
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct NetAddr{pub services:u64,pub ip:[u8;16],pub port:u16}
impl NetAddr{pub fn new(ip:std::net::IpAddr,p:u16,s:u64)->Self{let ipb=match ip{std::net::IpAddr::V4(v4)=>v4.to_ipv6_mapped().octets(),std::net::IpAddr::V6(v6)=>v6.octets()};Self{services:s,ip:ipb,port:p}}}
impl Encodable for NetAddr{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u64::<LittleEndian>(self.services)?;w.write_all(&self.ip)?;w.write_u16::<BigEndian>(self.port)?;Ok(26)}}
impl Decodable for NetAddr{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let s=r.read_u64::<LittleEndian>()?;let mut ip=[0u8;16];r.read_exact(&mut ip)?;let p=r.read_u16::<BigEndian>()?;Ok(Self{services:s,ip,port:p})}}

#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
}
impl Encodable for VersionMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{let mut wr=0;w.write_u32::<LittleEndian>(self.version)?;wr+=4;w.write_u64::<LittleEndian>(self.services)?;wr+=8;w.write_i64::<LittleEndian>(self.timestamp)?;wr+=8;wr+=self.addr_recv.consensus_encode(w)?;wr+=self.addr_from.consensus_encode(w)?;w.write_u64::<LittleEndian>(self.nonce)?;wr+=8;wr+=write_var_string(w,&self.user_agent)?;w.write_u32::<LittleEndian>(self.start_height)?;wr+=4;Ok(wr)}}
impl Decodable for VersionMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{version:r.read_u32::<LittleEndian>()?,services:r.read_u64::<LittleEndian>()?,timestamp:r.read_i64::<LittleEndian>()?,addr_recv:NetAddr::consensus_decode(r)?,addr_from:NetAddr::consensus_decode(r)?,nonce:r.read_u64::<LittleEndian>()?,user_agent:read_var_string(r)?,start_height:r.read_u32::<LittleEndian>()?})}}
impl VersionMessage {
    pub fn for_peer(peer_ip: std::net::IpAddr, peer_port: u16, services: u64, nonce: u64, user_agent: String, start_height: u32) -> Self {
        let local = std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0));
        VersionMessage {
            version: PROTOCOL_VERSION,
            services,
            timestamp: chrono::Utc::now().timestamp(),
            addr_recv: NetAddr::new(peer_ip, peer_port, NODE_NETWORK),
            addr_from: NetAddr::new(local, 0, services),
            nonce,
            user_agent,
            start_height,
        }
    }
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct PingMessage{pub height:u64}
impl PingMessage{pub fn new(h:u64)->Self{Self{height:h}}}
impl Encodable for PingMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u64::<LittleEndian>(self.height)?;Ok(8)}}
impl Decodable for PingMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{height:r.read_u64::<LittleEndian>()?})}}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct PongMessage{pub height:u64}
impl PongMessage{pub fn new(h:u64)->Self{Self{height:h}}}
impl Encodable for PongMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u64::<LittleEndian>(self.height)?;Ok(8)}}
impl Decodable for PongMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{height:r.read_u64::<LittleEndian>()?})}}

/// addr payload: u64 LE count followed by 30-byte entries
/// (timestamp u32, services u64, address 16, port u16).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrMessage {
    pub addresses: Vec<PeerInfo>,
}
impl Encodable for AddrMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = 8;
        w.write_u64::<LittleEndian>(self.addresses.len() as u64)?;
        for p in &self.addresses {
            w.write_u32::<LittleEndian>(p.timestamp as u32)?;
            w.write_u64::<LittleEndian>(p.services)?;
            w.write_all(&p.address)?;
            w.write_u16::<LittleEndian>(p.port)?;
            written += ADDR_ENTRY_SIZE;
        }
        Ok(written)
    }
}
impl AddrMessage {
    /// Structural decode with the declared-length check up front: the payload
    /// must hold `8 + 30*count` bytes or the whole frame is malformed.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, IoError> {
        if payload.len() < 8 {
            return Err(IoError::new(IoErrorKind::InvalidData, "addr message shorter than its count field"));
        }
        let mut r = Cursor::new(payload);
        let count = r.read_u64::<LittleEndian>()?;
        if count > MAX_ADDRESSES_PER_MSG {
            return Err(IoError::new(IoErrorKind::InvalidData,
                format!("addr message has {} addresses, max is {}", count, MAX_ADDRESSES_PER_MSG)));
        }
        if (payload.len() as u64) < 8 + count * ADDR_ENTRY_SIZE as u64 {
            return Err(IoError::new(IoErrorKind::InvalidData,
                format!("malformed addr message, length is {}, should be {} for {} address(es)",
                    payload.len(), 8 + count * ADDR_ENTRY_SIZE as u64, count)));
        }
        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let timestamp = r.read_u32::<LittleEndian>()? as u64;
            let services = r.read_u64::<LittleEndian>()?;
            let mut address = [0u8; 16];
            r.read_exact(&mut address)?;
            let port = r.read_u16::<LittleEndian>()?;
            addresses.push(PeerInfo::new(address, port, timestamp, services));
        }
        Ok(AddrMessage { addresses })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InventoryType { Error = 0, Tx = 1, Block = 2, FilteredBlock = 3 }
impl InventoryType { pub fn from_u32(val: u32) -> Option<Self> { match val { 0=>Some(Self::Error),1=>Some(Self::Tx),2=>Some(Self::Block),3=>Some(Self::FilteredBlock),_=>None } } }

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct InventoryVector{pub inv_type:InventoryType,pub hash:[u8;32]}
impl Encodable for InventoryVector{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u32::<LittleEndian>(self.inv_type as u32)?;w.write_all(&self.hash)?;Ok(36)}}
impl Decodable for InventoryVector{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let tv=r.read_u32::<LittleEndian>()?;let it=InventoryType::from_u32(tv).ok_or_else(||IoError::new(IoErrorKind::InvalidData,format!("Unk inv type: {}",tv)))?;let mut h=[0u8;32];r.read_exact(&mut h)?;Ok(Self{inv_type:it,hash:h})}}

/// Shared payload shape for inv, getdata and notfound.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct InventoryMessage{pub inventory:Vec<InventoryVector>}
impl Encodable for InventoryMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{let mut wr=write_var_int(w,self.inventory.len()as u64)?;for i in &self.inventory{wr+=i.consensus_encode(w)?;}Ok(wr)}}
impl Decodable for InventoryMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let c=read_var_int(r)?;if c>MAX_INV_PER_MSG{return Err(IoError::new(IoErrorKind::InvalidData,"inventory count too large"));}let mut inv=Vec::with_capacity(c as usize);for _ in 0..c{inv.push(InventoryVector::consensus_decode(r)?);}Ok(Self{inventory:inv})}}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct GetBlocksMessage{pub version:u32,pub block_locator_hashes:Vec<[u8;32]>,pub hash_stop:[u8;32]}
impl Encodable for GetBlocksMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{let mut wr=0;w.write_u32::<LittleEndian>(self.version)?;wr+=4;wr+=write_var_int(w,self.block_locator_hashes.len()as u64)?;for h in &self.block_locator_hashes{w.write_all(h)?;wr+=32;}w.write_all(&self.hash_stop)?;wr+=32;Ok(wr)}}
impl Decodable for GetBlocksMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let v=r.read_u32::<LittleEndian>()?;let c=read_var_int(r)?;if c>MAX_LOCATORS_PER_MSG{return Err(IoError::new(IoErrorKind::InvalidData,"GetBlocks locator count too large"));}let mut blh=Vec::with_capacity(c as usize);for _ in 0..c{let mut h=[0u8;32];r.read_exact(&mut h)?;blh.push(h);}let mut hs=[0u8;32];r.read_exact(&mut hs)?;Ok(Self{version:v,block_locator_hashes:blh,hash_stop:hs})}}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct BlockHeaderData{pub version:u32,pub prev_block_hash:[u8;32],pub merkle_root:[u8;32],pub timestamp:u32,pub bits:u32,pub nonce:u32,pub height:u32}
impl BlockHeaderData{pub fn get_hash(&self)->[u8;32]{let mut buf=Vec::with_capacity(84);let c=&mut Cursor::new(&mut buf);let _=self.consensus_encode(c);sha256d(&buf)}}
impl Encodable for BlockHeaderData{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u32::<LittleEndian>(self.version)?;w.write_all(&self.prev_block_hash)?;w.write_all(&self.merkle_root)?;w.write_u32::<LittleEndian>(self.timestamp)?;w.write_u32::<LittleEndian>(self.bits)?;w.write_u32::<LittleEndian>(self.nonce)?;w.write_u32::<LittleEndian>(self.height)?;Ok(84)}}
impl Decodable for BlockHeaderData{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let v=r.read_u32::<LittleEndian>()?;let mut pbh=[0u8;32];r.read_exact(&mut pbh)?;let mut mr=[0u8;32];r.read_exact(&mut mr)?;let t=r.read_u32::<LittleEndian>()?;let b=r.read_u32::<LittleEndian>()?;let n=r.read_u32::<LittleEndian>()?;let hgt=r.read_u32::<LittleEndian>()?;Ok(Self{version:v,prev_block_hash:pbh,merkle_root:mr,timestamp:t,bits:b,nonce:n,height:hgt})}}

/// headers payload reuses the header codec, each entry trailed by a zero
/// var-int txn count.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct HeadersMessage{pub headers:Vec<BlockHeaderData>}
impl Encodable for HeadersMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{let mut wr=0;wr+=write_var_int(w,self.headers.len()as u64)?;for h in &self.headers{wr+=h.consensus_encode(w)?;wr+=write_var_int(w,0)?;}Ok(wr)}}
impl Decodable for HeadersMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let c=read_var_int(r)?;if c>MAX_HEADERS_PER_MSG as u64{return Err(IoError::new(IoErrorKind::InvalidData,format!("headers count {} > max {}",c,MAX_HEADERS_PER_MSG)));}let mut hds=Vec::with_capacity(c as usize);for _ in 0..c{hds.push(BlockHeaderData::consensus_decode(r)?);if read_var_int(r)?!=0{return Err(IoError::new(IoErrorKind::InvalidData,"headers item non-zero txn count"));}}Ok(Self{headers:hds})}}

/// A block header plus a partial merkle proof for the filtered transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeaderData,
    pub total_tx: u32,
    pub hashes: Vec<[u8; 32]>,
    pub flags: Vec<u8>,
}

impl MerkleBlockMessage {
    pub fn from_header(header: BlockHeaderData) -> Self {
        MerkleBlockMessage { header, total_tx: 0, hashes: Vec::new(), flags: Vec::new() }
    }

    pub fn block_hash(&self) -> [u8; 32] {
        self.header.get_hash()
    }

    /// Transactions the remote matched against our filter, extracted by
    /// walking the partial merkle tree depth-first. Proof validity against
    /// the merkle root is the caller's concern.
    pub fn matched_tx_hashes(&self) -> Vec<[u8; 32]> {
        let mut matched = Vec::new();
        if self.total_tx == 0 {
            return matched;
        }
        let mut height = 0u32;
        while self.width_at(height) > 1 {
            height += 1;
        }
        let mut bit_idx = 0usize;
        let mut hash_idx = 0usize;
        self.walk(height, 0, &mut bit_idx, &mut hash_idx, &mut matched);
        matched
    }

    // u64 arithmetic: total_tx is remote-controlled and may sit at u32::MAX
    fn width_at(&self, height: u32) -> u32 {
        (((self.total_tx as u64) + (1u64 << height) - 1) >> height) as u32
    }

    fn walk(&self, height: u32, pos: u32, bit_idx: &mut usize, hash_idx: &mut usize, matched: &mut Vec<[u8; 32]>) {
        if *bit_idx >= self.flags.len() * 8 {
            return;
        }
        let flag = (self.flags[*bit_idx / 8] >> (*bit_idx % 8)) & 1 == 1;
        *bit_idx += 1;
        if height == 0 || !flag {
            if *hash_idx < self.hashes.len() {
                if height == 0 && flag {
                    matched.push(self.hashes[*hash_idx]);
                }
                *hash_idx += 1;
            }
        } else {
            self.walk(height - 1, pos * 2, bit_idx, hash_idx, matched);
            if pos * 2 + 1 < self.width_at(height - 1) {
                self.walk(height - 1, pos * 2 + 1, bit_idx, hash_idx, matched);
            }
        }
    }
}

impl Encodable for MerkleBlockMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = self.header.consensus_encode(w)?;
        w.write_u32::<LittleEndian>(self.total_tx)?;
        written += 4;
        written += write_var_int(w, self.hashes.len() as u64)?;
        for h in &self.hashes {
            w.write_all(h)?;
            written += 32;
        }
        written += write_var_bytes(w, &self.flags)?;
        Ok(written)
    }
}
impl Decodable for MerkleBlockMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let header = BlockHeaderData::consensus_decode(r)?;
        let total_tx = r.read_u32::<LittleEndian>()?;
        let count = read_var_int(r)?;
        if count > total_tx as u64 {
            return Err(IoError::new(IoErrorKind::InvalidData, "merkleblock hash count exceeds total tx count"));
        }
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut h = [0u8; 32];
            r.read_exact(&mut h)?;
            hashes.push(h);
        }
        let flags = read_var_bytes(r)?;
        Ok(MerkleBlockMessage { header, total_tx, hashes, flags })
    }
}

/// BIP37-style bloom filter load for the SPV tx subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}
impl Encodable for FilterLoadMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{let mut wr=write_var_bytes(w,&self.filter)?;w.write_u32::<LittleEndian>(self.hash_funcs)?;wr+=4;w.write_u32::<LittleEndian>(self.tweak)?;wr+=4;w.write_u8(self.flags)?;wr+=1;Ok(wr)}}
impl Decodable for FilterLoadMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{filter:read_var_bytes(r)?,hash_funcs:r.read_u32::<LittleEndian>()?,tweak:r.read_u32::<LittleEndian>()?,flags:r.read_u8()?})}}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct FilterAddMessage{pub data:Vec<u8>}
impl Encodable for FilterAddMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{write_var_bytes(w,&self.data)}}
impl Decodable for FilterAddMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{data:read_var_bytes(r)?})}}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message_cmd: String,
    pub code: u8,
    pub reason: String,
    pub data_hash: [u8; 32],
}
impl Encodable for RejectMessage {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = 0;
        written += write_var_string(w, &self.message_cmd)?;
        w.write_u8(self.code)?;
        written += 1;
        written += write_var_string(w, &self.reason)?;
        w.write_all(&self.data_hash)?;
        written += 32;
        Ok(written)
    }
}
impl Decodable for RejectMessage {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let message_cmd = read_var_string(r)?;
        let code = r.read_u8()?;
        let reason = read_var_string(r)?;
        let mut data_hash = [0u8; 32];
        r.read_exact(&mut data_hash)?;
        Ok(RejectMessage { message_cmd, code, reason, data_hash })
    }
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub struct FeeFilterMessage{pub fee_per_kb:u64}
impl Encodable for FeeFilterMessage{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u64::<LittleEndian>(self.fee_per_kb)?;Ok(8)}}
impl Decodable for FeeFilterMessage{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{fee_per_kb:r.read_u64::<LittleEndian>()?})}}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<T: Encodable>(v: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        v.consensus_encode(&mut Cursor::new(&mut buf)).expect("encode");
        buf
    }

    #[test]
    fn var_int_round_trips_across_widths() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000, u64::MAX] {
            let mut buf = Vec::new();
            write_var_int(&mut Cursor::new(&mut buf), n).unwrap();
            assert_eq!(read_var_int(&mut Cursor::new(&buf)).unwrap(), n);
        }
    }

    #[test]
    fn message_header_round_trips() {
        let hdr = MessageHeader::new(MAINNET_MAGIC, *CMD_PING, 8, [1, 2, 3, 4]);
        let buf = encode(&hdr);
        assert_eq!(buf.len(), MessageHeader::SIZE);
        assert_eq!(MessageHeader::consensus_decode(&mut Cursor::new(&buf)).unwrap(), hdr);
    }

    #[test]
    fn net_addr_round_trips() {
        let addr = NetAddr::new("203.0.113.7".parse().unwrap(), 20866, NODE_NETWORK);
        let buf = encode(&addr);
        assert_eq!(NetAddr::consensus_decode(&mut Cursor::new(&buf)).unwrap(), addr);
    }

    #[test]
    fn addr_payload_shorter_than_declared_count_is_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u64.to_le_bytes());
        payload.extend_from_slice(&[0u8; 2 * ADDR_ENTRY_SIZE]); // only room for two entries
        assert!(AddrMessage::decode_payload(&payload).is_err());
    }

    #[test]
    fn addr_payload_over_count_limit_is_rejected() {
        let count = MAX_ADDRESSES_PER_MSG + 1;
        let mut payload = Vec::new();
        payload.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&vec![0u8; count as usize * ADDR_ENTRY_SIZE]);
        assert!(AddrMessage::decode_payload(&payload).is_err());
    }

    #[test]
    fn addr_payload_round_trips() {
        let info = PeerInfo::from_socket_addr("198.51.100.4:20866".parse().unwrap(), 1_700_000_000, NODE_NETWORK);
        let msg = AddrMessage { addresses: vec![info.clone()] };
        let buf = encode(&msg);
        let decoded = AddrMessage::decode_payload(&buf).unwrap();
        assert_eq!(decoded.addresses.len(), 1);
        assert_eq!(decoded.addresses[0].address, info.address);
        assert_eq!(decoded.addresses[0].port, info.port);
        assert_eq!(decoded.addresses[0].timestamp, info.timestamp);
        assert!(decoded.addresses[0].is_ipv4_mapped());
    }

    #[test]
    fn merkle_block_extracts_single_matched_tx() {
        let header = BlockHeaderData {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [9u8; 32],
            timestamp: 0,
            bits: 0,
            nonce: 0,
            height: 42,
        };
        let mb = MerkleBlockMessage { header, total_tx: 1, hashes: vec![[9u8; 32]], flags: vec![0x01] };
        assert_eq!(mb.matched_tx_hashes(), vec![[9u8; 32]]);
    }

    #[test]
    fn merkle_block_with_maximum_total_tx_terminates() {
        let header = BlockHeaderData {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [9u8; 32],
            timestamp: 0,
            bits: 0,
            nonce: 0,
            height: 42,
        };
        let mb = MerkleBlockMessage { header, total_tx: u32::MAX, hashes: vec![[9u8; 32]], flags: vec![0x00] };
        assert!(mb.matched_tx_hashes().is_empty());
    }

    #[test]
    fn merkle_block_with_cleared_flags_matches_nothing() {
        let header = BlockHeaderData {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [9u8; 32],
            timestamp: 0,
            bits: 0,
            nonce: 0,
            height: 42,
        };
        let mb = MerkleBlockMessage { header, total_tx: 1, hashes: vec![[9u8; 32]], flags: vec![0x00] };
        assert!(mb.matched_tx_hashes().is_empty());
    }
}
