// src/transaction.rs
// ELA transaction model, wire codec, and content hashing.

use crate::p2p::messages::{
    read_var_bytes, read_var_int, sha256d, write_var_bytes, write_var_int, Decodable, Encodable,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind, Read, Write};

/// Native ELA asset id. Drafts may leave output asset ids zeroed; completion
/// resolves the placeholder to this before broadcast.
pub const ELA_ASSET_ID: [u8; 32] = [
    0xa3, 0xd0, 0xea, 0xa4, 0x66, 0xdf, 0x74, 0x98, 0x3b, 0x5d, 0x7c, 0x54, 0x3d, 0xe6, 0x90, 0x4f,
    0x4c, 0x94, 0x18, 0xea, 0xd5, 0xff, 0xd6, 0xd2, 0x58, 0x14, 0x23, 0x4a, 0x96, 0xdb, 0x37, 0xb0,
];

pub const ATTRIBUTE_USAGE_NONCE: u8 = 0x00;
pub const ATTRIBUTE_USAGE_MEMO: u8 = 0x81;

pub const TX_TYPE_TRANSFER_ASSET: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub usage: u8,
    pub data: Vec<u8>,
}
impl Encodable for Attribute{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_u8(self.usage)?;Ok(1+write_var_bytes(w,&self.data)?)}}
impl Decodable for Attribute{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{Ok(Self{usage:r.read_u8()?,data:read_var_bytes(r)?})}}

/// Reference to a prior output being spent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxInput {
    pub tx_hash: [u8; 32],
    pub index: u16,
    pub sequence: u32,
}
impl Encodable for TxInput{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_all(&self.tx_hash)?;w.write_u16::<LittleEndian>(self.index)?;w.write_u32::<LittleEndian>(self.sequence)?;Ok(38)}}
impl Decodable for TxInput{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let mut h=[0u8;32];r.read_exact(&mut h)?;Ok(Self{tx_hash:h,index:r.read_u16::<LittleEndian>()?,sequence:r.read_u32::<LittleEndian>()?})}}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub asset_id: [u8; 32],
    pub amount: u64,
    pub output_lock: u32,
    pub program_hash: [u8; 21],
}
impl Encodable for TxOutput{fn consensus_encode<W:Write+WriteBytesExt>(&self,w:&mut W)->Result<usize,IoError>{w.write_all(&self.asset_id)?;w.write_u64::<LittleEndian>(self.amount)?;w.write_u32::<LittleEndian>(self.output_lock)?;w.write_all(&self.program_hash)?;Ok(65)}}
impl Decodable for TxOutput{fn consensus_decode<R:Read+ReadBytesExt>(r:&mut R)->Result<Self,IoError>{let mut aid=[0u8;32];r.read_exact(&mut aid)?;let amount=r.read_u64::<LittleEndian>()?;let lock=r.read_u32::<LittleEndian>()?;let mut ph=[0u8;21];r.read_exact(&mut ph)?;Ok(Self{asset_id:aid,amount,output_lock:lock,program_hash:ph})}}

/// A draft or relayed transaction. The content hash is cached and must be
/// reset after any mutation of inputs or outputs; `hash()` recomputes lazily.
/// `remark` is local wallet metadata and never hits the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub tx_type: u8,
    pub payload_version: u8,
    pub attributes: Vec<Attribute>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub remark: String,
    cached_hash: Option<[u8; 32]>,
}

impl Transaction {
    pub fn new(tx_type: u8) -> Self {
        Transaction {
            tx_type,
            payload_version: 0,
            attributes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            remark: String::new(),
            cached_hash: None,
        }
    }

    pub fn reset_hash(&mut self) {
        self.cached_hash = None;
    }

    pub fn hash(&mut self) -> [u8; 32] {
        if let Some(h) = self.cached_hash {
            return h;
        }
        let h = self.compute_hash();
        self.cached_hash = Some(h);
        h
    }

    pub fn compute_hash(&self) -> [u8; 32] {
        let mut buf = Vec::new();
        // Encode failure on a Vec sink cannot happen.
        let _ = self.consensus_encode(&mut Cursor::new(&mut buf));
        sha256d(&buf)
    }

    /// First memo attribute decoded as text. Absent or non-UTF8 yields "".
    pub fn memo(&self) -> String {
        self.attributes
            .iter()
            .find(|a| a.usage == ATTRIBUTE_USAGE_MEMO)
            .map(|a| String::from_utf8_lossy(&a.data).to_string())
            .unwrap_or_default()
    }

    pub fn add_memo(&mut self, memo: &str) {
        if !memo.is_empty() {
            self.attributes.push(Attribute { usage: ATTRIBUTE_USAGE_MEMO, data: memo.as_bytes().to_vec() });
        }
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = 2;
        w.write_u8(self.tx_type)?;
        w.write_u8(self.payload_version)?;
        written += write_var_int(w, self.attributes.len() as u64)?;
        for attr in &self.attributes {
            written += attr.consensus_encode(w)?;
        }
        written += write_var_int(w, self.inputs.len() as u64)?;
        for input in &self.inputs {
            written += input.consensus_encode(w)?;
        }
        written += write_var_int(w, self.outputs.len() as u64)?;
        for output in &self.outputs {
            written += output.consensus_encode(w)?;
        }
        w.write_u32::<LittleEndian>(self.lock_time)?;
        written += 4;
        Ok(written)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let tx_type = r.read_u8()?;
        let payload_version = r.read_u8()?;
        let attr_count = read_var_int(r)?;
        if attr_count > 1024 {
            return Err(IoError::new(IoErrorKind::InvalidData, "transaction attribute count too large"));
        }
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            attributes.push(Attribute::consensus_decode(r)?);
        }
        let input_count = read_var_int(r)?;
        if input_count > 100_000 {
            return Err(IoError::new(IoErrorKind::InvalidData, "transaction input count too large"));
        }
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(TxInput::consensus_decode(r)?);
        }
        let output_count = read_var_int(r)?;
        if output_count > 100_000 {
            return Err(IoError::new(IoErrorKind::InvalidData, "transaction output count too large"));
        }
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOutput::consensus_decode(r)?);
        }
        let lock_time = r.read_u32::<LittleEndian>()?;
        Ok(Transaction {
            tx_type,
            payload_version,
            attributes,
            inputs,
            outputs,
            lock_time,
            remark: String::new(),
            cached_hash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new(TX_TYPE_TRANSFER_ASSET);
        tx.inputs.push(TxInput { tx_hash: [7u8; 32], index: 1, sequence: 0 });
        tx.outputs.push(TxOutput { asset_id: ELA_ASSET_ID, amount: 500, output_lock: 0, program_hash: [3u8; 21] });
        tx
    }

    #[test]
    fn transaction_round_trips() {
        let mut tx = sample_tx();
        tx.add_memo("coffee");
        let mut buf = Vec::new();
        tx.consensus_encode(&mut Cursor::new(&mut buf)).unwrap();
        let decoded = Transaction::consensus_decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.inputs, tx.inputs);
        assert_eq!(decoded.outputs, tx.outputs);
        assert_eq!(decoded.memo(), "coffee");
    }

    #[test]
    fn memo_defaults_to_empty() {
        assert_eq!(sample_tx().memo(), "");
    }

    #[test]
    fn hash_tracks_output_mutation() {
        let mut tx = sample_tx();
        let before = tx.hash();
        tx.outputs[0].amount = 600;
        tx.reset_hash();
        assert_ne!(tx.hash(), before);
    }

    #[test]
    fn cached_hash_is_stable_until_reset() {
        let mut tx = sample_tx();
        let h = tx.hash();
        assert_eq!(tx.hash(), h);
        assert_eq!(h, tx.compute_hash());
    }
}
