//! UTXO record types backed by the storage trait.

use bitd_consensus::Hash256;
use bitd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use bitd_primitives::{OutPoint, TxOut};

pub const OUTPOINT_KEY_LEN: usize = 36;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

pub fn outpoint_key_bytes(outpoint: &OutPoint) -> OutPointKey {
    OutPointKey::new(outpoint)
}

/// Spent/unspent flags for every original output of a transaction.
///
/// A set bit means the output is still unspent. The length is fixed at mint
/// time and never changes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputStates {
    bits: Vec<u8>,
    len: u32,
}

impl OutputStates {
    pub fn all_unspent(len: u32) -> Self {
        let byte_len = (len as usize).div_ceil(8);
        let mut bits = vec![0xffu8; byte_len];
        let tail = len % 8;
        if tail != 0 {
            if let Some(last) = bits.last_mut() {
                *last = (1u8 << tail) - 1;
            }
        }
        Self { bits, len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_unspent(&self, index: u32) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        let byte = self.bits[(index / 8) as usize];
        Some(byte & (1 << (index % 8)) != 0)
    }

    pub fn set_spent(&mut self, index: u32) {
        if index < self.len {
            self.bits[(index / 8) as usize] &= !(1 << (index % 8));
        }
    }

    pub fn set_unspent(&mut self, index: u32) {
        if index < self.len {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    pub fn unspent_count(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    pub fn fully_spent(&self) -> bool {
        self.unspent_count() == 0
    }

    pub fn all_unspent_set(&self) -> bool {
        self.unspent_count() == self.len
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.len);
        encoder.write_bytes(&self.bits);
    }

    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let len = decoder.read_u32_le()?;
        let byte_len = (len as usize).div_ceil(8);
        let bits = decoder.read_bytes(byte_len)?;
        Ok(Self { bits, len })
    }
}

/// A transaction with at least one unspent output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnspentTx {
    pub tx_hash: Hash256,
    pub block_height: i32,
    pub tx_index: u32,
    pub version: i32,
    pub is_coinbase: bool,
    pub output_states: OutputStates,
}

impl UnspentTx {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(value)
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.tx_hash);
        encoder.write_i32_le(self.block_height);
        encoder.write_u32_le(self.tx_index);
        encoder.write_i32_le(self.version);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        self.output_states.encode_into(encoder);
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx_hash = decoder.read_hash_le()?;
        let block_height = decoder.read_i32_le()?;
        let tx_index = decoder.read_u32_le()?;
        let version = decoder.read_i32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        let output_states = OutputStates::decode_from(decoder)?;
        Ok(Self {
            tx_hash,
            block_height,
            tx_index,
            version,
            is_coinbase,
            output_states,
        })
    }
}

/// Previous output resolved for an input, with the owning transaction's
/// pre-spend record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrevTxOutput {
    pub output: TxOut,
    pub unspent_tx: UnspentTx,
}

impl PrevTxOutput {
    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        self.output.consensus_encode(encoder);
        self.unspent_tx.encode_into(encoder);
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let output = TxOut::consensus_decode(decoder)?;
        let unspent_tx = UnspentTx::decode_from(decoder)?;
        Ok(Self { output, unspent_tx })
    }
}
