//! Per-height rollback records.
//!
//! Connecting a block writes two indices keyed by its height: the summaries
//! of transactions it fully spent, and the resolved previous outputs of
//! every input it consumed. Disconnecting or pruning the height removes
//! them.

use bitd_consensus::Hash256;
use bitd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::utxo::PrevTxOutput;

const ROLLBACK_RECORD_VERSION: u8 = 1;

/// Summary of a transaction whose last unspent output was consumed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentTx {
    pub tx_hash: Hash256,
    pub block_height: i32,
    pub tx_index: u32,
    pub output_count: u32,
    pub is_coinbase: bool,
}

impl SpentTx {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.tx_hash);
        encoder.write_i32_le(self.block_height);
        encoder.write_u32_le(self.tx_index);
        encoder.write_u32_le(self.output_count);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
    }

    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx_hash = decoder.read_hash_le()?;
        let block_height = decoder.read_i32_le()?;
        let tx_index = decoder.read_u32_le()?;
        let output_count = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        Ok(Self {
            tx_hash,
            block_height,
            tx_index,
            output_count,
            is_coinbase,
        })
    }
}

/// One connected transaction's input resolutions, in forward input order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnmintedTx {
    pub tx_hash: Hash256,
    pub prev_outputs: Vec<PrevTxOutput>,
}

impl UnmintedTx {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.tx_hash);
        encoder.write_u32_le(self.prev_outputs.len() as u32);
        for prev in &self.prev_outputs {
            prev.encode_into(encoder);
        }
    }

    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx_hash = decoder.read_hash_le()?;
        let count = decoder.read_u32_le()? as usize;
        let mut prev_outputs = Vec::with_capacity(count);
        for _ in 0..count {
            prev_outputs.push(PrevTxOutput::decode_from(decoder)?);
        }
        Ok(Self {
            tx_hash,
            prev_outputs,
        })
    }
}

pub fn encode_spent_txs(entries: &[SpentTx]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u8(ROLLBACK_RECORD_VERSION);
    encoder.write_u32_le(entries.len() as u32);
    for entry in entries {
        entry.encode_into(&mut encoder);
    }
    encoder.into_inner()
}

pub fn decode_spent_txs(bytes: &[u8]) -> Result<Vec<SpentTx>, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let version = decoder.read_u8()?;
    if version != ROLLBACK_RECORD_VERSION {
        return Err(DecodeError::InvalidData("unsupported spent record version"));
    }
    let count = decoder.read_u32_le()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(SpentTx::decode_from(&mut decoder)?);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(entries)
}

pub fn encode_unminted_txs(entries: &[UnmintedTx]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u8(ROLLBACK_RECORD_VERSION);
    encoder.write_u32_le(entries.len() as u32);
    for entry in entries {
        entry.encode_into(&mut encoder);
    }
    encoder.into_inner()
}

pub fn decode_unminted_txs(bytes: &[u8]) -> Result<Vec<UnmintedTx>, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let version = decoder.read_u8()?;
    if version != ROLLBACK_RECORD_VERSION {
        return Err(DecodeError::InvalidData(
            "unsupported unminted record version",
        ));
    }
    let count = decoder.read_u32_le()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(UnmintedTx::decode_from(&mut decoder)?);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(entries)
}

pub fn height_key(height: i32) -> [u8; 4] {
    height.to_le_bytes()
}
