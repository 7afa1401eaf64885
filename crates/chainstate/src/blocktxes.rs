//! Block transaction storage service.
//!
//! Transactions are stored one row per `(block_hash, tx_index)` so pruning
//! can drop them individually; a per-block row keeps the count. A pruned row
//! stays present as a marker, so readers can tell "pruned" from "never had
//! it".

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bitd_consensus::Hash256;
use bitd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use bitd_primitives::Transaction;
use bitd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainError;

pub const BLOCK_TX_SHARD_COUNT: usize = 64;

const BLOCK_COUNT_KEY: &[u8] = b"block_count";

const TAG_PRUNED: u8 = 0;
const TAG_FULL: u8 = 1;

/// A stored block transaction: the full payload, or a marker left behind by
/// the pruner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockTx {
    Full(Transaction),
    Pruned,
}

impl BlockTx {
    pub fn encode_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            BlockTx::Full(tx) => {
                encoder.write_u8(TAG_FULL);
                tx.consensus_encode(&mut encoder);
            }
            BlockTx::Pruned => encoder.write_u8(TAG_PRUNED),
        }
        encoder.into_inner()
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tag = decoder.read_u8()?;
        let value = match tag {
            TAG_FULL => BlockTx::Full(Transaction::consensus_decode(&mut decoder)?),
            TAG_PRUNED => BlockTx::Pruned,
            _ => return Err(DecodeError::InvalidData("unknown block tx tag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(value)
    }
}

/// Injected persistence service for block transactions.
pub trait BlockTxesStorage: Send + Sync {
    fn try_add_block_transactions(
        &self,
        block_hash: &Hash256,
        txs: &[Transaction],
    ) -> Result<bool, ChainError>;
    fn try_read_block_transactions(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<BlockTx>>, ChainError>;
    fn contains_block(&self, block_hash: &Hash256) -> Result<bool, ChainError>;
    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<BlockTx>, ChainError>;
    fn tx_count(&self, block_hash: &Hash256) -> Result<Option<u32>, ChainError>;
    fn block_count(&self) -> Result<u64, ChainError>;
    /// Replaces full rows with pruned markers; `None` prunes the whole
    /// block. Returns how many rows changed.
    fn try_prune_transactions(
        &self,
        block_hash: &Hash256,
        tx_indices: Option<&[u32]>,
    ) -> Result<u32, ChainError>;
}

pub fn block_tx_key(block_hash: &Hash256, tx_index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(block_hash);
    key[32..].copy_from_slice(&tx_index.to_le_bytes());
    key
}

pub struct KvBlockTxesStorage<S> {
    store: Arc<S>,
    presence: Arc<Vec<Mutex<HashSet<Hash256>>>>,
}

impl<S> Clone for KvBlockTxesStorage<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            presence: Arc::clone(&self.presence),
        }
    }
}

impl<S> KvBlockTxesStorage<S> {
    pub fn new(store: Arc<S>) -> Self {
        let mut presence = Vec::with_capacity(BLOCK_TX_SHARD_COUNT);
        for _ in 0..BLOCK_TX_SHARD_COUNT {
            presence.push(Mutex::new(HashSet::new()));
        }
        Self {
            store,
            presence: Arc::new(presence),
        }
    }

    fn presence_shard(&self, block_hash: &Hash256) -> &Mutex<HashSet<Hash256>> {
        &self.presence[(block_hash[0] as usize) % BLOCK_TX_SHARD_COUNT]
    }
}

impl<S: KeyValueStore> BlockTxesStorage for KvBlockTxesStorage<S> {
    fn try_add_block_transactions(
        &self,
        block_hash: &Hash256,
        txs: &[Transaction],
    ) -> Result<bool, ChainError> {
        if self.contains_block(block_hash)? {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.reserve(txs.len() + 2);
        for (index, tx) in txs.iter().enumerate() {
            batch.put(
                Column::BlockTx,
                block_tx_key(block_hash, index as u32),
                BlockTx::Full(tx.clone()).encode_bytes(),
            );
        }
        batch.put(
            Column::BlockTxMeta,
            *block_hash,
            (txs.len() as u32).to_le_bytes(),
        );
        let block_count = self.block_count()?;
        batch.put(
            Column::Meta,
            BLOCK_COUNT_KEY,
            (block_count + 1).to_le_bytes(),
        );
        self.store.write_batch(&batch)?;
        self.presence_shard(block_hash)
            .lock()
            .expect("presence shard")
            .insert(*block_hash);
        Ok(true)
    }

    fn try_read_block_transactions(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<BlockTx>>, ChainError> {
        let Some(count) = self.tx_count(block_hash)? else {
            return Ok(None);
        };
        let mut txs = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.try_get_transaction(block_hash, index)? {
                Some(tx) => txs.push(tx),
                None => return Err(ChainError::Corruption("missing block tx row")),
            }
        }
        Ok(Some(txs))
    }

    fn contains_block(&self, block_hash: &Hash256) -> Result<bool, ChainError> {
        {
            let shard = self
                .presence_shard(block_hash)
                .lock()
                .expect("presence shard");
            if shard.contains(block_hash) {
                return Ok(true);
            }
        }
        let present = self.store.get(Column::BlockTxMeta, block_hash)?.is_some();
        if present {
            self.presence_shard(block_hash)
                .lock()
                .expect("presence shard")
                .insert(*block_hash);
        }
        Ok(present)
    }

    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<BlockTx>, ChainError> {
        match self
            .store
            .get(Column::BlockTx, &block_tx_key(block_hash, tx_index))?
        {
            Some(bytes) => BlockTx::decode_bytes(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable block tx row")),
            None => Ok(None),
        }
    }

    fn tx_count(&self, block_hash: &Hash256) -> Result<Option<u32>, ChainError> {
        match self.store.get(Column::BlockTxMeta, block_hash)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Corruption("invalid block tx count"))?;
                Ok(Some(u32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn block_count(&self) -> Result<u64, ChainError> {
        match self.store.get(Column::Meta, BLOCK_COUNT_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Corruption("invalid block count"))?;
                Ok(u64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn try_prune_transactions(
        &self,
        block_hash: &Hash256,
        tx_indices: Option<&[u32]>,
    ) -> Result<u32, ChainError> {
        let Some(count) = self.tx_count(block_hash)? else {
            return Ok(0);
        };
        let mut batch = WriteBatch::new();
        let mut pruned = 0u32;
        let mut prune_one = |index: u32| -> Result<(), ChainError> {
            if index >= count {
                return Ok(());
            }
            match self.try_get_transaction(block_hash, index)? {
                Some(BlockTx::Full(_)) => {
                    batch.put(
                        Column::BlockTx,
                        block_tx_key(block_hash, index),
                        BlockTx::Pruned.encode_bytes(),
                    );
                    pruned += 1;
                    Ok(())
                }
                Some(BlockTx::Pruned) | None => Ok(()),
            }
        };
        match tx_indices {
            Some(indices) => {
                for index in indices {
                    prune_one(*index)?;
                }
            }
            None => {
                for index in 0..count {
                    prune_one(index)?;
                }
            }
        }
        if pruned > 0 {
            self.store.write_batch(&batch)?;
        }
        Ok(pruned)
    }
}
