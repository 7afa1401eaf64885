//! The UTXO store and its exclusive transactional cursor.
//!
//! A cursor buffers every mutation in a pending overlay and flushes it as a
//! single `WriteBatch` on commit. Reads through the cursor see the overlay
//! first, so effects of earlier transactions in a block are visible to later
//! ones before anything is committed. Dropping a cursor without committing
//! discards the overlay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bitd_consensus::Hash256;
use bitd_primitives::encoding::{decode, encode};
use bitd_primitives::{OutPoint, TxOut};
use bitd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainError;
use crate::pool::{DisposableItemPool, PoolHandle};
use crate::rollback::{
    decode_spent_txs, decode_unminted_txs, encode_spent_txs, encode_unminted_txs, height_key,
    SpentTx, UnmintedTx,
};
use crate::utxo::{outpoint_key_bytes, UnspentTx};

const CHAIN_TOTALS_KEY: &[u8] = b"chain_totals";
const VALIDATED_TIP_KEY: &[u8] = b"validated_tip";
const PRUNED_HEIGHT_KEY: &[u8] = b"pruned_height";

pub const DEFAULT_CURSOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate counters maintained alongside the UTXO maps.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainTotals {
    pub unspent_tx_count: u64,
    pub unspent_output_count: u64,
    pub total_tx_count: u64,
    pub total_input_count: u64,
    pub total_output_count: u64,
}

impl ChainTotals {
    fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[0..8].copy_from_slice(&self.unspent_tx_count.to_le_bytes());
        out[8..16].copy_from_slice(&self.unspent_output_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.total_tx_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.total_input_count.to_le_bytes());
        out[32..40].copy_from_slice(&self.total_output_count.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 40 {
            return None;
        }
        Some(Self {
            unspent_tx_count: u64::from_le_bytes(bytes[0..8].try_into().ok()?),
            unspent_output_count: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            total_tx_count: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
            total_input_count: u64::from_le_bytes(bytes[24..32].try_into().ok()?),
            total_output_count: u64::from_le_bytes(bytes[32..40].try_into().ok()?),
        })
    }
}

#[derive(Default, Debug)]
pub(crate) struct CursorState {
    pending: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
    totals: Option<ChainTotals>,
}

impl CursorState {
    fn reset(&mut self) {
        self.pending.clear();
        self.totals = None;
    }
}

pub struct UtxoStore<S> {
    store: Arc<S>,
    cursors: Arc<DisposableItemPool<CursorState>>,
}

impl<S> Clone for UtxoStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cursors: Arc::clone(&self.cursors),
        }
    }
}

impl<S: KeyValueStore> UtxoStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        let pool = DisposableItemPool::new(1).prepare_with(CursorState::reset);
        pool.seed(CursorState::default());
        Self {
            store,
            cursors: Arc::new(pool),
        }
    }

    /// Opens the exclusive write transaction. Blocks until the previous
    /// cursor finishes, up to the timeout.
    pub fn cursor(&self, timeout: Duration) -> Result<UtxoCursor<S>, ChainError> {
        let state = DisposableItemPool::take(&self.cursors, timeout)?;
        Ok(UtxoCursor {
            store: Arc::clone(&self.store),
            state,
        })
    }

    pub fn unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, ChainError> {
        match self.store.get(Column::UnspentTx, tx_hash)? {
            Some(bytes) => UnspentTx::decode(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable unspent tx record")),
            None => Ok(None),
        }
    }

    pub fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, ChainError> {
        let key = outpoint_key_bytes(outpoint);
        match self.store.get(Column::UnspentOutput, key.as_bytes())? {
            Some(bytes) => decode::<TxOut>(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable unspent output record")),
            None => Ok(None),
        }
    }

    pub fn totals(&self) -> Result<ChainTotals, ChainError> {
        match self.store.get(Column::Meta, CHAIN_TOTALS_KEY)? {
            Some(bytes) => ChainTotals::decode(&bytes)
                .ok_or(ChainError::Corruption("undecodable chain totals record")),
            None => Ok(ChainTotals::default()),
        }
    }

    pub fn validated_tip(&self) -> Result<Option<Hash256>, ChainError> {
        match self.store.get(Column::Meta, VALIDATED_TIP_KEY)? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn pruned_height(&self) -> Result<Option<i32>, ChainError> {
        match self.store.get(Column::Meta, PRUNED_HEIGHT_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Corruption("undecodable pruned height record"))?;
                Ok(Some(i32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn block_spent_txs(&self, height: i32) -> Result<Option<Vec<SpentTx>>, ChainError> {
        match self.store.get(Column::SpentByHeight, &height_key(height))? {
            Some(bytes) => decode_spent_txs(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable spent record")),
            None => Ok(None),
        }
    }

    pub fn block_unminted_txs(&self, height: i32) -> Result<Option<Vec<UnmintedTx>>, ChainError> {
        match self
            .store
            .get(Column::UnmintedByHeight, &height_key(height))?
        {
            Some(bytes) => decode_unminted_txs(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable unminted record")),
            None => Ok(None),
        }
    }
}

pub struct UtxoCursor<S> {
    store: Arc<S>,
    state: PoolHandle<CursorState>,
}

impl<S> std::fmt::Debug for UtxoCursor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtxoCursor").field("state", &self.state).finish()
    }
}

impl<S: KeyValueStore> UtxoCursor<S> {
    fn read(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        if let Some(pending) = self.state.pending.get(&(column, key.to_vec())) {
            return Ok(pending.clone());
        }
        Ok(self.store.get(column, key)?)
    }

    fn write(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.state.pending.insert((column, key), Some(value));
    }

    fn remove(&mut self, column: Column, key: Vec<u8>) {
        self.state.pending.insert((column, key), None);
    }

    pub fn try_get_unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, ChainError> {
        match self.read(Column::UnspentTx, tx_hash)? {
            Some(bytes) => UnspentTx::decode(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable unspent tx record")),
            None => Ok(None),
        }
    }

    pub fn try_add_unspent_tx(&mut self, unspent: &UnspentTx) -> Result<bool, ChainError> {
        if self.read(Column::UnspentTx, &unspent.tx_hash)?.is_some() {
            return Ok(false);
        }
        self.write(
            Column::UnspentTx,
            unspent.tx_hash.to_vec(),
            unspent.encode(),
        );
        Ok(true)
    }

    pub fn try_update_unspent_tx(&mut self, unspent: &UnspentTx) -> Result<bool, ChainError> {
        if self.read(Column::UnspentTx, &unspent.tx_hash)?.is_none() {
            return Ok(false);
        }
        self.write(
            Column::UnspentTx,
            unspent.tx_hash.to_vec(),
            unspent.encode(),
        );
        Ok(true)
    }

    pub fn try_remove_unspent_tx(&mut self, tx_hash: &Hash256) -> Result<bool, ChainError> {
        if self.read(Column::UnspentTx, tx_hash)?.is_none() {
            return Ok(false);
        }
        self.remove(Column::UnspentTx, tx_hash.to_vec());
        Ok(true)
    }

    pub fn try_get_unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, ChainError> {
        let key = outpoint_key_bytes(outpoint);
        match self.read(Column::UnspentOutput, key.as_bytes())? {
            Some(bytes) => decode::<TxOut>(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable unspent output record")),
            None => Ok(None),
        }
    }

    pub fn try_add_unspent_output(
        &mut self,
        outpoint: &OutPoint,
        output: &TxOut,
    ) -> Result<bool, ChainError> {
        let key = outpoint_key_bytes(outpoint);
        if self.read(Column::UnspentOutput, key.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.write(
            Column::UnspentOutput,
            key.as_bytes().to_vec(),
            encode(output),
        );
        Ok(true)
    }

    pub fn try_update_unspent_output(
        &mut self,
        outpoint: &OutPoint,
        output: &TxOut,
    ) -> Result<bool, ChainError> {
        let key = outpoint_key_bytes(outpoint);
        if self.read(Column::UnspentOutput, key.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.write(
            Column::UnspentOutput,
            key.as_bytes().to_vec(),
            encode(output),
        );
        Ok(true)
    }

    pub fn try_remove_unspent_output(&mut self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        let key = outpoint_key_bytes(outpoint);
        if self.read(Column::UnspentOutput, key.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.remove(Column::UnspentOutput, key.as_bytes().to_vec());
        Ok(true)
    }

    pub fn totals(&mut self) -> Result<ChainTotals, ChainError> {
        if let Some(totals) = self.state.totals {
            return Ok(totals);
        }
        let totals = match self.read(Column::Meta, CHAIN_TOTALS_KEY)? {
            Some(bytes) => ChainTotals::decode(&bytes)
                .ok_or(ChainError::Corruption("undecodable chain totals record"))?,
            None => ChainTotals::default(),
        };
        self.state.totals = Some(totals);
        Ok(totals)
    }

    pub fn set_totals(&mut self, totals: ChainTotals) {
        self.state.totals = Some(totals);
    }

    pub fn try_add_block_spent_txs(
        &mut self,
        height: i32,
        entries: &[SpentTx],
    ) -> Result<bool, ChainError> {
        let key = height_key(height);
        if self.read(Column::SpentByHeight, &key)?.is_some() {
            return Ok(false);
        }
        self.write(
            Column::SpentByHeight,
            key.to_vec(),
            encode_spent_txs(entries),
        );
        Ok(true)
    }

    pub fn try_get_block_spent_txs(&self, height: i32) -> Result<Option<Vec<SpentTx>>, ChainError> {
        match self.read(Column::SpentByHeight, &height_key(height))? {
            Some(bytes) => decode_spent_txs(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable spent record")),
            None => Ok(None),
        }
    }

    pub fn try_remove_block_spent_txs(&mut self, height: i32) -> Result<bool, ChainError> {
        let key = height_key(height);
        if self.read(Column::SpentByHeight, &key)?.is_none() {
            return Ok(false);
        }
        self.remove(Column::SpentByHeight, key.to_vec());
        Ok(true)
    }

    pub fn try_add_block_unminted_txs(
        &mut self,
        height: i32,
        entries: &[UnmintedTx],
    ) -> Result<bool, ChainError> {
        let key = height_key(height);
        if self.read(Column::UnmintedByHeight, &key)?.is_some() {
            return Ok(false);
        }
        self.write(
            Column::UnmintedByHeight,
            key.to_vec(),
            encode_unminted_txs(entries),
        );
        Ok(true)
    }

    pub fn try_get_block_unminted_txs(
        &self,
        height: i32,
    ) -> Result<Option<Vec<UnmintedTx>>, ChainError> {
        match self.read(Column::UnmintedByHeight, &height_key(height))? {
            Some(bytes) => decode_unminted_txs(&bytes)
                .map(Some)
                .map_err(|_| ChainError::Corruption("undecodable unminted record")),
            None => Ok(None),
        }
    }

    pub fn try_remove_block_unminted_txs(&mut self, height: i32) -> Result<bool, ChainError> {
        let key = height_key(height);
        if self.read(Column::UnmintedByHeight, &key)?.is_none() {
            return Ok(false);
        }
        self.remove(Column::UnmintedByHeight, key.to_vec());
        Ok(true)
    }

    pub fn set_validated_tip(&mut self, hash: &Hash256) {
        self.write(Column::Meta, VALIDATED_TIP_KEY.to_vec(), hash.to_vec());
    }

    pub fn clear_validated_tip(&mut self) {
        self.remove(Column::Meta, VALIDATED_TIP_KEY.to_vec());
    }

    pub fn set_pruned_height(&mut self, height: i32) {
        self.write(
            Column::Meta,
            PRUNED_HEIGHT_KEY.to_vec(),
            height.to_le_bytes().to_vec(),
        );
    }

    /// Flushes every pending mutation as one atomic batch.
    pub fn commit(mut self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        batch.reserve(self.state.pending.len() + 1);
        let pending = std::mem::take(&mut self.state.pending);
        for ((column, key), value) in pending {
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        if let Some(totals) = self.state.totals.take() {
            batch.put(Column::Meta, CHAIN_TOTALS_KEY, totals.encode());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Discards every pending mutation. Dropping the cursor does the same.
    pub fn rollback(self) {}
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, ChainError> {
    bytes
        .try_into()
        .map_err(|_| ChainError::Corruption("invalid hash length"))
}
