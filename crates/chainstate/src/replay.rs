//! Lazy, ordered block replay sequences.
//!
//! Forward replay reads transactions in block order and resolves previous
//! outputs against the committed UTXO state at replay start; inputs created
//! earlier in the same block resolve later, inside the engine. Reverse
//! replay walks the block backwards and resolves inputs from the per-height
//! unminted records written at connect time.

use bitd_consensus::Hash256;
use bitd_primitives::{Transaction, TxOut};
use bitd_storage::KeyValueStore;

use crate::blocktxes::{BlockTx, BlockTxesStorage, KvBlockTxesStorage};
use crate::chain::Direction;
use crate::error::ChainError;
use crate::pipeline::CancelToken;
use crate::rollback::UnmintedTx;
use crate::store::UtxoStore;
use crate::utxo::PrevTxOutput;

#[derive(Clone, Debug)]
pub struct LoadedTx {
    pub tx: Transaction,
    pub tx_index: u32,
    pub is_coinbase: bool,
    /// Previous outputs by input position; forward replay leaves `None` for
    /// inputs created earlier in the same block.
    pub prev_outputs: Vec<Option<TxOut>>,
    /// Reverse replay only: the stored records backing `prev_outputs`.
    pub prev_records: Option<Vec<PrevTxOutput>>,
}

pub struct BlockReplayer<S> {
    utxo: UtxoStore<S>,
    txes: KvBlockTxesStorage<S>,
}

impl<S> Clone for BlockReplayer<S> {
    fn clone(&self) -> Self {
        Self {
            utxo: self.utxo.clone(),
            txes: self.txes.clone(),
        }
    }
}

impl<S: KeyValueStore> BlockReplayer<S> {
    pub fn new(utxo: UtxoStore<S>, txes: KvBlockTxesStorage<S>) -> Self {
        Self { utxo, txes }
    }

    pub fn replay_block(
        &self,
        block_hash: &Hash256,
        height: i32,
        direction: Direction,
        cancel: CancelToken,
    ) -> Result<ReplaySequence<S>, ChainError> {
        let count = match self.txes.tx_count(block_hash)? {
            Some(count) => count,
            None => {
                return Err(match direction {
                    Direction::Connect => ChainError::MissingData(*block_hash),
                    Direction::Disconnect => ChainError::CannotRollback,
                })
            }
        };
        let unminted = match direction {
            Direction::Connect => None,
            Direction::Disconnect => {
                let records = self
                    .utxo
                    .block_unminted_txs(height)?
                    .ok_or(ChainError::CannotRollback)?;
                if records.len() != count as usize {
                    return Err(ChainError::Corruption("unminted record count mismatch"));
                }
                Some(records)
            }
        };
        Ok(ReplaySequence {
            utxo: self.utxo.clone(),
            txes: self.txes.clone(),
            block_hash: *block_hash,
            direction,
            cancel,
            count,
            yielded: 0,
            unminted,
            failed: false,
        })
    }
}

pub struct ReplaySequence<S> {
    utxo: UtxoStore<S>,
    txes: KvBlockTxesStorage<S>,
    block_hash: Hash256,
    direction: Direction,
    cancel: CancelToken,
    count: u32,
    yielded: u32,
    unminted: Option<Vec<UnmintedTx>>,
    failed: bool,
}

impl<S: KeyValueStore> ReplaySequence<S> {
    fn load(&self, tx_index: u32) -> Result<LoadedTx, ChainError> {
        let tx = match self.txes.try_get_transaction(&self.block_hash, tx_index)? {
            Some(BlockTx::Full(tx)) => tx,
            Some(BlockTx::Pruned) | None => {
                return Err(match self.direction {
                    Direction::Connect => ChainError::MissingData(self.block_hash),
                    Direction::Disconnect => ChainError::CannotRollback,
                })
            }
        };
        let is_coinbase = tx.is_coinbase();

        match self.direction {
            Direction::Connect => {
                let mut prev_outputs = Vec::new();
                if !is_coinbase {
                    prev_outputs.reserve(tx.vin.len());
                    for input in &tx.vin {
                        prev_outputs.push(self.utxo.unspent_output(&input.prevout)?);
                    }
                }
                Ok(LoadedTx {
                    tx,
                    tx_index,
                    is_coinbase,
                    prev_outputs,
                    prev_records: None,
                })
            }
            Direction::Disconnect => {
                let records = self
                    .unminted
                    .as_ref()
                    .and_then(|records| records.get(tx_index as usize))
                    .ok_or(ChainError::Corruption("unminted record index mismatch"))?;
                if records.tx_hash != tx.txid() {
                    return Err(ChainError::Corruption("unminted record hash mismatch"));
                }
                let prev_outputs = records
                    .prev_outputs
                    .iter()
                    .map(|prev| Some(prev.output.clone()))
                    .collect();
                Ok(LoadedTx {
                    tx,
                    tx_index,
                    is_coinbase,
                    prev_outputs,
                    prev_records: Some(records.prev_outputs.clone()),
                })
            }
        }
    }
}

impl<S: KeyValueStore> Iterator for ReplaySequence<S> {
    type Item = Result<LoadedTx, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.yielded >= self.count {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.failed = true;
            return Some(Err(ChainError::Cancelled));
        }
        let tx_index = match self.direction {
            Direction::Connect => self.yielded,
            Direction::Disconnect => self.count - 1 - self.yielded,
        };
        let item = self.load(tx_index);
        if item.is_err() {
            self.failed = true;
        } else {
            self.yielded += 1;
        }
        Some(item)
    }
}
