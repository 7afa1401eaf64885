//! The mint/spend/unmint/unspend state machine.
//!
//! One applier instance covers one block in one direction. Every mutation
//! lands on the caller's cursor; nothing escapes if the cursor rolls back.

use std::sync::Arc;

use bitd_consensus::Hash256;
use bitd_primitives::{OutPoint, TxIn};
use bitd_storage::KeyValueStore;

use crate::error::ChainError;
use crate::hash_to_hex;
use crate::headers::ChainedHeader;
use crate::replay::LoadedTx;
use crate::rollback::{SpentTx, UnmintedTx};
use crate::rules::Rules;
use crate::store::UtxoCursor;
use crate::utxo::{OutputStates, PrevTxOutput, UnspentTx};

/// A transaction with every input's previous output resolved, ready for
/// validators and wallet scanners.
#[derive(Clone, Debug)]
pub struct ValidatableTx {
    pub loaded: LoadedTx,
    pub prev_outputs_final: Vec<PrevTxOutput>,
}

/// Applies one block's transactions forward, in block order.
pub struct BlockApplier {
    block_hash: Hash256,
    height: i32,
    rules: Arc<dyn Rules>,
    next_tx_index: u32,
    spent_txs: Vec<SpentTx>,
    unminted_txs: Vec<UnmintedTx>,
}

impl BlockApplier {
    pub fn begin(chained: &ChainedHeader, rules: Arc<dyn Rules>) -> Self {
        Self {
            block_hash: chained.hash,
            height: chained.height,
            rules,
            next_tx_index: 0,
            spent_txs: Vec::new(),
            unminted_txs: Vec::new(),
        }
    }

    pub fn apply_tx<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        loaded: &LoadedTx,
    ) -> Result<ValidatableTx, ChainError> {
        if loaded.tx_index != self.next_tx_index {
            return Err(ChainError::Corruption("out-of-order block replay"));
        }
        self.next_tx_index += 1;

        // Genesis outputs never enter the UTXO set.
        if self.height == 0 {
            return Ok(ValidatableTx {
                loaded: loaded.clone(),
                prev_outputs_final: Vec::new(),
            });
        }

        let txid = loaded.tx.txid();
        let mut prev_outputs_final = Vec::new();

        if !loaded.is_coinbase {
            prev_outputs_final.reserve(loaded.tx.vin.len());
            for (input_index, input) in loaded.tx.vin.iter().enumerate() {
                let prev = self.spend(cursor, &txid, input_index, input)?;
                prev_outputs_final.push(prev);
            }
        }

        if self.rules.is_duplicate_coinbase(self.height, &txid) {
            bitd_log::log_info!(
                "skipping mint of duplicate coinbase {} at height {}",
                hash_to_hex(&txid),
                self.height
            );
        } else {
            self.mint(cursor, loaded, &txid)?;
        }

        let mut totals = cursor.totals()?;
        totals.total_tx_count = totals
            .total_tx_count
            .checked_add(1)
            .ok_or(ChainError::Corruption("total tx count overflow"))?;
        totals.total_output_count = totals
            .total_output_count
            .checked_add(loaded.tx.vout.len() as u64)
            .ok_or(ChainError::Corruption("total output count overflow"))?;
        if !loaded.is_coinbase {
            totals.total_input_count = totals
                .total_input_count
                .checked_add(loaded.tx.vin.len() as u64)
                .ok_or(ChainError::Corruption("total input count overflow"))?;
        }
        cursor.set_totals(totals);

        self.unminted_txs.push(UnmintedTx {
            tx_hash: txid,
            prev_outputs: prev_outputs_final.clone(),
        });

        Ok(ValidatableTx {
            loaded: loaded.clone(),
            prev_outputs_final,
        })
    }

    fn spend<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        txid: &Hash256,
        input_index: usize,
        input: &TxIn,
    ) -> Result<PrevTxOutput, ChainError> {
        let Some(mut unspent) = cursor.try_get_unspent_tx(&input.prevout.hash)? else {
            bitd_log::log_warn!(
                "missing input for tx {} input {} prevout {}:{} at height {}",
                hash_to_hex(txid),
                input_index,
                hash_to_hex(&input.prevout.hash),
                input.prevout.index,
                self.height
            );
            return Err(ChainError::Validation(self.block_hash));
        };
        let snapshot = unspent.clone();

        let output_index = input.prevout.index;
        match unspent.output_states.is_unspent(output_index) {
            None => {
                bitd_log::log_warn!(
                    "output index {} out of bounds for tx {} at height {}",
                    output_index,
                    hash_to_hex(&input.prevout.hash),
                    self.height
                );
                return Err(ChainError::Validation(self.block_hash));
            }
            Some(false) => {
                bitd_log::log_warn!(
                    "double spend of {}:{} by tx {} at height {}",
                    hash_to_hex(&input.prevout.hash),
                    output_index,
                    hash_to_hex(txid),
                    self.height
                );
                return Err(ChainError::Validation(self.block_hash));
            }
            Some(true) => {}
        }

        unspent.output_states.set_spent(output_index);

        let mut totals = cursor.totals()?;
        totals.unspent_output_count = totals
            .unspent_output_count
            .checked_sub(1)
            .ok_or(ChainError::Corruption("unspent output count underflow"))?;

        if unspent.output_states.fully_spent() {
            if !cursor.try_remove_unspent_tx(&unspent.tx_hash)? {
                return Err(ChainError::Corruption("unspent tx vanished mid-spend"));
            }
            self.spent_txs.push(SpentTx {
                tx_hash: unspent.tx_hash,
                block_height: unspent.block_height,
                tx_index: unspent.tx_index,
                output_count: unspent.output_states.len(),
                is_coinbase: unspent.is_coinbase,
            });
            totals.unspent_tx_count = totals
                .unspent_tx_count
                .checked_sub(1)
                .ok_or(ChainError::Corruption("unspent tx count underflow"))?;
        } else if !cursor.try_update_unspent_tx(&unspent)? {
            return Err(ChainError::Corruption("unspent tx vanished mid-spend"));
        }
        cursor.set_totals(totals);

        let output = cursor
            .try_get_unspent_output(&input.prevout)?
            .ok_or(ChainError::Corruption("missing unspent output record"))?;

        Ok(PrevTxOutput {
            output,
            unspent_tx: snapshot,
        })
    }

    fn mint<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        loaded: &LoadedTx,
        txid: &Hash256,
    ) -> Result<(), ChainError> {
        let output_count = loaded.tx.vout.len() as u32;
        // A record exists only while at least one output is unspent; a
        // transaction without outputs never enters the set.
        if output_count == 0 {
            return Ok(());
        }
        let unspent = UnspentTx {
            tx_hash: *txid,
            block_height: self.height,
            tx_index: loaded.tx_index,
            version: loaded.tx.version,
            is_coinbase: loaded.is_coinbase,
            output_states: OutputStates::all_unspent(output_count),
        };
        if !cursor.try_add_unspent_tx(&unspent)? {
            bitd_log::log_warn!(
                "duplicate transaction {} minted at height {}",
                hash_to_hex(txid),
                self.height
            );
            return Err(ChainError::Validation(self.block_hash));
        }
        for (output_index, output) in loaded.tx.vout.iter().enumerate() {
            let outpoint = OutPoint::new(*txid, output_index as u32);
            if !cursor.try_add_unspent_output(&outpoint, output)? {
                bitd_log::log_warn!(
                    "duplicate output {}:{} minted at height {}",
                    hash_to_hex(txid),
                    output_index,
                    self.height
                );
                return Err(ChainError::Validation(self.block_hash));
            }
        }

        let mut totals = cursor.totals()?;
        totals.unspent_tx_count = totals
            .unspent_tx_count
            .checked_add(1)
            .ok_or(ChainError::Corruption("unspent tx count overflow"))?;
        totals.unspent_output_count = totals
            .unspent_output_count
            .checked_add(output_count as u64)
            .ok_or(ChainError::Corruption("unspent output count overflow"))?;
        cursor.set_totals(totals);
        Ok(())
    }

    /// Writes the per-height rollback indices after the last transaction.
    pub fn finish<S: KeyValueStore>(self, cursor: &mut UtxoCursor<S>) -> Result<(), ChainError> {
        if !cursor.try_add_block_spent_txs(self.height, &self.spent_txs)? {
            return Err(ChainError::Corruption("spent index already present"));
        }
        if !cursor.try_add_block_unminted_txs(self.height, &self.unminted_txs)? {
            return Err(ChainError::Corruption("unminted index already present"));
        }
        Ok(())
    }
}

/// Rolls one block's transactions back, in reverse block order.
pub struct BlockRollback {
    block_hash: Hash256,
    height: i32,
    rules: Arc<dyn Rules>,
    tx_count: u32,
    rolled_back: u32,
}

impl BlockRollback {
    pub fn begin(chained: &ChainedHeader, rules: Arc<dyn Rules>, tx_count: u32) -> Self {
        Self {
            block_hash: chained.hash,
            height: chained.height,
            rules,
            tx_count,
            rolled_back: 0,
        }
    }

    pub fn rollback_tx<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        loaded: &LoadedTx,
    ) -> Result<ValidatableTx, ChainError> {
        let expected_index = self
            .tx_count
            .checked_sub(self.rolled_back + 1)
            .ok_or(ChainError::Corruption("out-of-order block rollback"))?;
        if loaded.tx_index != expected_index {
            return Err(ChainError::Corruption("out-of-order block rollback"));
        }
        self.rolled_back += 1;

        if self.height == 0 {
            return Err(ChainError::Corruption("genesis cannot be disconnected"));
        }

        let txid = loaded.tx.txid();
        let prev_records = match (&loaded.prev_records, loaded.is_coinbase) {
            (_, true) => Vec::new(),
            (Some(records), false) => records.clone(),
            (None, false) => {
                return Err(ChainError::Corruption("rollback without undo records"))
            }
        };
        if !loaded.is_coinbase && prev_records.len() != loaded.tx.vin.len() {
            return Err(ChainError::Corruption("undo record input count mismatch"));
        }

        if self.rules.is_duplicate_coinbase(self.height, &txid) {
            bitd_log::log_info!(
                "skipping unmint of duplicate coinbase {} at height {}",
                hash_to_hex(&txid),
                self.height
            );
        } else {
            self.unmint(cursor, loaded, &txid)?;
        }

        if !loaded.is_coinbase {
            for (input, prev) in loaded.tx.vin.iter().zip(prev_records.iter()).rev() {
                self.unspend(cursor, input, prev)?;
            }
        }

        let mut totals = cursor.totals()?;
        totals.total_tx_count = totals
            .total_tx_count
            .checked_sub(1)
            .ok_or(ChainError::Corruption("total tx count underflow"))?;
        totals.total_output_count = totals
            .total_output_count
            .checked_sub(loaded.tx.vout.len() as u64)
            .ok_or(ChainError::Corruption("total output count underflow"))?;
        if !loaded.is_coinbase {
            totals.total_input_count = totals
                .total_input_count
                .checked_sub(loaded.tx.vin.len() as u64)
                .ok_or(ChainError::Corruption("total input count underflow"))?;
        }
        cursor.set_totals(totals);

        // Consumers see input resolutions in forward input order.
        Ok(ValidatableTx {
            loaded: loaded.clone(),
            prev_outputs_final: prev_records,
        })
    }

    fn unmint<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        loaded: &LoadedTx,
        txid: &Hash256,
    ) -> Result<(), ChainError> {
        if loaded.tx.vout.is_empty() {
            return Ok(());
        }
        let Some(unspent) = cursor.try_get_unspent_tx(txid)? else {
            bitd_log::log_error!(
                "unspent record for {} gone rolling back block {} at height {}",
                hash_to_hex(txid),
                hash_to_hex(&self.block_hash),
                self.height
            );
            return Err(ChainError::CannotRollback);
        };
        if !unspent.output_states.all_unspent_set() {
            return Err(ChainError::Corruption("unmint of partially spent tx"));
        }
        if unspent.output_states.len() as usize != loaded.tx.vout.len() {
            return Err(ChainError::Corruption("unmint output count mismatch"));
        }
        if !cursor.try_remove_unspent_tx(txid)? {
            return Err(ChainError::Corruption("unspent tx vanished mid-unmint"));
        }
        for output_index in 0..unspent.output_states.len() {
            let outpoint = OutPoint::new(*txid, output_index);
            if !cursor.try_remove_unspent_output(&outpoint)? {
                return Err(ChainError::Corruption("missing output row during unmint"));
            }
        }

        let mut totals = cursor.totals()?;
        totals.unspent_tx_count = totals
            .unspent_tx_count
            .checked_sub(1)
            .ok_or(ChainError::Corruption("unspent tx count underflow"))?;
        totals.unspent_output_count = totals
            .unspent_output_count
            .checked_sub(unspent.output_states.len() as u64)
            .ok_or(ChainError::Corruption("unspent output count underflow"))?;
        cursor.set_totals(totals);
        Ok(())
    }

    fn unspend<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        input: &TxIn,
        prev: &PrevTxOutput,
    ) -> Result<(), ChainError> {
        let expected = &prev.unspent_tx;
        let output_index = input.prevout.index;
        if expected.tx_hash != input.prevout.hash {
            return Err(ChainError::Corruption("undo record outpoint mismatch"));
        }
        if expected.output_states.is_unspent(output_index) != Some(true) {
            return Err(ChainError::Corruption("undo record state mismatch"));
        }

        let mut totals = cursor.totals()?;
        match cursor.try_get_unspent_tx(&input.prevout.hash)? {
            Some(mut current) => {
                if current.output_states.is_unspent(output_index) != Some(false) {
                    return Err(ChainError::Corruption("unspend of already unspent output"));
                }
                current.output_states.set_unspent(output_index);
                if current != *expected {
                    return Err(ChainError::Corruption("undo record state mismatch"));
                }
                if !cursor.try_update_unspent_tx(&current)? {
                    return Err(ChainError::Corruption("unspent tx vanished mid-unspend"));
                }
            }
            None => {
                // Fully spent and removed; the retained output rows make the
                // restore possible. Their absence means the pruner got here.
                if cursor.try_get_unspent_output(&input.prevout)?.is_none() {
                    bitd_log::log_error!(
                        "output rows for {} pruned; cannot roll back height {}",
                        hash_to_hex(&input.prevout.hash),
                        self.height
                    );
                    return Err(ChainError::CannotRollback);
                }
                if !cursor.try_add_unspent_tx(expected)? {
                    return Err(ChainError::Corruption("undo record already restored"));
                }
                totals.unspent_tx_count = totals
                    .unspent_tx_count
                    .checked_add(1)
                    .ok_or(ChainError::Corruption("unspent tx count overflow"))?;
            }
        }
        totals.unspent_output_count = totals
            .unspent_output_count
            .checked_add(1)
            .ok_or(ChainError::Corruption("unspent output count overflow"))?;
        cursor.set_totals(totals);
        Ok(())
    }

    /// Removes the per-height rollback indices after the last transaction.
    pub fn finish<S: KeyValueStore>(self, cursor: &mut UtxoCursor<S>) -> Result<(), ChainError> {
        if self.rolled_back != self.tx_count {
            return Err(ChainError::Corruption("incomplete block rollback"));
        }
        if !cursor.try_remove_block_spent_txs(self.height)? {
            return Err(ChainError::Corruption("missing spent index on rollback"));
        }
        if !cursor.try_remove_block_unminted_txs(self.height)? {
            return Err(ChainError::Corruption("missing unminted index on rollback"));
        }
        Ok(())
    }
}
