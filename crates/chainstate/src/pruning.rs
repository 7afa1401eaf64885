//! Height-based pruning behind the reorg safety buffer.
//!
//! Runs after each successful advancement and only ever touches heights at
//! least `safety_buffer` blocks behind the validated tip, so it can
//! interleave with replay. Each height is pruned through its own cursor,
//! which keeps a crashed run re-runnable.

use std::collections::HashMap;
use std::time::Duration;

use bitd_consensus::PRUNE_SAFETY_BUFFER;
use bitd_primitives::OutPoint;
use bitd_storage::KeyValueStore;

use crate::blocktxes::{BlockTxesStorage, KvBlockTxesStorage};
use crate::chain::Chain;
use crate::error::ChainError;
use crate::store::UtxoStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PruneMode {
    /// Drop only transactions already fully spent; unspent-tx data stays
    /// queryable and deep reorgs stay possible for unspent history.
    PreserveUnspent,
    /// Drop every transaction behind the buffer; the UTXO set suffices
    /// going forward and reorgs beyond the buffer become impossible.
    Full,
}

#[derive(Clone, Copy, Debug)]
pub struct PruneConfig {
    pub mode: PruneMode,
    pub safety_buffer: i32,
    pub cursor_timeout: Duration,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            mode: PruneMode::PreserveUnspent,
            safety_buffer: PRUNE_SAFETY_BUFFER,
            cursor_timeout: Duration::from_secs(10),
        }
    }
}

pub struct PruningEngine<S> {
    utxo: UtxoStore<S>,
    txes: KvBlockTxesStorage<S>,
    config: PruneConfig,
}

impl<S: KeyValueStore> PruningEngine<S> {
    pub fn new(utxo: UtxoStore<S>, txes: KvBlockTxesStorage<S>, config: PruneConfig) -> Self {
        Self { utxo, txes, config }
    }

    /// Prunes every eligible height along the validated chain. Returns the
    /// number of heights processed.
    pub fn prune(&self, chain: &Chain) -> Result<u32, ChainError> {
        let Some(tip_height) = chain.tip_height() else {
            return Ok(0);
        };
        let eligible = tip_height.saturating_sub(self.config.safety_buffer);
        if eligible < 0 {
            return Ok(0);
        }
        let start = match self.utxo.pruned_height()? {
            Some(height) => height
                .checked_add(1)
                .ok_or(ChainError::Corruption("pruned height overflow"))?,
            None => 0,
        };
        let mut pruned = 0u32;
        for height in start..=eligible {
            self.prune_height(height, chain)?;
            pruned += 1;
        }
        if pruned > 0 {
            bitd_log::log_debug!(
                "pruned {} height(s) up to {} (tip {})",
                pruned,
                eligible,
                tip_height
            );
        }
        Ok(pruned)
    }

    fn prune_height(&self, height: i32, chain: &Chain) -> Result<(), ChainError> {
        let header = chain
            .at_height(height)
            .ok_or(ChainError::Corruption("pruning past the validated chain"))?;
        let mut cursor = self.utxo.cursor(self.config.cursor_timeout)?;
        let spent = cursor.try_get_block_spent_txs(height)?.unwrap_or_default();

        // Transaction-level drops first: the retained output rows of fully
        // spent transactions, then their stored payloads at the blocks that
        // minted them.
        let mut by_origin: HashMap<i32, Vec<u32>> = HashMap::new();
        for entry in &spent {
            for output_index in 0..entry.output_count {
                cursor.try_remove_unspent_output(&OutPoint::new(entry.tx_hash, output_index))?;
            }
            by_origin
                .entry(entry.block_height)
                .or_default()
                .push(entry.tx_index);
        }
        for (origin_height, tx_indices) in by_origin {
            let origin = chain
                .at_height(origin_height)
                .ok_or(ChainError::Corruption("spent record outside the chain"))?;
            self.txes
                .try_prune_transactions(&origin.hash, Some(&tx_indices))?;
        }
        if self.config.mode == PruneMode::Full {
            self.txes.try_prune_transactions(&header.hash, None)?;
        }

        cursor.try_remove_block_spent_txs(height)?;
        cursor.try_remove_block_unminted_txs(height)?;
        cursor.set_pruned_height(height);
        cursor.commit()
    }
}
