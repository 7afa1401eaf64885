//! Bounded, ordered replay pipeline.
//!
//! One step replays a single block in one direction: a loader thread feeds
//! `LoadedTx`s through a bounded channel, the engine applies them to the
//! cursor in block order, and every sink gets its own bounded channel fed in
//! the same order. Completion propagates by sender drop; cancellation
//! propagates upstream through the shared token. Any failure rolls the
//! cursor back before the error surfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use bitd_consensus::Hash256;
use bitd_storage::KeyValueStore;

use crate::blocktxes::{BlockTxesStorage, KvBlockTxesStorage};
use crate::chain::Direction;
use crate::engine::{BlockApplier, BlockRollback, ValidatableTx};
use crate::error::ChainError;
use crate::hash_to_hex;
use crate::headers::ChainedHeader;
use crate::replay::BlockReplayer;
use crate::rules::Rules;
use crate::store::{UtxoCursor, UtxoStore};

/// Cooperative cancellation flag threaded through every stage.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ChainError> {
        if self.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        Ok(())
    }
}

/// Ordered consumer of replayed transactions.
pub trait TxSink: Send {
    fn accept(&mut self, tx: &ValidatableTx, direction: Direction) -> Result<(), ChainError>;
}

/// Lets a sink live outside the pipeline (e.g. a wallet shared with its
/// owner) while the step drives it.
impl<T: TxSink> TxSink for Arc<std::sync::Mutex<T>> {
    fn accept(&mut self, tx: &ValidatableTx, direction: Direction) -> Result<(), ChainError> {
        self.lock().expect("sink lock").accept(tx, direction)
    }
}

/// Structural validator fanned out from the transform stage.
struct ValidatorSink {
    rules: Arc<dyn Rules>,
    height: i32,
    block_hash: Hash256,
}

impl TxSink for ValidatorSink {
    fn accept(&mut self, tx: &ValidatableTx, direction: Direction) -> Result<(), ChainError> {
        if direction == Direction::Disconnect {
            return Ok(());
        }
        self.rules.check_transaction(self.height, tx).map_err(|err| {
            bitd_log::log_warn!(
                "tx {} in block {} rejected: {err}",
                tx.loaded.tx_index,
                hash_to_hex(&self.block_hash)
            );
            ChainError::Validation(self.block_hash)
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReplayConfig {
    /// Bound of every inter-stage channel.
    pub channel_capacity: usize,
    /// How long a worker may hold one chain-state snapshot before it yields
    /// and re-enters the walker.
    pub snapshot_budget: Duration,
    pub cursor_timeout: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            snapshot_budget: Duration::from_secs(15),
            cursor_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StepOutcome {
    pub block_hash: Hash256,
    pub direction: Direction,
    pub tx_count: u32,
}

enum StepEngine {
    Forward(BlockApplier),
    Reverse(BlockRollback),
}

impl StepEngine {
    fn apply<S: KeyValueStore>(
        &mut self,
        cursor: &mut UtxoCursor<S>,
        loaded: &crate::replay::LoadedTx,
    ) -> Result<ValidatableTx, ChainError> {
        match self {
            StepEngine::Forward(applier) => applier.apply_tx(cursor, loaded),
            StepEngine::Reverse(rollback) => rollback.rollback_tx(cursor, loaded),
        }
    }

    fn finish<S: KeyValueStore>(self, cursor: &mut UtxoCursor<S>) -> Result<(), ChainError> {
        match self {
            StepEngine::Forward(applier) => applier.finish(cursor),
            StepEngine::Reverse(rollback) => rollback.finish(cursor),
        }
    }
}

/// Replays one block through engine and sinks, committing on success and
/// rolling back on any failure.
#[allow(clippy::too_many_arguments)]
pub fn run_step<S: KeyValueStore + 'static>(
    utxo: &UtxoStore<S>,
    txes: &KvBlockTxesStorage<S>,
    chained: &Arc<ChainedHeader>,
    direction: Direction,
    rules: &Arc<dyn Rules>,
    sinks: &mut [Box<dyn TxSink>],
    cancel: &CancelToken,
    config: &ReplayConfig,
) -> Result<StepOutcome, ChainError> {
    cancel.check()?;
    let mut cursor = utxo.cursor(config.cursor_timeout)?;
    let replayer = BlockReplayer::new(utxo.clone(), txes.clone());

    let mut engine = match direction {
        Direction::Connect => {
            StepEngine::Forward(BlockApplier::begin(chained, Arc::clone(rules)))
        }
        Direction::Disconnect => {
            let tx_count = txes
                .tx_count(&chained.hash)?
                .ok_or(ChainError::CannotRollback)?;
            StepEngine::Reverse(BlockRollback::begin(chained, Arc::clone(rules), tx_count))
        }
    };

    let mut validator = ValidatorSink {
        rules: Arc::clone(rules),
        height: chained.height,
        block_hash: chained.hash,
    };

    let result = thread::scope(|scope| -> Result<u32, ChainError> {
        let (loaded_tx, loaded_rx) = bounded(config.channel_capacity);
        let loader = {
            let replayer = replayer.clone();
            let block_hash = chained.hash;
            let height = chained.height;
            let cancel = cancel.clone();
            scope.spawn(move || {
                match replayer.replay_block(&block_hash, height, direction, cancel) {
                    Ok(sequence) => {
                        for item in sequence {
                            if loaded_tx.send(item).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = loaded_tx.send(Err(err));
                    }
                }
            })
        };

        let mut stage_sinks: Vec<&mut dyn TxSink> = Vec::with_capacity(sinks.len() + 1);
        stage_sinks.push(&mut validator);
        for sink in sinks.iter_mut() {
            stage_sinks.push(sink.as_mut());
        }

        let mut senders = Vec::with_capacity(stage_sinks.len());
        let mut sink_threads = Vec::with_capacity(stage_sinks.len());
        for sink in stage_sinks {
            let (item_tx, item_rx) = bounded::<ValidatableTx>(config.channel_capacity);
            senders.push(item_tx);
            let cancel = cancel.clone();
            sink_threads.push(scope.spawn(move || -> Result<(), ChainError> {
                while let Ok(item) = item_rx.recv() {
                    if cancel.is_cancelled() {
                        return Err(ChainError::Cancelled);
                    }
                    if let Err(err) = sink.accept(&item, direction) {
                        cancel.cancel();
                        return Err(err);
                    }
                }
                Ok(())
            }));
        }

        let mut applied = 0u32;
        let mut failure: Option<ChainError> = None;
        for item in loaded_rx.iter() {
            let loaded = match item {
                Ok(loaded) => loaded,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            if let Err(err) = cancel.check() {
                failure = Some(err);
                break;
            }
            let validatable = match engine.apply(&mut cursor, &loaded) {
                Ok(validatable) => validatable,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            applied += 1;
            for sender in &senders {
                if sender.send(validatable.clone()).is_err() {
                    failure = Some(ChainError::Cancelled);
                    break;
                }
            }
            if failure.is_some() {
                break;
            }
        }

        if failure.is_some() {
            cancel.cancel();
        }
        drop(senders);
        drop(loaded_rx);
        loader.join().map_err(|_| ChainError::Corruption("loader panicked"))?;
        for sink_thread in sink_threads {
            match sink_thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // A sink's own failure outranks the cancellation it caused.
                    let replace = match &failure {
                        None | Some(ChainError::Cancelled) => {
                            !matches!(err, ChainError::Cancelled)
                        }
                        Some(_) => false,
                    };
                    if replace || failure.is_none() {
                        failure = Some(err);
                    }
                }
                Err(_) => {
                    failure.get_or_insert(ChainError::Corruption("sink panicked"));
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    });

    let applied = match result {
        Ok(applied) => applied,
        Err(err) => {
            // Dropping the cursor discards every pending effect.
            drop(cursor);
            return Err(err);
        }
    };

    if direction == Direction::Connect && applied == 0 {
        drop(cursor);
        return Err(ChainError::Validation(chained.hash));
    }

    engine.finish(&mut cursor)?;
    match direction {
        Direction::Connect => cursor.set_validated_tip(&chained.hash),
        Direction::Disconnect => {
            if chained.height > 0 {
                cursor.set_validated_tip(&chained.header.prev_block);
            } else {
                cursor.clear_validated_tip();
            }
        }
    }
    cursor.commit()?;

    bitd_log::log_debug!(
        "{} block {} at height {} ({} txs)",
        match direction {
            Direction::Connect => "connected",
            Direction::Disconnect => "disconnected",
        },
        hash_to_hex(&chained.hash),
        chained.height,
        applied
    );

    Ok(StepOutcome {
        block_hash: chained.hash,
        direction,
        tx_count: applied,
    })
}
