//! The replay worker: walks from the validated tip toward the best header
//! and drives the pipeline one step at a time.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bitd_consensus::Hash256;
use bitd_storage::KeyValueStore;

use crate::blocktxes::KvBlockTxesStorage;
use crate::chain::{navigate, Chain, Direction};
use crate::error::ChainError;
use crate::hash_to_hex;
use crate::headers::HeaderGraph;
use crate::pipeline::{run_step, CancelToken, ReplayConfig, TxSink};
use crate::pruning::{PruneConfig, PruningEngine};
use crate::rules::Rules;
use crate::store::UtxoStore;

#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    pub replay: ReplayConfig,
    pub prune: PruneConfig,
    /// Idle wait between polls of the header graph.
    pub poll_interval: Duration,
    /// Initial restart delay after an unexpected error; doubles up to the
    /// maximum.
    pub restart_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            replay: ReplayConfig::default(),
            prune: PruneConfig::default(),
            poll_interval: Duration::from_millis(250),
            restart_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdvanceOutcome {
    /// No headers chained yet.
    Idle,
    /// Validated tip already matches the best header.
    UpToDate,
    /// Reached the best header.
    Advanced { steps: u32 },
    /// Snapshot budget elapsed; progress committed, walker re-entered next
    /// advance.
    Yielded { steps: u32 },
    /// A block failed validation and was marked invalid.
    Rejected { block_hash: Hash256 },
    /// Block data was not available; a re-fetch may supply it.
    Missing { block_hash: Hash256 },
}

type BlockHashHandler = Box<dyn Fn(&Hash256) + Send + Sync>;

pub struct ChainWorker<S> {
    graph: Arc<HeaderGraph>,
    utxo: UtxoStore<S>,
    txes: KvBlockTxesStorage<S>,
    rules: Arc<dyn Rules>,
    pruning: PruningEngine<S>,
    sinks: Mutex<Vec<Box<dyn TxSink>>>,
    config: WorkerConfig,
    missed_handlers: RwLock<Vec<BlockHashHandler>>,
    tip_handlers: RwLock<Vec<BlockHashHandler>>,
}

impl<S: KeyValueStore + 'static> ChainWorker<S> {
    pub fn new(
        graph: Arc<HeaderGraph>,
        utxo: UtxoStore<S>,
        txes: KvBlockTxesStorage<S>,
        rules: Arc<dyn Rules>,
        config: WorkerConfig,
    ) -> Self {
        let pruning = PruningEngine::new(utxo.clone(), txes.clone(), config.prune);
        Self {
            graph,
            utxo,
            txes,
            rules,
            pruning,
            sinks: Mutex::new(Vec::new()),
            config,
            missed_handlers: RwLock::new(Vec::new()),
            tip_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Box<dyn TxSink>) {
        self.sinks.lock().expect("sink lock").push(sink);
    }

    pub fn on_block_txes_missed(&self, handler: impl Fn(&Hash256) + Send + Sync + 'static) {
        self.missed_handlers
            .write()
            .expect("handler lock")
            .push(Box::new(handler));
    }

    pub fn on_validated_tip(&self, handler: impl Fn(&Hash256) + Send + Sync + 'static) {
        self.tip_handlers
            .write()
            .expect("handler lock")
            .push(Box::new(handler));
    }

    fn fire_missed(&self, hash: &Hash256) {
        for handler in self.missed_handlers.read().expect("handler lock").iter() {
            handler(hash);
        }
    }

    fn fire_tip(&self, hash: &Hash256) {
        for handler in self.tip_handlers.read().expect("handler lock").iter() {
            handler(hash);
        }
    }

    fn validated_chain(&self) -> Result<Chain, ChainError> {
        match self.utxo.validated_tip()? {
            Some(hash) => self.graph.chain_to(&hash),
            None => Ok(Chain::new()),
        }
    }

    /// One walker pass: plans the path from the validated tip to the best
    /// header and replays steps until done, rejected, or out of budget.
    pub fn advance_once(&self, cancel: &CancelToken) -> Result<AdvanceOutcome, ChainError> {
        let Some(target_tip) = self.graph.max_total_work_tip() else {
            return Ok(AdvanceOutcome::Idle);
        };
        let current = self.validated_chain()?;
        if current.tip().map(|tip| tip.hash) == Some(target_tip.hash) {
            return Ok(AdvanceOutcome::UpToDate);
        }
        let target = self.graph.chain_to(&target_tip.hash)?;
        let path = navigate(&current, &target)?;

        let deadline = Instant::now() + self.config.replay.snapshot_budget;
        let mut steps = 0u32;
        {
            let mut sinks = self.sinks.lock().expect("sink lock");
            for (direction, header) in path {
                cancel.check()?;
                let step = run_step(
                    &self.utxo,
                    &self.txes,
                    &header,
                    direction,
                    &self.rules,
                    sinks.as_mut_slice(),
                    cancel,
                    &self.config.replay,
                );
                match step {
                    Ok(_) => {
                        steps += 1;
                        let new_tip = match direction {
                            Direction::Connect => header.hash,
                            Direction::Disconnect => header.header.prev_block,
                        };
                        self.fire_tip(&new_tip);
                    }
                    Err(ChainError::Validation(block_hash)) => {
                        self.graph.mark_invalid(&block_hash)?;
                        return Ok(AdvanceOutcome::Rejected { block_hash });
                    }
                    Err(ChainError::MissingData(block_hash)) => {
                        bitd_log::log_debug!(
                            "block transactions missing for {}",
                            hash_to_hex(&block_hash)
                        );
                        self.fire_missed(&block_hash);
                        return Ok(AdvanceOutcome::Missing { block_hash });
                    }
                    Err(err) => return Err(err),
                }
                if Instant::now() >= deadline {
                    self.prune_now()?;
                    return Ok(AdvanceOutcome::Yielded { steps });
                }
            }
        }
        self.prune_now()?;
        Ok(AdvanceOutcome::Advanced { steps })
    }

    fn prune_now(&self) -> Result<(), ChainError> {
        let chain = self.validated_chain()?;
        self.pruning.prune(&chain)?;
        Ok(())
    }

    /// Runs until cancelled. Unexpected errors are logged and retried with
    /// exponential backoff; rollback past pruned data stops the worker for
    /// operator intervention.
    pub fn run(&self, cancel: &CancelToken) {
        let mut backoff = self.config.restart_backoff;
        while !cancel.is_cancelled() {
            match self.advance_once(cancel) {
                Ok(AdvanceOutcome::Advanced { .. }) | Ok(AdvanceOutcome::Yielded { .. }) => {
                    backoff = self.config.restart_backoff;
                }
                Ok(AdvanceOutcome::Rejected { .. }) => {
                    // Tip selection already moved past the invalid chain.
                    backoff = self.config.restart_backoff;
                }
                Ok(_) => {
                    sleep_cancellable(self.config.poll_interval, cancel);
                }
                Err(ChainError::Cancelled) => break,
                Err(ChainError::CannotRollback) => {
                    bitd_log::log_error!(
                        "reorg requires data the pruner dropped; operator intervention required"
                    );
                    break;
                }
                Err(err) => {
                    bitd_log::log_error!(
                        "replay worker error: {err}; restarting in {}ms",
                        backoff.as_millis()
                    );
                    sleep_cancellable(backoff, cancel);
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }
}

fn sleep_cancellable(duration: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline && !cancel.is_cancelled() {
        std::thread::sleep(Duration::from_millis(25).min(duration));
    }
}
