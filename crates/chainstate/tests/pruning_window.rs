use std::sync::Arc;
use std::time::Duration;

use primitive_types::U256;

use bitd_chainstate::blocktxes::{BlockTx, BlockTxesStorage, KvBlockTxesStorage};
use bitd_chainstate::chain::{Chain, Direction};
use bitd_chainstate::headers::ChainedHeader;
use bitd_chainstate::pipeline::{run_step, CancelToken, ReplayConfig, TxSink};
use bitd_chainstate::pruning::{PruneConfig, PruneMode, PruningEngine};
use bitd_chainstate::rules::{Rules, StandardRules};
use bitd_chainstate::store::UtxoStore;
use bitd_chainstate::ChainError;
use bitd_consensus::Hash256;
use bitd_primitives::block::BlockHeader;
use bitd_primitives::{OutPoint, Transaction, TxIn, TxOut};
use bitd_storage::memory::MemoryStore;

fn make_header(prev: Hash256, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: prev,
        merkle_root: [0u8; 32],
        time: 1_700_000_000 + nonce,
        bits: 0x207f_ffff,
        nonce,
    }
}

fn coinbase_tx(tag: u32, values: &[u64]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: values
            .iter()
            .map(|value| TxOut {
                value: *value,
                script_pubkey: vec![0x51],
            })
            .collect(),
        lock_time: 0,
    }
}

fn spend_tx(input: (Hash256, u32), value: u64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new(input.0, input.1),
            script_sig: vec![0x01],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
    }
}

struct Harness {
    utxo: UtxoStore<MemoryStore>,
    txes: KvBlockTxesStorage<MemoryStore>,
    rules: Arc<dyn Rules>,
    chain: Chain,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            utxo: UtxoStore::new(Arc::clone(&store)),
            txes: KvBlockTxesStorage::new(store),
            rules: Arc::new(StandardRules),
            chain: Chain::new(),
        }
    }

    fn connect_block(&mut self, nonce: u32, txs: &[Transaction]) -> Arc<ChainedHeader> {
        let (prev, height) = match self.chain.tip() {
            Some(tip) => (tip.hash, tip.height + 1),
            None => ([0u8; 32], 0),
        };
        let header = make_header(prev, nonce);
        let hash = header.hash();
        let chained = Arc::new(ChainedHeader {
            header,
            hash,
            height,
            total_work: U256::from((height + 1) as u64),
        });
        self.chain.push(Arc::clone(&chained)).expect("push");
        self.txes
            .try_add_block_transactions(&hash, txs)
            .expect("store txs");
        let mut sinks: Vec<Box<dyn TxSink>> = Vec::new();
        run_step(
            &self.utxo,
            &self.txes,
            &chained,
            Direction::Connect,
            &self.rules,
            sinks.as_mut_slice(),
            &CancelToken::new(),
            &ReplayConfig::default(),
        )
        .expect("connect");
        chained
    }

    fn pruner(&self, mode: PruneMode, safety_buffer: i32) -> PruningEngine<MemoryStore> {
        PruningEngine::new(
            self.utxo.clone(),
            self.txes.clone(),
            PruneConfig {
                mode,
                safety_buffer,
                cursor_timeout: Duration::from_secs(1),
            },
        )
    }
}

/// Chain shape shared by the tests: the block-1 coinbase is fully spent at
/// height 2; the block-2 outputs stay unspent.
fn build(harness: &mut Harness) -> (Arc<ChainedHeader>, Arc<ChainedHeader>, Hash256, Hash256) {
    harness.connect_block(0, &[coinbase_tx(0, &[50])]);
    let cb1 = coinbase_tx(1, &[10]);
    let cb1_txid = cb1.txid();
    let block1 = harness.connect_block(1, &[cb1]);
    let cb2 = coinbase_tx(2, &[3]);
    let cb2_txid = cb2.txid();
    let sweep = spend_tx((cb1_txid, 0), 9);
    let block2 = harness.connect_block(2, &[cb2, sweep]);
    for tag in 3..=5u32 {
        harness.connect_block(tag, &[coinbase_tx(tag, &[1])]);
    }
    (block1, block2, cb1_txid, cb2_txid)
}

#[test]
fn preserve_unspent_drops_only_spent_history() {
    let mut harness = Harness::new();
    let (block1, block2, cb1_txid, cb2_txid) = build(&mut harness);

    let pruner = harness.pruner(PruneMode::PreserveUnspent, 3);
    // Tip height is 5; heights 0..=2 fall out of the buffer.
    assert_eq!(pruner.prune(&harness.chain).expect("prune"), 3);
    assert_eq!(harness.utxo.pruned_height().expect("meta"), Some(2));

    // The fully spent block-1 coinbase lost its payload and retained rows.
    assert_eq!(
        harness
            .txes
            .try_get_transaction(&block1.hash, 0)
            .expect("get"),
        Some(BlockTx::Pruned)
    );
    assert_eq!(
        harness
            .utxo
            .unspent_output(&OutPoint::new(cb1_txid, 0))
            .expect("get"),
        None
    );

    // Unspent data at pruned heights stays queryable.
    assert!(matches!(
        harness
            .txes
            .try_get_transaction(&block2.hash, 0)
            .expect("get"),
        Some(BlockTx::Full(_))
    ));
    assert!(harness.utxo.unspent_tx(&cb2_txid).expect("get").is_some());

    // The per-height rollback indices are gone behind the buffer and kept
    // inside it.
    for height in 0..=2 {
        assert_eq!(harness.utxo.block_spent_txs(height).expect("get"), None);
        assert_eq!(harness.utxo.block_unminted_txs(height).expect("get"), None);
    }
    assert!(harness.utxo.block_unminted_txs(3).expect("get").is_some());

    // Idempotent: a second pass finds nothing to do.
    assert_eq!(pruner.prune(&harness.chain).expect("prune"), 0);
}

#[test]
fn full_mode_drops_everything_behind_the_buffer() {
    let mut harness = Harness::new();
    let (block1, block2, _, cb2_txid) = build(&mut harness);

    let pruner = harness.pruner(PruneMode::Full, 3);
    assert_eq!(pruner.prune(&harness.chain).expect("prune"), 3);

    for (block, count) in [(&block1, 1u32), (&block2, 2u32)] {
        for index in 0..count {
            assert_eq!(
                harness
                    .txes
                    .try_get_transaction(&block.hash, index)
                    .expect("get"),
                Some(BlockTx::Pruned)
            );
        }
    }
    // The live UTXO set is untouched.
    assert!(harness.utxo.unspent_tx(&cb2_txid).expect("get").is_some());
}

#[test]
fn rollback_past_pruned_data_is_fatal() {
    let mut harness = Harness::new();
    let (_, block2, _, _) = build(&mut harness);

    let pruner = harness.pruner(PruneMode::PreserveUnspent, 3);
    pruner.prune(&harness.chain).expect("prune");

    let mut sinks: Vec<Box<dyn TxSink>> = Vec::new();
    let err = run_step(
        &harness.utxo,
        &harness.txes,
        &block2,
        Direction::Disconnect,
        &harness.rules,
        sinks.as_mut_slice(),
        &CancelToken::new(),
        &ReplayConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ChainError::CannotRollback));
}

#[test]
fn pruning_respects_the_safety_buffer() {
    let mut harness = Harness::new();
    build(&mut harness);

    let pruner = harness.pruner(PruneMode::PreserveUnspent, 10);
    assert_eq!(pruner.prune(&harness.chain).expect("prune"), 0);
    for height in 0..=5 {
        assert!(harness.utxo.block_unminted_txs(height).expect("get").is_some());
    }
}
