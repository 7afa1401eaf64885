use std::sync::Arc;
use std::time::Duration;

use bitd_chainstate::blocktxes::{BlockTxesStorage, KvBlockTxesStorage};
use bitd_chainstate::chain::{navigate, Direction};
use bitd_chainstate::headers::{BlockStorage, HeaderGraph, KvBlockStorage};
use bitd_chainstate::pipeline::{CancelToken, ReplayConfig};
use bitd_chainstate::rules::StandardRules;
use bitd_chainstate::store::UtxoStore;
use bitd_chainstate::worker::{AdvanceOutcome, ChainWorker, WorkerConfig};
use bitd_consensus::Hash256;
use bitd_primitives::block::BlockHeader;
use bitd_primitives::{OutPoint, Transaction, TxIn, TxOut};
use bitd_storage::memory::MemoryStore;
use bitd_storage::{Column, KeyValueStore};

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

struct Node {
    store: Arc<MemoryStore>,
    graph: Arc<HeaderGraph>,
    utxo: UtxoStore<MemoryStore>,
    txes: KvBlockTxesStorage<MemoryStore>,
    worker: ChainWorker<MemoryStore>,
    cancel: CancelToken,
}

impl Node {
    fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    fn with_config(config: WorkerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(
            HeaderGraph::open(Arc::new(KvBlockStorage::new(Arc::clone(&store))))
                .expect("open graph"),
        );
        let utxo = UtxoStore::new(Arc::clone(&store));
        let txes = KvBlockTxesStorage::new(Arc::clone(&store));
        let worker = ChainWorker::new(
            Arc::clone(&graph),
            utxo.clone(),
            txes.clone(),
            Arc::new(StandardRules),
            config,
        );
        Self {
            store,
            graph,
            utxo,
            txes,
            worker,
            cancel: CancelToken::new(),
        }
    }

    fn submit_block(&self, header: &BlockHeader, txs: &[Transaction]) -> Hash256 {
        let hash = header.hash();
        if self.graph.get(&hash).expect("graph get").is_none() {
            if self.graph.contains(&header.prev_block).expect("contains") {
                self.graph
                    .try_chain(header.clone())
                    .expect("chain")
                    .expect("parent known");
            } else {
                self.graph.add_genesis(header.clone()).expect("genesis");
            }
        }
        self.txes
            .try_add_block_transactions(&hash, txs)
            .expect("store txs");
        hash
    }

    fn advance_until_settled(&self) -> AdvanceOutcome {
        loop {
            let outcome = self.worker.advance_once(&self.cancel).expect("advance");
            match outcome {
                AdvanceOutcome::Yielded { .. } => continue,
                other => return other,
            }
        }
    }

    fn utxo_dump(&self) -> Vec<(u8, Vec<u8>, Vec<u8>)> {
        let mut dump = Vec::new();
        for column in [Column::UnspentTx, Column::UnspentOutput] {
            for (key, value) in self.store.scan_prefix(column, &[]).expect("scan") {
                dump.push((column.index() as u8, key, value));
            }
        }
        dump
    }
}

#[test]
fn reorg_matches_fresh_build() {
    let node = Node::new();

    // A = [G, X, Y]; B = [G, X, Z, W]. B carries more work.
    let genesis_header = make_header([0u8; 32], 0);
    let genesis_hash = node.submit_block(&genesis_header, &[coinbase_tx(0, &[50])]);

    let x_header = make_header(genesis_hash, 1);
    let cb_x = coinbase_tx(1, &[10, 5]);
    let cb_x_txid = cb_x.txid();
    let x_hash = node.submit_block(&x_header, &[cb_x.clone()]);

    let y_header = make_header(x_hash, 2);
    let y_txs = vec![coinbase_tx(2, &[4]), spend_tx((cb_x_txid, 0), 9)];
    let y_hash = node.submit_block(&y_header, &y_txs);

    assert!(matches!(
        node.advance_until_settled(),
        AdvanceOutcome::Advanced { steps: 3 }
    ));
    assert_eq!(node.utxo.validated_tip().expect("tip"), Some(y_hash));

    let z_header = make_header(x_hash, 3);
    let z_txs = vec![coinbase_tx(3, &[6]), spend_tx((cb_x_txid, 1), 4)];
    let z_hash = node.submit_block(&z_header, &z_txs);
    let w_header = make_header(z_hash, 4);
    let w_txs = vec![coinbase_tx(4, &[2])];
    let w_hash = node.submit_block(&w_header, &w_txs);

    // The walker plans disconnect(Y), connect(Z), connect(W).
    let current = node.graph.chain_to(&y_hash).expect("chain A");
    let target = node.graph.chain_to(&w_hash).expect("chain B");
    let steps: Vec<_> = navigate(&current, &target)
        .expect("navigate")
        .map(|(direction, header)| (direction, header.hash))
        .collect();
    assert_eq!(
        steps,
        vec![
            (Direction::Disconnect, y_hash),
            (Direction::Connect, z_hash),
            (Direction::Connect, w_hash),
        ]
    );

    assert!(matches!(
        node.advance_until_settled(),
        AdvanceOutcome::Advanced { steps: 3 }
    ));
    assert_eq!(node.utxo.validated_tip().expect("tip"), Some(w_hash));

    // Bit-identical to a node that only ever saw G, X, Z, W.
    let fresh = Node::new();
    fresh.submit_block(&genesis_header, &[coinbase_tx(0, &[50])]);
    fresh.submit_block(&x_header, &[cb_x]);
    fresh.submit_block(&z_header, &z_txs);
    fresh.submit_block(&w_header, &w_txs);
    fresh.advance_until_settled();
    assert_eq!(fresh.utxo.validated_tip().expect("tip"), Some(w_hash));

    assert_eq!(node.utxo_dump(), fresh.utxo_dump());
    assert_eq!(
        node.utxo.totals().expect("totals"),
        fresh.utxo.totals().expect("totals")
    );
}

#[test]
fn invalid_block_is_marked_and_tip_moves_on() {
    let node = Node::new();
    let genesis_header = make_header([0u8; 32], 0);
    let genesis_hash = node.submit_block(&genesis_header, &[coinbase_tx(0, &[50])]);

    let x_header = make_header(genesis_hash, 1);
    let cb_x = coinbase_tx(1, &[10, 5]);
    let cb_x_txid = cb_x.txid();
    let x_hash = node.submit_block(&x_header, &[cb_x]);

    // The best-work branch double-spends; the shorter sibling is clean.
    let bad_header = make_header(x_hash, 2);
    let double = Transaction {
        version: 1,
        vin: vec![
            TxIn {
                prevout: OutPoint::new(cb_x_txid, 0),
                script_sig: vec![0x01],
                sequence: u32::MAX,
            },
            TxIn {
                prevout: OutPoint::new(cb_x_txid, 0),
                script_sig: vec![0x02],
                sequence: u32::MAX,
            },
        ],
        vout: vec![TxOut {
            value: 8,
            script_pubkey: vec![0x53],
        }],
        lock_time: 0,
    };
    let bad_hash = node.submit_block(&bad_header, &[coinbase_tx(2, &[1]), double]);
    let bad_child_header = make_header(bad_hash, 5);
    node.submit_block(&bad_child_header, &[coinbase_tx(5, &[1])]);

    let outcome = node.advance_until_settled();
    assert_eq!(outcome, AdvanceOutcome::Rejected { block_hash: bad_hash });

    let storage = KvBlockStorage::new(Arc::clone(&node.store));
    assert!(storage.is_block_invalid(&bad_hash).expect("invalid"));
    assert!(node.graph.is_invalid(&bad_hash).expect("invalid"));

    // Descendants of the invalid block are excluded; the clean chain wins.
    assert!(matches!(
        node.advance_until_settled(),
        AdvanceOutcome::UpToDate
    ));
    assert_eq!(node.utxo.validated_tip().expect("tip"), Some(x_hash));

    let cb_x_record = node
        .utxo
        .unspent_tx(&cb_x_txid)
        .expect("get")
        .expect("record");
    assert!(cb_x_record.output_states.all_unspent_set());
}

#[test]
fn snapshot_budget_yields_between_steps() {
    let config = WorkerConfig {
        replay: ReplayConfig {
            snapshot_budget: Duration::ZERO,
            ..ReplayConfig::default()
        },
        ..WorkerConfig::default()
    };
    let node = Node::with_config(config);

    let genesis_header = make_header([0u8; 32], 0);
    let mut prev = node.submit_block(&genesis_header, &[coinbase_tx(0, &[50])]);
    for tag in 1..=3u32 {
        let header = make_header(prev, tag);
        prev = node.submit_block(&header, &[coinbase_tx(tag, &[1])]);
    }

    // Each pass commits one step, yields, and re-enters the walker.
    let mut yields = 0;
    loop {
        match node.worker.advance_once(&node.cancel).expect("advance") {
            AdvanceOutcome::Yielded { steps } => {
                assert_eq!(steps, 1);
                yields += 1;
            }
            AdvanceOutcome::UpToDate => break,
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(yields <= 4, "walker failed to make progress");
    }
    assert_eq!(yields, 4);
    assert_eq!(node.utxo.validated_tip().expect("tip"), Some(prev));
}

#[test]
fn missing_block_txes_surface_as_event() {
    let node = Node::new();
    let genesis_header = make_header([0u8; 32], 0);
    node.graph.add_genesis(genesis_header.clone()).expect("genesis");

    let missed: Arc<std::sync::Mutex<Vec<Hash256>>> = Arc::default();
    {
        let missed = Arc::clone(&missed);
        node.worker.on_block_txes_missed(move |hash| {
            missed.lock().expect("missed lock").push(*hash);
        });
    }

    let outcome = node.worker.advance_once(&node.cancel).expect("advance");
    assert_eq!(
        outcome,
        AdvanceOutcome::Missing {
            block_hash: genesis_header.hash()
        }
    );
    assert_eq!(missed.lock().expect("missed lock").as_slice(), &[
        genesis_header.hash()
    ]);
}
