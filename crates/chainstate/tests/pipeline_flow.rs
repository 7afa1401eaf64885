use std::sync::{Arc, Mutex};

use primitive_types::U256;

use bitd_chainstate::blocktxes::{BlockTxesStorage, KvBlockTxesStorage};
use bitd_chainstate::chain::Direction;
use bitd_chainstate::engine::ValidatableTx;
use bitd_chainstate::headers::ChainedHeader;
use bitd_chainstate::pipeline::{run_step, CancelToken, ReplayConfig, TxSink};
use bitd_chainstate::rules::{Rules, StandardRules};
use bitd_chainstate::store::UtxoStore;
use bitd_chainstate::wallet::WalletMonitor;
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

fn make_chained(header: BlockHeader, height: i32) -> Arc<ChainedHeader> {
    let hash = header.hash();
    Arc::new(ChainedHeader {
        header,
        hash,
        height,
        total_work: U256::from((height + 1) as u64),
    })
}

fn coinbase_tx(tag: u32, values: &[(u64, u8)]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: values
            .iter()
            .map(|(value, script_tag)| TxOut {
                value: *value,
                script_pubkey: vec![*script_tag],
            })
            .collect(),
        lock_time: 0,
    }
}

fn spend_tx(input: (Hash256, u32), value: u64, script_tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new(input.0, input.1),
            script_sig: vec![0x01],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![script_tag],
        }],
        lock_time: 0,
    }
}

struct Harness {
    utxo: UtxoStore<MemoryStore>,
    txes: KvBlockTxesStorage<MemoryStore>,
    rules: Arc<dyn Rules>,
    config: ReplayConfig,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            utxo: UtxoStore::new(Arc::clone(&store)),
            txes: KvBlockTxesStorage::new(store),
            rules: Arc::new(StandardRules),
            config: ReplayConfig::default(),
        }
    }

    fn run(
        &self,
        chained: &Arc<ChainedHeader>,
        direction: Direction,
        sinks: &mut [Box<dyn TxSink>],
        cancel: &CancelToken,
    ) -> Result<u32, ChainError> {
        run_step(
            &self.utxo,
            &self.txes,
            chained,
            direction,
            &self.rules,
            sinks,
            cancel,
            &self.config,
        )
        .map(|outcome| outcome.tx_count)
    }

    fn connect(
        &self,
        chained: &Arc<ChainedHeader>,
        txs: &[Transaction],
        sinks: &mut [Box<dyn TxSink>],
    ) -> Result<u32, ChainError> {
        self.txes
            .try_add_block_transactions(&chained.hash, txs)
            .expect("store txs");
        self.run(chained, Direction::Connect, sinks, &CancelToken::new())
    }
}

/// Records the tx-index order each accepted transaction arrived in.
struct OrderSink {
    seen: Arc<Mutex<Vec<(u32, Direction)>>>,
}

impl TxSink for OrderSink {
    fn accept(&mut self, tx: &ValidatableTx, direction: Direction) -> Result<(), ChainError> {
        self.seen
            .lock()
            .expect("order lock")
            .push((tx.loaded.tx_index, direction));
        Ok(())
    }
}

struct FailingSink {
    fail_at: u32,
}

impl TxSink for FailingSink {
    fn accept(&mut self, tx: &ValidatableTx, _direction: Direction) -> Result<(), ChainError> {
        if tx.loaded.tx_index == self.fail_at {
            return Err(ChainError::Corruption("sink gave up"));
        }
        Ok(())
    }
}

fn chained_spend_block(cb_txid: Hash256, length: u32) -> Vec<Transaction> {
    // tx N spends tx N-1, all within one block.
    let mut txs = Vec::new();
    let mut prev = (cb_txid, 0u32);
    let mut value = 32u64;
    for _ in 0..length {
        let tx = spend_tx(prev, value, 0x52);
        prev = (tx.txid(), 0);
        value -= 1;
        txs.push(tx);
    }
    txs
}

#[test]
fn sinks_see_transactions_in_block_order() {
    let harness = Harness::new();
    let genesis = make_chained(make_header([0u8; 32], 0), 0);
    harness
        .connect(&genesis, &[coinbase_tx(0, &[(50, 0x51)])], &mut [])
        .expect("genesis");

    let block1 = make_chained(make_header(genesis.hash, 1), 1);
    let cb1 = coinbase_tx(1, &[(32, 0x51)]);
    let cb1_txid = cb1.txid();
    harness
        .connect(&block1, &[cb1], &mut [])
        .expect("block 1");

    // One coinbase plus six chained same-block spends.
    let block2 = make_chained(make_header(block1.hash, 2), 2);
    let mut txs = vec![coinbase_tx(2, &[(1, 0x51)])];
    txs.extend(chained_spend_block(cb1_txid, 6));

    let seen_a: Arc<Mutex<Vec<(u32, Direction)>>> = Arc::default();
    let seen_b: Arc<Mutex<Vec<(u32, Direction)>>> = Arc::default();
    let mut sinks: Vec<Box<dyn TxSink>> = vec![
        Box::new(OrderSink {
            seen: Arc::clone(&seen_a),
        }),
        Box::new(OrderSink {
            seen: Arc::clone(&seen_b),
        }),
    ];
    let applied = harness.connect(&block2, &txs, &mut sinks).expect("block 2");
    assert_eq!(applied, 7);

    let expected: Vec<(u32, Direction)> =
        (0..7).map(|index| (index, Direction::Connect)).collect();
    assert_eq!(*seen_a.lock().expect("lock"), expected);
    assert_eq!(*seen_b.lock().expect("lock"), expected);

    // Reverse replay walks the block backwards for every sink.
    let seen_rev: Arc<Mutex<Vec<(u32, Direction)>>> = Arc::default();
    let mut sinks: Vec<Box<dyn TxSink>> = vec![Box::new(OrderSink {
        seen: Arc::clone(&seen_rev),
    })];
    harness
        .run(
            &block2,
            Direction::Disconnect,
            sinks.as_mut_slice(),
            &CancelToken::new(),
        )
        .expect("rollback");
    let expected: Vec<(u32, Direction)> = (0..7)
        .rev()
        .map(|index| (index, Direction::Disconnect))
        .collect();
    assert_eq!(*seen_rev.lock().expect("lock"), expected);
}

#[test]
fn failing_sink_aborts_the_step_and_rolls_back() {
    let harness = Harness::new();
    let genesis = make_chained(make_header([0u8; 32], 0), 0);
    harness
        .connect(&genesis, &[coinbase_tx(0, &[(50, 0x51)])], &mut [])
        .expect("genesis");

    let block1 = make_chained(make_header(genesis.hash, 1), 1);
    let cb1 = coinbase_tx(1, &[(32, 0x51)]);
    let cb1_txid = cb1.txid();
    harness.connect(&block1, &[cb1], &mut []).expect("block 1");
    let totals_before = harness.utxo.totals().expect("totals");

    let block2 = make_chained(make_header(block1.hash, 2), 2);
    let mut txs = vec![coinbase_tx(2, &[(1, 0x51)])];
    txs.extend(chained_spend_block(cb1_txid, 4));
    let mut sinks: Vec<Box<dyn TxSink>> = vec![Box::new(FailingSink { fail_at: 2 })];
    let err = harness.connect(&block2, &txs, &mut sinks).unwrap_err();
    assert!(matches!(err, ChainError::Corruption("sink gave up")));

    // The cursor rolled back: tip and counters are untouched.
    assert_eq!(
        harness.utxo.validated_tip().expect("tip"),
        Some(block1.hash)
    );
    assert_eq!(harness.utxo.totals().expect("totals"), totals_before);
    assert!(harness
        .utxo
        .unspent_tx(&cb1_txid)
        .expect("get")
        .expect("record")
        .output_states
        .all_unspent_set());
}

#[test]
fn pre_cancelled_step_does_nothing() {
    let harness = Harness::new();
    let genesis = make_chained(make_header([0u8; 32], 0), 0);
    harness
        .txes
        .try_add_block_transactions(&genesis.hash, &[coinbase_tx(0, &[(50, 0x51)])])
        .expect("store txs");

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = harness
        .run(&genesis, Direction::Connect, &mut [], &cancel)
        .unwrap_err();
    assert!(matches!(err, ChainError::Cancelled));
    assert_eq!(harness.utxo.validated_tip().expect("tip"), None);
}

#[test]
fn wallet_monitor_tracks_and_rewinds_funds() {
    const WATCHED: u8 = 0x77;
    let harness = Harness::new();
    let genesis = make_chained(make_header([0u8; 32], 0), 0);
    harness
        .connect(&genesis, &[coinbase_tx(0, &[(50, 0x51)])], &mut [])
        .expect("genesis");

    let wallet = Arc::new(Mutex::new(WalletMonitor::new([vec![WATCHED]])));
    let mut sinks: Vec<Box<dyn TxSink>> = vec![Box::new(Arc::clone(&wallet))];

    // Two outputs land on the watched script.
    let block1 = make_chained(make_header(genesis.hash, 1), 1);
    let cb1 = coinbase_tx(1, &[(10, WATCHED), (5, WATCHED)]);
    let cb1_txid = cb1.txid();
    harness
        .connect(&block1, &[cb1], sinks.as_mut_slice())
        .expect("block 1");
    assert_eq!(wallet.lock().expect("wallet").balance(), 15);

    // One of them is spent away to a foreign script.
    let block2 = make_chained(make_header(block1.hash, 2), 2);
    let away = spend_tx((cb1_txid, 0), 9, 0x52);
    harness
        .connect(
            &block2,
            &[coinbase_tx(2, &[(1, 0x51)]), away],
            sinks.as_mut_slice(),
        )
        .expect("block 2");
    assert_eq!(wallet.lock().expect("wallet").balance(), 5);

    // Rewinding the spend restores the balance.
    harness
        .run(
            &block2,
            Direction::Disconnect,
            sinks.as_mut_slice(),
            &CancelToken::new(),
        )
        .expect("rollback");
    assert_eq!(wallet.lock().expect("wallet").balance(), 15);

    let wallet = wallet.lock().expect("wallet");
    assert_eq!(wallet.events().len(), 3);
    assert_eq!(wallet.events()[1].sent, 10);
    assert_eq!(wallet.events()[2].direction, Direction::Disconnect);
}
