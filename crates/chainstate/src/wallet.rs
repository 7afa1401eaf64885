//! Reference wallet monitor consuming the replay stream.
//!
//! Illustrates the sink contract: the pipeline pushes every replayed
//! transaction with its direction; the monitor credits watched outputs,
//! debits watched spends, and rewinds both on reverse replay. No
//! back-references into the engine.

use std::collections::HashSet;

use bitd_consensus::Hash256;

use crate::chain::Direction;
use crate::engine::ValidatableTx;
use crate::error::ChainError;
use crate::pipeline::TxSink;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletEvent {
    pub tx_hash: Hash256,
    pub received: u64,
    pub sent: u64,
    pub direction: Direction,
}

#[derive(Default)]
pub struct WalletMonitor {
    watched: HashSet<Vec<u8>>,
    balance: i128,
    events: Vec<WalletEvent>,
}

impl WalletMonitor {
    pub fn new(watched: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            watched: watched.into_iter().collect(),
            balance: 0,
            events: Vec::new(),
        }
    }

    pub fn watch(&mut self, script_pubkey: Vec<u8>) {
        self.watched.insert(script_pubkey);
    }

    pub fn balance(&self) -> i128 {
        self.balance
    }

    pub fn events(&self) -> &[WalletEvent] {
        &self.events
    }
}

impl TxSink for WalletMonitor {
    fn accept(&mut self, tx: &ValidatableTx, direction: Direction) -> Result<(), ChainError> {
        let received: u64 = tx
            .loaded
            .tx
            .vout
            .iter()
            .filter(|output| self.watched.contains(&output.script_pubkey))
            .map(|output| output.value)
            .sum();
        let sent: u64 = tx
            .prev_outputs_final
            .iter()
            .filter(|prev| self.watched.contains(&prev.output.script_pubkey))
            .map(|prev| prev.output.value)
            .sum();
        if received == 0 && sent == 0 {
            return Ok(());
        }
        let delta = received as i128 - sent as i128;
        match direction {
            Direction::Connect => self.balance += delta,
            Direction::Disconnect => self.balance -= delta,
        }
        self.events.push(WalletEvent {
            tx_hash: tx.loaded.tx.txid(),
            received,
            sent,
            direction,
        });
        Ok(())
    }
}
