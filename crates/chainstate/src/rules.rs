//! The consensus-rules collaborator.
//!
//! The engine treats hashing, proof-of-work, and structural transaction
//! checks as an oracle behind this trait; script semantics never enter the
//! core.

use bitd_consensus::{compact_to_u256, hash_meets_target, Hash256, MAX_MONEY};
use bitd_primitives::block::BlockHeader;

use crate::engine::ValidatableTx;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationError {
    InvalidProofOfWork(&'static str),
    InvalidTransaction(&'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidProofOfWork(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

pub trait Rules: Send + Sync {
    fn header_hash(&self, header: &BlockHeader) -> Hash256;
    fn check_proof_of_work(&self, header: &BlockHeader) -> Result<(), ValidationError>;
    /// Structural and value checks for one replayed transaction with its
    /// previous outputs resolved.
    fn check_transaction(&self, height: i32, tx: &ValidatableTx) -> Result<(), ValidationError>;
    /// The frozen duplicate-coinbase carve-out; minting is skipped for
    /// matching transactions.
    fn is_duplicate_coinbase(&self, height: i32, tx_hash: &Hash256) -> bool {
        bitd_consensus::is_duplicate_coinbase(height, tx_hash)
    }
}

/// Default rules: double-SHA256 headers, compact-target proof-of-work, and
/// structural value conservation.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRules;

impl Rules for StandardRules {
    fn header_hash(&self, header: &BlockHeader) -> Hash256 {
        header.hash()
    }

    fn check_proof_of_work(&self, header: &BlockHeader) -> Result<(), ValidationError> {
        let target = compact_to_u256(header.bits)
            .map_err(|_| ValidationError::InvalidProofOfWork("malformed compact target"))?;
        let target_hash: Hash256 = target.to_little_endian();
        if !hash_meets_target(&self.header_hash(header), &target_hash) {
            return Err(ValidationError::InvalidProofOfWork(
                "block hash above target",
            ));
        }
        Ok(())
    }

    fn check_transaction(&self, height: i32, tx: &ValidatableTx) -> Result<(), ValidationError> {
        let loaded = &tx.loaded;
        if loaded.tx.vin.is_empty() {
            return Err(ValidationError::InvalidTransaction("transaction has no inputs"));
        }
        if loaded.tx.vout.is_empty() {
            return Err(ValidationError::InvalidTransaction(
                "transaction has no outputs",
            ));
        }
        if loaded.is_coinbase != (loaded.tx_index == 0) {
            return Err(ValidationError::InvalidTransaction(
                "coinbase must be the first transaction",
            ));
        }

        let mut value_out: u64 = 0;
        for output in &loaded.tx.vout {
            if output.value > MAX_MONEY {
                return Err(ValidationError::InvalidTransaction(
                    "output value out of range",
                ));
            }
            value_out = value_out
                .checked_add(output.value)
                .filter(|total| *total <= MAX_MONEY)
                .ok_or(ValidationError::InvalidTransaction(
                    "output total out of range",
                ))?;
        }

        if loaded.is_coinbase || height == 0 {
            return Ok(());
        }

        if tx.prev_outputs_final.len() != loaded.tx.vin.len() {
            return Err(ValidationError::InvalidTransaction(
                "unresolved previous outputs",
            ));
        }
        let mut value_in: u64 = 0;
        for prev in &tx.prev_outputs_final {
            value_in = value_in
                .checked_add(prev.output.value)
                .filter(|total| *total <= MAX_MONEY)
                .ok_or(ValidationError::InvalidTransaction(
                    "input total out of range",
                ))?;
        }
        if value_in < value_out {
            return Err(ValidationError::InvalidTransaction(
                "inputs worth less than outputs",
            ));
        }
        Ok(())
    }
}
