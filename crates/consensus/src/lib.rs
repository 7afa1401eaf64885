//! Consensus constants and chain-work arithmetic.

pub mod constants;
pub mod work;

/// 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub use constants::{duplicate_coinbases, is_duplicate_coinbase, MAX_MONEY, PRUNE_SAFETY_BUFFER};
pub use work::{block_proof, cmp_hash_be, compact_to_u256, hash_meets_target, u256_to_compact};

/// Parses a display-order (big-endian) hex string into internal byte order.
pub fn hash_from_hex(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[31 - i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}
