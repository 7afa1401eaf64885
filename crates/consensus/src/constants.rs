//! Frozen consensus constants.

use std::sync::OnceLock;

use crate::{hash_from_hex, Hash256};

/// Highest representable amount in satoshis.
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Blocks kept reorganizable behind the validated tip (one week of blocks).
pub const PRUNE_SAFETY_BUFFER: i32 = 7 * 144;

/// The two mainnet blocks whose coinbase re-used an earlier coinbase txid.
/// Minting is skipped for these; the earlier instance stays addressable.
const DUPLICATE_COINBASE_HEX: [(i32, &str); 2] = [
    (
        91_722,
        "e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468",
    ),
    (
        91_812,
        "d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599",
    ),
];

static DUPLICATE_COINBASES: OnceLock<Vec<(i32, Hash256)>> = OnceLock::new();

pub fn duplicate_coinbases() -> &'static [(i32, Hash256)] {
    DUPLICATE_COINBASES.get_or_init(|| {
        DUPLICATE_COINBASE_HEX
            .iter()
            .map(|(height, hex)| {
                let hash = hash_from_hex(hex).expect("frozen duplicate coinbase hex");
                (*height, hash)
            })
            .collect()
    })
}

pub fn is_duplicate_coinbase(height: i32, tx_hash: &Hash256) -> bool {
    duplicate_coinbases()
        .iter()
        .any(|(dup_height, dup_hash)| *dup_height == height && dup_hash == tx_hash)
}
