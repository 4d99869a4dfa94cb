pub use alloy_primitives::{Bytes, U256};

/// Keccak-256 digest identifying headers and blocks.
pub type Hash256 = alloy_primitives::B256;

pub type BlockNumber = u64;

/// Short `0x1234…abcd` rendering of a hash for log lines.
pub fn short_hash(hash: &Hash256) -> String {
    let encoded = hex::encode(hash.as_slice());
    format!("0x{}…{}", &encoded[..4], &encoded[encoded.len() - 4..])
}
