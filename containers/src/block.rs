use crate::{BlockNumber, Bytes, Hash256, U256};
use alloy_primitives::B64;
use serde::{Deserialize, Serialize};

/// Keccak-256 of the RLP encoding of an empty list, the ommers hash of a
/// block without ommers.
pub const EMPTY_OMMERS_HASH: Hash256 = alloy_primitives::b256!(
    "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
);

/// Execution block header.
///
/// `total_difficulty` is an annotation filled in by the block tree on lookup.
/// It is neither hashed nor persisted with the header bytes.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub parent_hash: Hash256,
    pub ommers_hash: Hash256,
    pub state_root: Hash256,
    pub transactions_root: Hash256,
    pub receipts_root: Hash256,
    pub difficulty: U256,
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<u64>,
    #[serde(skip)]
    pub total_difficulty: Option<U256>,
}

impl BlockHeader {
    /// Keccak-256 of the RLP encoded execution header.
    pub fn hash(&self) -> Hash256 {
        alloy_consensus::Header::from(self).hash_slow()
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    /// Zero-difficulty block past genesis.
    pub fn is_pos(&self) -> bool {
        self.difficulty.is_zero() && !self.is_genesis()
    }

    pub fn is_post_ttd(&self, terminal_total_difficulty: Option<U256>) -> bool {
        match (terminal_total_difficulty, self.total_difficulty) {
            (Some(ttd), Some(td)) => td >= ttd,
            _ => false,
        }
    }

    /// The block whose total difficulty first reaches the terminal total
    /// difficulty. Genesis qualifies when it already reaches it.
    pub fn is_terminal_block(&self, terminal_total_difficulty: Option<U256>) -> bool {
        let (Some(ttd), Some(td)) = (terminal_total_difficulty, self.total_difficulty) else {
            return false;
        };
        if td < ttd {
            return false;
        }
        if self.is_genesis() {
            return true;
        }
        td.checked_sub(self.difficulty)
            .is_some_and(|parent_td| parent_td < ttd)
    }

    pub fn with_total_difficulty(mut self, total_difficulty: Option<U256>) -> Self {
        self.total_difficulty = total_difficulty;
        self
    }
}

impl From<&BlockHeader> for alloy_consensus::Header {
    fn from(header: &BlockHeader) -> Self {
        Self {
            parent_hash: header.parent_hash,
            ommers_hash: header.ommers_hash,
            state_root: header.state_root,
            transactions_root: header.transactions_root,
            receipts_root: header.receipts_root,
            difficulty: header.difficulty,
            number: header.number,
            gas_limit: header.gas_limit,
            gas_used: header.gas_used,
            timestamp: header.timestamp,
            extra_data: header.extra_data.clone(),
            nonce: B64::from(header.nonce.to_be_bytes()),
            base_fee_per_gas: header.base_fee_per_gas,
            ..Default::default()
        }
    }
}

/// The non-header part of a block. Transactions are opaque to the chain store.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Bytes>,
    pub ommers: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.ommers.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash256 {
        self.header.parent_hash
    }

    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }

    pub fn total_difficulty(&self) -> Option<U256> {
        self.header.total_difficulty
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }
}
