use crate::{BlockNumber, Hash256};
use serde::{Deserialize, Serialize};

/// A block identified by hash and number.
///
/// Beacon sync uses it as the pivot: the externally supplied block that
/// bounds how far back headers and bodies are filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub hash: Hash256,
    pub number: BlockNumber,
}

impl Checkpoint {
    pub fn new(hash: Hash256, number: BlockNumber) -> Self {
        Self { hash, number }
    }
}

impl From<&crate::BlockHeader> for Checkpoint {
    fn from(header: &crate::BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            number: header.number,
        }
    }
}
