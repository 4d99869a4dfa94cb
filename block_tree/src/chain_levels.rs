use crate::codec::{decode, encode, number_key};
use crate::error::StoreError;
use crate::store::KeyValueStore;
use containers::{BlockNumber, ChainLevelInfo};
use std::sync::Arc;

/// Persists one `ChainLevelInfo` per block number.
#[derive(Clone)]
pub struct ChainLevelRepository {
    db: Arc<dyn KeyValueStore>,
}

impl ChainLevelRepository {
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        Self { db }
    }

    pub fn load_level(&self, number: BlockNumber) -> Result<Option<ChainLevelInfo>, StoreError> {
        self.db
            .get(&number_key(number))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn persist_level(
        &self,
        number: BlockNumber,
        level: &ChainLevelInfo,
    ) -> Result<(), StoreError> {
        self.db.set(&number_key(number), encode(level)?)
    }

    pub fn delete_level(&self, number: BlockNumber) -> Result<(), StoreError> {
        self.db.delete(&number_key(number))
    }
}
