use crate::error::StoreError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque byte store backing headers, blocks, chain levels and metadata.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store. Clones share the same map, so a tree reopened on a clone
/// sees everything written before.
#[derive(Clone, Debug, Default)]
pub struct MemDb {
    entries: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Fixed keys of the metadata store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    LowestInsertedBeaconHeaderHash,
    LowestInsertedHeaderHash,
    BeaconSyncPivotNumber,
    BeaconSyncPivotHash,
    HeadHash,
}

impl MetadataKey {
    pub fn name(self) -> &'static str {
        match self {
            Self::LowestInsertedBeaconHeaderHash => "LowestInsertedBeaconHeaderHash",
            Self::LowestInsertedHeaderHash => "LowestInsertedHeaderHash",
            Self::BeaconSyncPivotNumber => "BeaconSyncPivotNumber",
            Self::BeaconSyncPivotHash => "BeaconSyncPivotHash",
            Self::HeadHash => "HeadHash",
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        self.name().as_bytes()
    }
}

/// The four stores a `BlockTree` owns.
#[derive(Clone)]
pub struct BlockTreeStores {
    pub headers: Arc<dyn KeyValueStore>,
    pub blocks: Arc<dyn KeyValueStore>,
    pub chain_levels: Arc<dyn KeyValueStore>,
    pub metadata: Arc<dyn KeyValueStore>,
}

impl BlockTreeStores {
    pub fn in_memory() -> Self {
        Self {
            headers: Arc::new(MemDb::new()),
            blocks: Arc::new(MemDb::new()),
            chain_levels: Arc::new(MemDb::new()),
            metadata: Arc::new(MemDb::new()),
        }
    }
}
