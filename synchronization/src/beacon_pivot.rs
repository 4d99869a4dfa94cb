use block_tree::{BlockTree, BlockTreeError};
use containers::{BlockHeader, BlockNumber, Checkpoint, Hash256, LookupOptions};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Beacon sync pivot: the externally supplied block the local chain is
/// synced towards.
///
/// The pivot itself lives in the tree metadata so it survives restarts.
/// This cache also tracks the header the bodies stage processes up to.
pub struct BeaconPivot {
    tree: Arc<BlockTree>,
    current: RwLock<Option<BlockHeader>>,
    process_destination: RwLock<Option<BlockHeader>>,
}

impl BeaconPivot {
    /// Restores a persisted pivot from `tree`.
    pub fn new(tree: Arc<BlockTree>) -> Result<Self, BlockTreeError> {
        let current = match tree.beacon_pivot()? {
            Some(pivot) => {
                let header =
                    tree.find_header(&pivot.hash, LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)?;
                if header.is_none() {
                    warn!(number = pivot.number, hash = %pivot.hash, "Persisted pivot header is missing");
                }
                header
            }
            None => None,
        };
        if let Some(header) = &current {
            info!(number = header.number, hash = %header.hash(), "Restored beacon pivot");
        }

        Ok(Self {
            tree,
            process_destination: RwLock::new(current.clone()),
            current: RwLock::new(current),
        })
    }

    /// Records `header` as the pivot unless one exists and
    /// `update_if_exists` is not set.
    pub fn ensure_pivot(
        &self,
        header: &BlockHeader,
        update_if_exists: bool,
    ) -> Result<(), BlockTreeError> {
        let mut current = self.current.write();
        if let Some(existing) = current.as_ref() {
            if !update_if_exists || existing.hash() == header.hash() {
                return Ok(());
            }
        }

        self.tree.set_beacon_pivot(Checkpoint::from(header))?;
        *current = Some(header.clone());
        *self.process_destination.write() = Some(header.clone());
        info!(number = header.number, hash = %header.hash(), "New beacon pivot");
        Ok(())
    }

    pub fn remove_beacon_pivot(&self) -> Result<(), BlockTreeError> {
        let mut current = self.current.write();
        self.tree.remove_beacon_pivot()?;
        if let Some(header) = current.take() {
            info!(number = header.number, "Removed beacon pivot");
        }
        *self.process_destination.write() = None;
        Ok(())
    }

    pub fn beacon_pivot_exists(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn pivot_header(&self) -> Option<BlockHeader> {
        self.current.read().clone()
    }

    /// Zero without a pivot.
    pub fn pivot_number(&self) -> BlockNumber {
        self.current.read().as_ref().map_or(0, |header| header.number)
    }

    pub fn pivot_hash(&self) -> Option<Hash256> {
        self.current.read().as_ref().map(BlockHeader::hash)
    }

    pub fn pivot_parent_hash(&self) -> Option<Hash256> {
        self.current.read().as_ref().map(|header| header.parent_hash)
    }

    /// Lowest number the header stage has to reach: right above the best
    /// classical header.
    pub fn pivot_destination_number(&self) -> BlockNumber {
        if !self.beacon_pivot_exists() {
            return 0;
        }
        self.tree
            .best_suggested_header()
            .map_or(0, |header| header.number + 1)
    }

    pub fn process_destination(&self) -> Option<BlockHeader> {
        self.process_destination.read().clone()
    }

    pub fn set_process_destination(&self, header: Option<BlockHeader>) {
        *self.process_destination.write() = header;
    }
}
