use crate::peer::{PeerId, PeerInfo, SyncPeer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use block_tree::BlockTree;
use containers::{BlockBody, BlockHeader, BlockNumber, Hash256, LookupOptions};
use std::sync::Arc;

/// A peer answering from a local block tree. Total difficulties are
/// stripped from served headers, as they are not part of the wire format.
pub struct TreeBackedSyncPeer {
    tree: Arc<BlockTree>,
}

impl TreeBackedSyncPeer {
    pub fn new(tree: Arc<BlockTree>) -> Self {
        Self { tree }
    }

    /// Advertised status of this peer under `id`.
    pub fn peer_info(self: &Arc<Self>, id: PeerId) -> PeerInfo {
        let head = self.tree.head();
        PeerInfo {
            id,
            head_number: head.as_ref().map_or(0, |head| head.number()),
            head_hash: head.as_ref().map(|head| head.hash()).unwrap_or_default(),
            total_difficulty: head
                .as_ref()
                .and_then(|head| head.total_difficulty())
                .unwrap_or_default(),
            peer: self.clone(),
        }
    }
}

#[async_trait]
impl SyncPeer for TreeBackedSyncPeer {
    async fn get_block_headers(
        &self,
        start: BlockNumber,
        count: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>> {
        let step = skip as u64 + 1;
        let mut headers = Vec::with_capacity(count);
        let mut number = Some(start);
        while let Some(current) = number.filter(|_| headers.len() < count) {
            let header = self
                .tree
                .find_header_by_number(current, LookupOptions::REQUIRE_CANONICAL)
                .with_context(|| format!("failed to read header {current}"))?;
            let Some(header) = header else {
                break;
            };
            headers.push(header.with_total_difficulty(None));
            number = if reverse {
                current.checked_sub(step)
            } else {
                current.checked_add(step)
            };
        }
        Ok(headers)
    }

    async fn get_block_bodies(&self, hashes: &[Hash256]) -> Result<Vec<Option<BlockBody>>> {
        hashes
            .iter()
            .map(|hash| {
                let block = self
                    .tree
                    .find_block(hash, LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)
                    .with_context(|| format!("failed to read block {hash}"))?;
                Ok(block.map(|block| block.body))
            })
            .collect()
    }
}
