use crate::beacon_pivot::BeaconPivot;
use block_tree::{BlockTree, BlockTreeError};
use containers::{Block, BlockBody, BlockHeader, BlockInfo, BlockNumber, Hash256, LookupOptions};
use std::sync::Arc;
use tracing::trace;

/// Headers planned for a body download and the bodies resolved so far.
#[derive(Debug, Clone, Default)]
pub struct BlockDownloadContext {
    headers: Vec<BlockHeader>,
    bodies: Vec<Option<BlockBody>>,
}

impl BlockDownloadContext {
    pub fn new(headers: Vec<BlockHeader>) -> Self {
        let bodies = vec![None; headers.len()];
        Self { headers, bodies }
    }

    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn hashes(&self) -> Vec<Hash256> {
        self.headers.iter().map(BlockHeader::hash).collect()
    }

    /// Positions and hashes of headers without a body yet.
    pub fn missing(&self) -> Vec<(usize, Hash256)> {
        self.headers
            .iter()
            .zip(&self.bodies)
            .enumerate()
            .filter(|(_, (_, body))| body.is_none())
            .map(|(index, (header, _))| (index, header.hash()))
            .collect()
    }

    pub fn set_body(&mut self, index: usize, body: BlockBody) {
        if let Some(slot) = self.bodies.get_mut(index) {
            *slot = Some(body);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bodies.iter().all(Option::is_some)
    }

    /// Leading blocks whose bodies are known, in number order.
    pub fn blocks(&self) -> Vec<Block> {
        self.headers
            .iter()
            .zip(&self.bodies)
            .map_while(|(header, body)| {
                body.as_ref()
                    .map(|body| Block::new(header.clone(), body.clone()))
            })
            .collect()
    }
}

/// Plans body downloads over the beacon main chain.
pub struct ChainLevelHelper {
    tree: Arc<BlockTree>,
    pivot: Arc<BeaconPivot>,
}

impl ChainLevelHelper {
    pub fn new(tree: Arc<BlockTree>, pivot: Arc<BeaconPivot>) -> Self {
        Self { tree, pivot }
    }

    /// Beacon main chain headers starting at the highest classical block
    /// below the first beacon-only level.
    ///
    /// The first header is that anchor and is already part of the local
    /// chain. `None` when there is no beacon main chain block to start from.
    pub fn get_next_headers(
        &self,
        max_count: usize,
        max_header_number: BlockNumber,
    ) -> Result<Option<Vec<BlockHeader>>, BlockTreeError> {
        let Some(mut number) = self.starting_point()? else {
            return Ok(None);
        };

        let mut headers = Vec::with_capacity(max_count);
        while headers.len() < max_count {
            let Some(info) = self.beacon_main_chain_info(number)? else {
                break;
            };
            let Some(mut header) = self
                .tree
                .find_header(&info.block_hash, LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)?
            else {
                break;
            };
            if header.total_difficulty.is_none_or(|td| td.is_zero()) {
                header.total_difficulty = info.total_difficulty.filter(|td| !td.is_zero());
            }

            let reached = header.number >= max_header_number;
            headers.push(header);
            if reached {
                break;
            }
            number += 1;
        }

        trace!(
            from = headers.first().map(|header| header.number),
            count = headers.len(),
            "Planned next headers"
        );
        Ok(Some(headers))
    }

    /// Fills bodies of `context` from local storage.
    ///
    /// Returns `false` unless the first block was inserted with its body
    /// and every body is found locally, in which case no peer is needed.
    pub fn try_set_next_blocks(
        &self,
        max_count: usize,
        context: &mut BlockDownloadContext,
    ) -> Result<bool, BlockTreeError> {
        let Some(first) = context.headers().first() else {
            return Ok(false);
        };
        let first_has_body = self
            .beacon_main_chain_info(first.number)?
            .is_some_and(|info| info.is_beacon_body());
        if !first_has_body {
            return Ok(false);
        }

        let hashes = context.hashes();
        let chunk_size = max_count.max(1);
        for (chunk_index, chunk) in hashes.chunks(chunk_size).enumerate() {
            for (offset, hash) in chunk.iter().enumerate() {
                let Some(block) = self
                    .tree
                    .find_block(hash, LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)?
                else {
                    return Ok(false);
                };
                context.set_body(chunk_index * chunk_size + offset, block.body);
            }
        }
        Ok(true)
    }

    fn starting_point(&self) -> Result<Option<BlockNumber>, BlockTreeError> {
        let mut number = self.tree.best_known_number() + 1;
        if let Some(destination) = self.pivot.process_destination() {
            number = number.min(destination.number);
        }

        let Some(info) = self.beacon_main_chain_info(number)? else {
            return Ok(None);
        };
        if !info.is_beacon_info() {
            return Ok(Some(number));
        }

        let mut hash = info.block_hash;
        while number > 0 {
            let Some(header) = self
                .tree
                .find_header(&hash, LookupOptions::TOTAL_DIFFICULTY_NOT_NEEDED)?
            else {
                return Ok(None);
            };
            let Some(parent) = self.tree.find_block_info(number - 1, &header.parent_hash)? else {
                return Ok(None);
            };

            number -= 1;
            if !parent.is_beacon_info() {
                break;
            }
            hash = parent.block_hash;
        }
        Ok(Some(number))
    }

    fn beacon_main_chain_info(&self, number: BlockNumber) -> Result<Option<BlockInfo>, BlockTreeError> {
        Ok(self
            .tree
            .find_level(number)?
            .and_then(|level| level.beacon_main_chain_block().cloned()))
    }
}
