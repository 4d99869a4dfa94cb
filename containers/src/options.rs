use crate::flags;

flags! {
    /// Controls how `BlockTree::insert` records a header.
    pub struct InsertHeaderOptions: u8 {
        /// Leave the total difficulty unknown when it cannot be taken from the header.
        const TOTAL_DIFFICULTY_NOT_NEEDED = 1;
        /// Record the block without claiming the main chain slot at its level.
        const NOT_ON_MAIN_CHAIN = 2;
        const BEACON_HEADER_METADATA = 4;
        const BEACON_BODY_METADATA = 8;
        const MOVE_TO_BEACON_MAIN_CHAIN = 16;

        const BEACON_HEADER_INSERT = Self::BEACON_HEADER_METADATA.bits()
            | Self::TOTAL_DIFFICULTY_NOT_NEEDED.bits()
            | Self::NOT_ON_MAIN_CHAIN.bits();
        const BEACON_BLOCK_INSERT = Self::BEACON_HEADER_INSERT.bits()
            | Self::BEACON_BODY_METADATA.bits();
    }
}

flags! {
    pub struct InsertBlockOptions: u8 {
        /// Persist the header bytes alongside the block bytes.
        const SAVE_HEADER = 1;
    }
}

flags! {
    /// Controls `BlockTree::suggest_block`.
    pub struct SuggestOptions: u8 {
        /// Announce the block for processing and move the best suggested body.
        const SHOULD_PROCESS = 1;
        /// Accept a block whose parent total difficulty is unknown.
        const FILL_BEACON_BLOCK = 2;
        /// Skip the fork choice comparison and claim the main chain slot.
        const FORCE_SET_AS_MAIN = 4;
    }
}

flags! {
    /// Controls `BlockTree::find_header` and `BlockTree::find_block`.
    pub struct LookupOptions: u8 {
        const TOTAL_DIFFICULTY_NOT_NEEDED = 1;
        const REQUIRE_CANONICAL = 2;
        const DO_NOT_CREATE_LEVEL_IF_MISSING = 4;
    }
}

/// Outcome of an insert or suggest call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddBlockResult {
    Added,
    AlreadyKnown,
    InvalidBlock,
}
