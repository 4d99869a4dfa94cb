//! Peer pool tuning constants.
//!
//! Request sizes and timeouts that operators may change live in
//! `chain::SyncConfig`; these are fixed.

/// A peer reported weak this many times is no longer allocated.
pub const WEAK_PEER_THRESHOLD: u32 = 3;

/// How long a peer that made no sync progress is skipped for the same contexts.
pub const NO_PROGRESS_SLEEP_MS: u64 = 2_000;
