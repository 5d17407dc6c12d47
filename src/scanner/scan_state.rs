//! Scan progress and reorg tracking for one chain
//!
//! The whole state is serializable so a scanner can checkpoint it to disk
//! and resume after a restart without re-delivering its recent window.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Recent block hashes kept for reorg detection
pub const MAX_RECENT_BLOCKS: usize = 64;

/// Parent-hash mismatch waiting for an operator rescan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReorg {
    /// Height of the block whose parent did not match
    pub height: u64,
    pub expected: String,
    pub actual: String,
    /// Last height still on the new chain, when found in the recent window
    pub fork_point: Option<u64>,
}

/// Mutable state of a block scanner, guarded for a whole cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanState {
    /// Last fully delivered block
    pub last_scanned_block: Option<u64>,
    /// (height, hash), most recent at the back
    pub recent_blocks: VecDeque<(u64, String)>,
    pub pending_reorg: Option<PendingReorg>,
    /// Delivered tx ids and the height they were delivered at
    delivered: HashMap<String, u64>,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fully delivered block
    pub fn add_block(&mut self, height: u64, hash: String) {
        self.recent_blocks.push_back((height, hash));
        while self.recent_blocks.len() > MAX_RECENT_BLOCKS {
            self.recent_blocks.pop_front();
        }
        self.last_scanned_block = Some(height);
    }

    /// Hash the block at `height` must name as its parent.
    ///
    /// None when the previous height is not in the recent window.
    pub fn expected_parent_hash(&self, height: u64) -> Option<&str> {
        let parent = height.checked_sub(1)?;
        match self.recent_blocks.back() {
            Some((h, hash)) if *h == parent => Some(hash.as_str()),
            _ => None,
        }
    }

    /// Most recent height whose hash is `parent_hash`
    pub fn find_fork_point(&self, parent_hash: &str) -> Option<u64> {
        self.recent_blocks
            .iter()
            .rev()
            .find(|(_, hash)| hash == parent_hash)
            .map(|(height, _)| *height)
    }

    pub fn next_block_to_scan(&self, start_block: u64) -> u64 {
        match self.last_scanned_block {
            Some(last) => last + 1,
            None => start_block,
        }
    }

    /// Make `height` the next block scanned and drop any pending reorg
    pub fn rewind_to(&mut self, height: u64) {
        while let Some((h, _)) = self.recent_blocks.back() {
            if *h < height {
                break;
            }
            self.recent_blocks.pop_back();
        }
        self.last_scanned_block = height.checked_sub(1);
        self.pending_reorg = None;
    }

    pub fn is_delivered(&self, tx_id: &str) -> bool {
        self.delivered.contains_key(tx_id)
    }

    pub fn mark_delivered(&mut self, tx_id: &str, height: u64) {
        self.delivered.insert(tx_id.to_string(), height);
    }

    /// Forget deliveries more than `window` blocks below `height`
    pub fn prune_delivered(&mut self, height: u64, window: u64) {
        let floor = height.saturating_sub(window);
        self.delivered.retain(|_, h| *h >= floor);
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Forget all progress
    pub fn clear(&mut self) {
        self.last_scanned_block = None;
        self.recent_blocks.clear();
        self.pending_reorg = None;
        self.delivered.clear();
    }
}
