//! Bounded rolling buffer of recent block headers

use alloy_primitives::B256;
use std::collections::VecDeque;

use ecoho_core::{BlockHeader, DEFAULT_BLOCK_CAPACITY};

/// Newest-first headers, oldest evicted past `capacity`.
///
/// Headers are kept in arrival order. A header whose hash is already
/// buffered is dropped, so each hash occupies at most one slot.
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    blocks: VecDeque<BlockHeader>,
    capacity: usize,
}

impl BlockBuffer {
    /// Zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            blocks: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Prepend `header`. Returns false, leaving the buffer untouched, when
    /// its hash is already present.
    pub fn push(&mut self, header: BlockHeader) -> bool {
        if self.contains_hash(&header.hash) {
            return false;
        }
        self.blocks.push_front(header);
        self.blocks.truncate(self.capacity);
        true
    }

    pub fn latest(&self) -> Option<&BlockHeader> {
        self.blocks.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockHeader> {
        self.blocks.iter()
    }

    pub fn contains_hash(&self, hash: &B256) -> bool {
        self.blocks.iter().any(|b| &b.hash == hash)
    }

    pub fn to_vec(&self) -> Vec<BlockHeader> {
        self.blocks.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BlockBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_CAPACITY)
    }
}
