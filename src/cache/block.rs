//! KV block arena entries and free-queue management.
//!
//! A KV block holds a fixed number of token KV pairs for all heads of one
//! layer, replicated logically across layers via a shared pool. Blocks are
//! created once at startup and reassigned across requests; everything else
//! in the cache refers to them by arena index.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::TokenId;

/// Arena index of a block. Blocks never move; indices are stable for the
/// life of the manager.
pub type BlockIdx = usize;

/// Which memory pool a block's data currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    /// Fast pool, directly addressable by attention.
    Primary,
    /// Slow pool; blocks are onboarded to primary before compute.
    Secondary,
}

impl MemoryTier {
    /// Numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            MemoryTier::Primary => 0,
            MemoryTier::Secondary => 1,
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::Primary => write!(f, "primary"),
            MemoryTier::Secondary => write!(f, "secondary"),
        }
    }
}

/// A single KV cache block.
///
/// Reusable blocks participate in a token-keyed prefix tree: `children`
/// holds the forward links (token window → block), `prev` the back-reference
/// used only to unlink on eviction. The tree is acyclic; every root-to-node
/// path spells the token sequence that keys it.
#[derive(Debug)]
pub struct KvCacheBlock {
    /// This block's own arena index.
    pub idx: BlockIdx,

    /// Block slot within its tier's pool.
    pub pool_offset: usize,

    /// Which pool `pool_offset` indexes.
    pub tier: MemoryTier,

    /// Number of (sequence, beam) attachments. Zero iff the block sits in a
    /// free queue.
    pub ref_count: u32,

    /// Dry-run attachment count mirrored for the external scheduler.
    pub scheduling_ref_count: u32,

    /// Token window keying this block in the prefix tree. Empty when the
    /// block is not cached for reuse.
    pub tokens: Vec<TokenId>,

    /// Parent in the prefix tree (lookup only, never ownership).
    pub prev: Option<BlockIdx>,

    /// Children keyed by their token windows.
    pub children: HashMap<Vec<TokenId>, BlockIdx>,

    /// Intrusive free-queue links.
    pub(crate) free_prev: Option<BlockIdx>,
    pub(crate) free_next: Option<BlockIdx>,
    pub(crate) in_free_queue: bool,
}

impl KvCacheBlock {
    pub fn new(idx: BlockIdx, pool_offset: usize, tier: MemoryTier) -> Self {
        Self {
            idx,
            pool_offset,
            tier,
            ref_count: 0,
            scheduling_ref_count: 0,
            tokens: Vec::new(),
            prev: None,
            children: HashMap::new(),
            free_prev: None,
            free_next: None,
            in_free_queue: false,
        }
    }

    /// Whether the block holds a full token window and is eligible for
    /// reuse via the prefix tree.
    pub fn is_full(&self, tokens_per_block: usize) -> bool {
        self.tokens.len() == tokens_per_block
    }

    /// Whether any sequence currently holds this block.
    pub fn has_refs(&self) -> bool {
        self.ref_count > 0
    }

    /// Whether the block is a prefix-tree leaf.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the block participates in the prefix tree.
    pub fn is_cached(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// Intrusive doubly-linked free queue over arena indices.
///
/// Front = evict-first, back = keep-longer. Supports O(1) removal from the
/// middle, which happens whenever a cached free block is re-claimed through
/// the prefix tree.
#[derive(Debug, Default)]
pub struct FreeQueue {
    head: Option<BlockIdx>,
    tail: Option<BlockIdx>,
    len: usize,
}

impl FreeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<BlockIdx> {
        self.head
    }

    pub fn push_back(&mut self, arena: &mut [KvCacheBlock], idx: BlockIdx) {
        let block = &mut arena[idx];
        assert!(!block.in_free_queue, "block {idx} already in a free queue");
        block.in_free_queue = true;
        block.free_prev = self.tail;
        block.free_next = None;
        match self.tail {
            Some(t) => arena[t].free_next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    pub fn push_front(&mut self, arena: &mut [KvCacheBlock], idx: BlockIdx) {
        let block = &mut arena[idx];
        assert!(!block.in_free_queue, "block {idx} already in a free queue");
        block.in_free_queue = true;
        block.free_prev = None;
        block.free_next = self.head;
        match self.head {
            Some(h) => arena[h].free_prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    pub fn pop_front(&mut self, arena: &mut [KvCacheBlock]) -> Option<BlockIdx> {
        let idx = self.head?;
        self.unlink(arena, idx);
        Some(idx)
    }

    /// Remove a block from anywhere in the queue.
    pub fn unlink(&mut self, arena: &mut [KvCacheBlock], idx: BlockIdx) {
        let (prev, next) = {
            let block = &mut arena[idx];
            assert!(block.in_free_queue, "block {idx} not in a free queue");
            block.in_free_queue = false;
            let links = (block.free_prev, block.free_next);
            block.free_prev = None;
            block.free_next = None;
            links
        };
        match prev {
            Some(p) => arena[p].free_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena[n].free_prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Iterate indices front-to-back.
    pub fn iter<'a>(&self, arena: &'a [KvCacheBlock]) -> FreeQueueIter<'a> {
        FreeQueueIter {
            arena,
            cur: self.head,
        }
    }
}

pub struct FreeQueueIter<'a> {
    arena: &'a [KvCacheBlock],
    cur: Option<BlockIdx>,
}

impl Iterator for FreeQueueIter<'_> {
    type Item = BlockIdx;

    fn next(&mut self) -> Option<BlockIdx> {
        let idx = self.cur?;
        self.cur = self.arena[idx].free_next;
        Some(idx)
    }
}
