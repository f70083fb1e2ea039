//! BlockManager: paged KV allocator with prefix reuse.
//!
//! Allocates, frees, and reuses fixed-size KV blocks for concurrent
//! sequences with per-request beams. Full blocks released by a request are
//! stored in a token-keyed prefix tree so later requests with a common
//! prompt can skip recomputation. Eviction prefers blocks least likely to
//! be reused next: the free queue is ordered evict-first at the front, and
//! only prefix-tree leaves are ever detached.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::block::{BlockIdx, FreeQueue, KvCacheBlock, MemoryTier};
use crate::cache::pool::BlockPool;
use crate::cache::sequence::GenerationRequest;
use crate::config::KvCacheConfig;
use crate::TokenId;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of KV cache blocks: need {needed}, free primary {free_primary}, free secondary {free_secondary}")]
    OutOfCache {
        needed: usize,
        free_primary: usize,
        free_secondary: usize,
    },

    #[error("batch slot {slot} out of range (max {max})")]
    MaxBatchExceeded { slot: usize, max: usize },

    #[error("no sequence registered at slot {0}")]
    SlotNotFound(usize),

    #[error("slot {0} already has a sequence")]
    SlotInUse(usize),

    #[error("beam width {got} exceeds maximum {max}")]
    BeamWidthExceeded { got: usize, max: usize },
}

/// The paged allocator. Exclusively owns every block and both pools;
/// sequences hold arena indices only.
pub struct BlockManager {
    blocks: Vec<KvCacheBlock>,
    free_primary: FreeQueue,
    free_secondary: FreeQueue,

    /// Prefix-tree root: token window of a sequence's first full block →
    /// block index. Deeper levels live in each block's `children`.
    root_children: HashMap<Vec<TokenId>, BlockIdx>,

    pool: BlockPool,
    tokens_per_block: usize,
    enable_reuse: bool,
    onboard_blocks: bool,
}

impl BlockManager {
    pub fn new(config: &KvCacheConfig) -> Self {
        let total = config.blocks_in_primary_pool + config.blocks_in_secondary_pool;
        let mut blocks = Vec::with_capacity(total);
        let mut free_primary = FreeQueue::new();
        let mut free_secondary = FreeQueue::new();

        for i in 0..config.blocks_in_primary_pool {
            blocks.push(KvCacheBlock::new(i, i, MemoryTier::Primary));
        }
        for i in 0..config.blocks_in_secondary_pool {
            blocks.push(KvCacheBlock::new(
                config.blocks_in_primary_pool + i,
                i,
                MemoryTier::Secondary,
            ));
        }
        for i in 0..config.blocks_in_primary_pool {
            free_primary.push_back(&mut blocks, i);
        }
        for i in config.blocks_in_primary_pool..total {
            free_secondary.push_back(&mut blocks, i);
        }

        info!(
            blocks_primary = config.blocks_in_primary_pool,
            blocks_secondary = config.blocks_in_secondary_pool,
            tokens_per_block = config.tokens_per_block,
            reuse = config.enable_block_reuse,
            "BlockManager initialized"
        );

        Self {
            blocks,
            free_primary,
            free_secondary,
            root_children: HashMap::new(),
            pool: BlockPool::new(config),
            tokens_per_block: config.tokens_per_block,
            enable_reuse: config.enable_block_reuse,
            onboard_blocks: config.onboard_blocks,
        }
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn reuse_enabled(&self) -> bool {
        self.enable_reuse
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn block(&self, idx: BlockIdx) -> &KvCacheBlock {
        &self.blocks[idx]
    }

    pub fn get_num_free_blocks(&self) -> usize {
        self.free_primary.len() + self.free_secondary.len()
    }

    pub fn get_max_num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Free blocks from the scheduler's dry-run perspective: real frees
    /// plus blocks whose scheduling refcount has been released.
    pub fn get_num_scheduled_free_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.scheduling_ref_count == 0)
            .count()
    }

    // ---- sequence admission ------------------------------------------------

    /// Admit a width-1 sequence with prefix reuse: walk the prefix tree over
    /// successive full-block windows of `prompt`, claim every match, then
    /// fill the remainder with fresh blocks. Returns the number of prompt
    /// tokens satisfied from the tree.
    pub fn add_sequence(
        &mut self,
        seq: &mut GenerationRequest,
        prompt: &[TokenId],
    ) -> Result<usize, CacheError> {
        assert_eq!(seq.beam_width, 1, "prefix reuse requires beam width 1");
        let tpb = self.tokens_per_block;

        let mut matched = 0;
        let mut parent: Option<BlockIdx> = None;
        if self.enable_reuse {
            for window in prompt.chunks_exact(tpb) {
                let Some(child) = self.child_of(parent, window) else {
                    break;
                };
                if self.blocks[child].tier == MemoryTier::Secondary && !self.onboard_blocks {
                    break;
                }
                self.claim_block(child);
                if !self.onboard_block(child) {
                    // No primary slab to vacate; the match is unusable.
                    self.release_block(child, false);
                    break;
                }
                seq.push_block(0, child);
                matched += tpb;
                parent = Some(child);
            }
        }
        seq.num_prepopulated_tokens[0] = matched;

        let remainder = prompt.len() - matched;
        let fresh = remainder.div_ceil(tpb);
        for _ in 0..fresh {
            match self.get_free_block() {
                Ok(idx) => {
                    self.claim_block(idx);
                    seq.push_block(0, idx);
                }
                Err(e) => {
                    self.rollback_sequence(seq);
                    return Err(e);
                }
            }
        }

        debug!(
            slot = seq.seq_slot,
            prompt_len = prompt.len(),
            matched,
            fresh,
            "Admitted sequence"
        );
        Ok(matched)
    }

    /// Non-reuse admission: `num_blocks` context blocks shared across all
    /// beams, except the block at `unshared_block_idx` which every beam gets
    /// its own copy of (the beam-fork point). `unshared_block_idx ==
    /// num_blocks` means the fork falls on a later allocation.
    pub fn add_sequence_unshared(
        &mut self,
        seq: &mut GenerationRequest,
        num_blocks: usize,
        unshared_block_idx: usize,
    ) -> Result<(), CacheError> {
        for i in 0..num_blocks {
            let result = if i == unshared_block_idx && seq.beam_width > 1 {
                self.allocate_block(seq, false)
            } else {
                self.allocate_block(seq, true)
            };
            if let Err(e) = result {
                self.rollback_sequence(seq);
                return Err(e);
            }
        }
        debug!(
            slot = seq.seq_slot,
            num_blocks,
            unshared_block_idx,
            beam_width = seq.beam_width,
            "Admitted sequence (unshared path)"
        );
        Ok(())
    }

    /// Append one block to each beam, or one block shared across beams.
    pub fn allocate_block(
        &mut self,
        seq: &mut GenerationRequest,
        share_among_beams: bool,
    ) -> Result<(), CacheError> {
        if share_among_beams {
            let idx = self.get_free_block()?;
            for _ in 0..seq.beam_width {
                self.claim_block(idx);
            }
            seq.push_shared_block(idx);
        } else {
            for beam in 0..seq.beam_width {
                let idx = self.get_free_block()?;
                self.claim_block(idx);
                seq.push_block(beam, idx);
            }
        }
        Ok(())
    }

    // ---- release -----------------------------------------------------------

    /// Release every block of a sequence. When reuse is enabled and the
    /// request's final token history is provided, full beam-0 blocks are
    /// first stored into the prefix tree (the block is *kept*, not freed for
    /// real: it sits in the free queue but stays reusable until evicted).
    pub fn release_blocks(
        &mut self,
        seq: &mut GenerationRequest,
        final_tokens: Option<&[TokenId]>,
    ) {
        if self.enable_reuse && seq.beam_width == 1 {
            if let Some(tokens) = final_tokens {
                self.store_blocks(seq, tokens);
            }
        }

        let lists = std::mem::take(&mut seq.block_ids);
        let mut released = 0;
        for list in &lists {
            for &idx in list {
                let to_front = !self.blocks[idx].is_cached();
                self.release_block(idx, to_front);
                released += 1;
            }
        }
        seq.block_ids = vec![Vec::new(); seq.beam_width];

        debug!(slot = seq.seq_slot, released, "Released sequence blocks");
    }

    /// Insert a sequence's full blocks into the prefix tree, keyed by their
    /// token windows. Existing children win ties; the duplicate block is
    /// left uncached and will be freed evict-first.
    fn store_blocks(&mut self, seq: &mut GenerationRequest, tokens: &[TokenId]) {
        let tpb = self.tokens_per_block;
        let mut parent: Option<BlockIdx> = None;
        let mut stored = 0;

        let beam0 = seq.block_ids[0].clone();
        for (i, &idx) in beam0.iter().enumerate() {
            let start = i * tpb;
            let end = start + tpb;
            if end > tokens.len() {
                break; // partial tail block, not reusable
            }
            let window = &tokens[start..end];

            if self.blocks[idx].is_cached() && self.blocks[idx].tokens == window {
                // Already in the tree (claimed via reuse at admit).
                parent = Some(idx);
                continue;
            }

            match self.child_of(parent, window) {
                Some(existing) => {
                    // A block with this key already exists: keep it, leave
                    // the new block uncached.
                    parent = Some(existing);
                }
                None => {
                    self.blocks[idx].tokens = window.to_vec();
                    self.blocks[idx].prev = parent;
                    self.insert_child(parent, window.to_vec(), idx);
                    parent = Some(idx);
                    stored += 1;
                }
            }
        }

        if stored > 0 {
            debug!(slot = seq.seq_slot, stored, "Stored blocks for reuse");
        }
    }

    /// Decrement a block's refcount; on reaching zero enqueue it in its
    /// tier's free queue (front = evict-first, back = keep-longer).
    pub fn release_block(&mut self, idx: BlockIdx, to_front: bool) {
        let block = &mut self.blocks[idx];
        assert!(block.ref_count > 0, "refcount underflow on block {idx}");
        block.ref_count -= 1;
        block.scheduling_ref_count = block.scheduling_ref_count.saturating_sub(1);

        if block.ref_count == 0 {
            let tier = block.tier;
            let queue = match tier {
                MemoryTier::Primary => &mut self.free_primary,
                MemoryTier::Secondary => &mut self.free_secondary,
            };
            if to_front {
                queue.push_front(&mut self.blocks, idx);
            } else {
                queue.push_back(&mut self.blocks, idx);
            }
        }
    }

    /// Dry-run release: decrements scheduling refcounts only, so the
    /// external scheduler can forecast capacity without touching real state.
    pub fn scheduling_release_blocks(&mut self, seq: &GenerationRequest) {
        for list in &seq.block_ids {
            for &idx in list {
                let block = &mut self.blocks[idx];
                assert!(
                    block.scheduling_ref_count > 0,
                    "scheduling refcount underflow on block {idx}"
                );
                block.scheduling_ref_count -= 1;
            }
        }
    }

    /// On beam divergence, copy a shared block's contents into fresh
    /// per-beam blocks.
    pub fn replace_shared_block(
        &mut self,
        seq: &mut GenerationRequest,
        block_pos: usize,
    ) -> Result<(), CacheError> {
        let shared = seq.block_ids[0][block_pos];
        assert!(seq.is_shared_at(block_pos), "block at {block_pos} not shared");

        for beam in 0..seq.beam_width {
            let fresh = self.get_free_block()?;
            self.claim_block(fresh);
            let (src_tier, src_off) = (self.blocks[shared].tier, self.blocks[shared].pool_offset);
            let (dst_tier, dst_off) = (self.blocks[fresh].tier, self.blocks[fresh].pool_offset);
            self.pool.copy_slab(src_tier, src_off, dst_tier, dst_off);
            seq.block_ids[beam][block_pos] = fresh;
        }
        for _ in 0..seq.beam_width {
            self.release_block(shared, true);
        }
        Ok(())
    }

    // ---- eviction & onboarding ---------------------------------------------

    /// Take a free block, evicting from the prefix tree if necessary.
    /// Blocks handed out are always primary-resident.
    ///
    /// Walks the primary free queue front-to-back and returns the first
    /// prefix-tree leaf (uncached free blocks are trivially leaves), so a
    /// cached block is only detached when nothing cheaper is free and no
    /// held descendant gets orphaned. When the primary tier has no free
    /// leaf, a free secondary leaf is onboarded into a vacated primary
    /// slab. Fails with `OutOfCache` only when neither tier can produce a
    /// primary-resident block.
    pub fn get_free_block(&mut self) -> Result<BlockIdx, CacheError> {
        if let Some(idx) = self.find_evictable(MemoryTier::Primary) {
            self.take_free_block(MemoryTier::Primary, idx);
            return Ok(idx);
        }
        // No primary leaf. Onboarding needs a primary slab to vacate;
        // demotion keeps the victim's cached data, so a non-leaf victim is
        // fine.
        if !self.free_primary.is_empty() {
            if let Some(idx) = self.find_evictable(MemoryTier::Secondary) {
                self.take_free_block(MemoryTier::Secondary, idx);
                let onboarded = self.onboard_block(idx);
                debug_assert!(onboarded, "a free primary victim was available");
                return Ok(idx);
            }
        }
        Err(CacheError::OutOfCache {
            needed: 1,
            free_primary: self.free_primary.len(),
            free_secondary: self.free_secondary.len(),
        })
    }

    /// First leaf in the tier's free queue, front-to-back.
    fn find_evictable(&self, tier: MemoryTier) -> Option<BlockIdx> {
        let queue = match tier {
            MemoryTier::Primary => &self.free_primary,
            MemoryTier::Secondary => &self.free_secondary,
        };
        queue.iter(&self.blocks).find(|&i| self.blocks[i].is_leaf())
    }

    fn take_free_block(&mut self, tier: MemoryTier, idx: BlockIdx) {
        let queue = match tier {
            MemoryTier::Primary => &mut self.free_primary,
            MemoryTier::Secondary => &mut self.free_secondary,
        };
        queue.unlink(&mut self.blocks, idx);
        if self.blocks[idx].is_cached() {
            debug!(block = idx, tier = %tier, "Evicting cached block from prefix tree");
            self.detach_from_tree(idx);
        }
    }

    /// Move a block's data from the secondary to the primary pool by
    /// swapping slabs with the primary block least likely to be reused.
    /// The demoted block keeps its data (and any prefix-tree position) in
    /// secondary. No-op on primary-resident blocks. Returns whether the
    /// block ends up primary-resident; `false` only when no primary block
    /// is free to vacate.
    pub fn onboard_block(&mut self, idx: BlockIdx) -> bool {
        if self.blocks[idx].tier == MemoryTier::Primary {
            return true;
        }
        assert!(
            !self.blocks[idx].in_free_queue,
            "onboarding block {idx} while it sits in a free queue"
        );
        let Some(victim) = self.free_primary.pop_front(&mut self.blocks) else {
            debug!(block = idx, "No free primary block to vacate");
            return false;
        };

        let primary_off = self.blocks[victim].pool_offset;
        let secondary_off = self.blocks[idx].pool_offset;
        self.pool.swap_slabs(primary_off, secondary_off);

        self.blocks[idx].pool_offset = primary_off;
        self.blocks[idx].tier = MemoryTier::Primary;
        self.blocks[victim].pool_offset = secondary_off;
        self.blocks[victim].tier = MemoryTier::Secondary;

        let to_back = self.blocks[victim].is_cached();
        if to_back {
            self.free_secondary.push_back(&mut self.blocks, victim);
        } else {
            self.free_secondary.push_front(&mut self.blocks, victim);
        }

        debug!(block = idx, demoted = victim, "Onboarded block to primary");
        true
    }

    // ---- internals ---------------------------------------------------------

    /// Attach one (sequence, beam) reference, removing the block from its
    /// free queue on the zero-to-one transition.
    fn claim_block(&mut self, idx: BlockIdx) {
        if self.blocks[idx].in_free_queue {
            debug_assert_eq!(self.blocks[idx].ref_count, 0);
            let tier = self.blocks[idx].tier;
            let queue = match tier {
                MemoryTier::Primary => &mut self.free_primary,
                MemoryTier::Secondary => &mut self.free_secondary,
            };
            queue.unlink(&mut self.blocks, idx);
        }
        let block = &mut self.blocks[idx];
        block.ref_count += 1;
        block.scheduling_ref_count += 1;
    }

    fn rollback_sequence(&mut self, seq: &mut GenerationRequest) {
        let lists = std::mem::take(&mut seq.block_ids);
        for list in &lists {
            for &idx in list {
                let to_front = !self.blocks[idx].is_cached();
                self.release_block(idx, to_front);
            }
        }
        seq.block_ids = vec![Vec::new(); seq.beam_width];
        seq.num_prepopulated_tokens = vec![0; seq.beam_width];
    }

    fn child_of(&self, parent: Option<BlockIdx>, key: &[TokenId]) -> Option<BlockIdx> {
        match parent {
            None => self.root_children.get(key).copied(),
            Some(p) => self.blocks[p].children.get(key).copied(),
        }
    }

    fn insert_child(&mut self, parent: Option<BlockIdx>, key: Vec<TokenId>, idx: BlockIdx) {
        match parent {
            None => {
                self.root_children.insert(key, idx);
            }
            Some(p) => {
                self.blocks[p].children.insert(key, idx);
            }
        }
    }

    fn detach_from_tree(&mut self, idx: BlockIdx) {
        assert!(self.blocks[idx].is_leaf(), "detaching non-leaf block {idx}");
        let key = std::mem::take(&mut self.blocks[idx].tokens);
        let parent = self.blocks[idx].prev.take();
        match parent {
            None => {
                self.root_children.remove(&key);
            }
            Some(p) => {
                self.blocks[p].children.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(primary: usize, secondary: usize) -> KvCacheConfig {
        KvCacheConfig {
            blocks_in_primary_pool: primary,
            blocks_in_secondary_pool: secondary,
            tokens_per_block: 4,
            num_kv_heads: 1,
            size_per_head: 1,
            enable_block_reuse: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_allocation_and_release() {
        let mut mgr = BlockManager::new(&test_config(4, 0));
        let mut seq = GenerationRequest::new(0, 6, 1);

        let matched = mgr.add_sequence(&mut seq, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(matched, 0);
        assert_eq!(seq.blocks_per_beam(), 2);
        assert_eq!(mgr.get_num_free_blocks(), 2);

        mgr.release_blocks(&mut seq, None);
        assert_eq!(mgr.get_num_free_blocks(), 4);
    }

    #[test]
    fn test_prefix_reuse_roundtrip() {
        let mut mgr = BlockManager::new(&test_config(4, 0));

        let prompt = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut a = GenerationRequest::new(0, prompt.len(), 1);
        mgr.add_sequence(&mut a, &prompt).unwrap();
        mgr.release_blocks(&mut a, Some(&prompt));

        // Blocks are free but cached; a matching prompt claims them back.
        assert_eq!(mgr.get_num_free_blocks(), 4);
        let mut b = GenerationRequest::new(1, prompt.len(), 1);
        let matched = mgr.add_sequence(&mut b, &prompt).unwrap();
        assert_eq!(matched, 8);
        assert_eq!(b.num_prepopulated_tokens[0], 8);
    }

    #[test]
    fn test_duplicate_store_keeps_existing_child() {
        let mut mgr = BlockManager::new(&test_config(4, 0));
        let prompt = [1, 2, 3, 4];

        let mut a = GenerationRequest::new(0, 4, 1);
        mgr.add_sequence(&mut a, &prompt).unwrap();
        let mut b = GenerationRequest::new(1, 4, 1);
        mgr.add_sequence(&mut b, &prompt).unwrap();
        // No tree entries yet, so b could not match.
        assert_eq!(b.num_prepopulated_tokens[0], 0);

        mgr.release_blocks(&mut a, Some(&prompt));
        mgr.release_blocks(&mut b, Some(&prompt));

        // Only one block may hold the [1,2,3,4] key.
        let cached = (0..4).filter(|&i| mgr.block(i).is_cached()).count();
        assert_eq!(cached, 1);
    }

    #[test]
    fn test_eviction_prefers_uncached_front() {
        let mut mgr = BlockManager::new(&test_config(3, 0));
        let prompt = [1, 2, 3, 4];

        // Cache one block, then free an uncached one to the front.
        let mut a = GenerationRequest::new(0, 4, 1);
        mgr.add_sequence(&mut a, &prompt).unwrap();
        mgr.release_blocks(&mut a, Some(&prompt)); // cached, pushed to back

        let cached_idx = (0..3).find(|&i| mgr.block(i).is_cached()).unwrap();
        let taken = mgr.get_free_block().unwrap();
        // The cached block sits at the back; an uncached block is taken first.
        assert_ne!(taken, cached_idx);
        assert!(mgr.block(cached_idx).is_cached());
        mgr.claim_block(taken);
        mgr.release_block(taken, true);
    }

    #[test]
    fn test_out_of_cache() {
        let mut mgr = BlockManager::new(&test_config(1, 0));
        let mut seq = GenerationRequest::new(0, 4, 1);
        mgr.add_sequence(&mut seq, &[1, 2, 3, 4]).unwrap();

        let err = mgr.get_free_block().unwrap_err();
        assert!(matches!(err, CacheError::OutOfCache { .. }));
    }

    #[test]
    fn test_secondary_block_onboarded_on_allocation() {
        let mut mgr = BlockManager::new(&test_config(2, 1));
        let prompt = [1, 2, 3, 4, 5, 6, 7, 8];

        // Cache a two-block chain, re-claim it, then free only the parent:
        // the parent is a free non-leaf and the child is held, so no free
        // primary leaf exists.
        let mut a = GenerationRequest::new(0, 8, 1);
        mgr.add_sequence(&mut a, &prompt).unwrap();
        mgr.release_blocks(&mut a, Some(&prompt));
        let mut b = GenerationRequest::new(1, 8, 1);
        mgr.add_sequence(&mut b, &prompt).unwrap();
        let parent = b.block_ids[0][0];
        mgr.release_block(parent, false);

        // Allocation promotes the secondary block into the parent's slab
        // and demotes the parent, data and tree position intact.
        let idx = mgr.get_free_block().unwrap();
        assert_eq!(mgr.block(idx).tier, MemoryTier::Primary);
        assert_eq!(mgr.block(parent).tier, MemoryTier::Secondary);
        assert!(mgr.block(parent).is_cached());
    }

    #[test]
    fn test_no_free_primary_slab_is_out_of_cache() {
        // Secondary capacity alone cannot back a live block: every primary
        // slab is pinned, so allocation fails even with secondary space.
        let mut mgr = BlockManager::new(&test_config(1, 1));
        let mut seq = GenerationRequest::new(0, 4, 1);
        mgr.add_sequence(&mut seq, &[1, 2, 3, 4]).unwrap();

        let err = mgr.get_free_block().unwrap_err();
        assert!(matches!(err, CacheError::OutOfCache { .. }));
    }

    #[test]
    fn test_reuse_match_onboards_secondary_block() {
        let mut mgr = BlockManager::new(&test_config(2, 1));
        let prompt = [1, 2, 3, 4, 5, 6, 7, 8];

        // Demote the cached parent: a free non-leaf parent plus a held
        // child force the next allocation to promote the secondary block
        // in its place.
        let mut a = GenerationRequest::new(0, 8, 1);
        mgr.add_sequence(&mut a, &prompt).unwrap();
        mgr.release_blocks(&mut a, Some(&prompt));
        let mut b = GenerationRequest::new(1, 8, 1);
        mgr.add_sequence(&mut b, &prompt).unwrap();
        let parent = b.block_ids[0][0];
        let child = b.block_ids[0][1];
        mgr.release_block(parent, false);
        let fresh = mgr.get_free_block().unwrap();
        assert_eq!(mgr.block(parent).tier, MemoryTier::Secondary);

        // Return everything to the free queues.
        mgr.claim_block(fresh);
        mgr.release_block(fresh, true);
        mgr.release_block(child, false);

        // A matching prompt claims the demoted parent and onboards it.
        let mut c = GenerationRequest::new(2, 8, 1);
        let matched = mgr.add_sequence(&mut c, &prompt).unwrap();
        assert_eq!(matched, 8);
        for &idx in &c.block_ids[0] {
            assert_eq!(mgr.block(idx).tier, MemoryTier::Primary);
        }
    }

    #[test]
    fn test_shared_beam_blocks_refcounted_per_beam() {
        let mut mgr = BlockManager::new(&test_config(8, 0));
        let mut seq = GenerationRequest::new(0, 4, 2);
        mgr.add_sequence_unshared(&mut seq, 1, 1).unwrap();

        let shared = seq.block_ids[0][0];
        assert_eq!(mgr.block(shared).ref_count, 2);

        mgr.replace_shared_block(&mut seq, 0).unwrap();
        assert_eq!(mgr.block(shared).ref_count, 0);
        assert!(!seq.is_shared_at(0));

        mgr.release_blocks(&mut seq, None);
        assert_eq!(mgr.get_num_free_blocks(), 8);
    }
}
