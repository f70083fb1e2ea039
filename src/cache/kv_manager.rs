//! KvCacheManager: per-request cache lifecycle over the BlockManager.
//!
//! Tracks one `GenerationRequest` per batch slot, grows and shrinks block
//! lists as tokens are added, removed, or rewound, and publishes a block
//! offset table for the attention kernels. Sequences longer than the
//! attention window wrap cyclically over their allocated blocks while the
//! sink prefix stays pinned.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::cache::manager::{BlockManager, CacheError};
use crate::cache::block::MemoryTier;
use crate::cache::sequence::GenerationRequest;
use crate::config::KvCacheConfig;
use crate::{SeqSlot, TokenId};

/// Sentinel for unused entries of the block offset table.
pub const OFFSET_NONE: i64 = -1;

pub struct KvCacheManager {
    block_manager: BlockManager,
    sequences: HashMap<SeqSlot, GenerationRequest>,

    max_num_sequences: usize,
    max_beam_width: usize,
    tokens_per_block: usize,

    sink_token_length: usize,
    sink_bubble_length: usize,
    /// Sink prefix rounded up to a block boundary.
    sink_block_tokens: usize,
    max_attention_window: usize,
    /// Cache positions available per sequence: sink blocks + window.
    max_token_num: usize,
    max_blocks_per_seq: usize,

    /// `[max_num_sequences, max_beam_width, 2, max_blocks_per_seq]` element
    /// offsets into the pools (K plane, V plane), `OFFSET_NONE` when unused.
    block_offsets: Vec<i64>,
}

impl KvCacheManager {
    pub fn new(config: &KvCacheConfig, max_num_sequences: usize, max_beam_width: usize) -> Self {
        let sink_bubble_length = config.sink_bubble_length();
        let sink_block_tokens = config.sink_token_length + sink_bubble_length;
        let max_token_num = sink_block_tokens + config.max_attention_window;
        let max_blocks_per_seq = max_token_num.div_ceil(config.tokens_per_block);

        info!(
            max_num_sequences,
            max_beam_width,
            max_token_num,
            max_blocks_per_seq,
            sink_block_tokens,
            "KvCacheManager initialized"
        );

        Self {
            block_manager: BlockManager::new(config),
            sequences: HashMap::new(),
            max_num_sequences,
            max_beam_width,
            tokens_per_block: config.tokens_per_block,
            sink_token_length: config.sink_token_length,
            sink_bubble_length,
            sink_block_tokens,
            max_attention_window: config.max_attention_window,
            max_token_num,
            max_blocks_per_seq,
            block_offsets: vec![
                OFFSET_NONE;
                max_num_sequences * max_beam_width * 2 * max_blocks_per_seq
            ],
        }
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn get_num_free_blocks(&self) -> usize {
        self.block_manager.get_num_free_blocks()
    }

    pub fn sequence(&self, slot: SeqSlot) -> Option<&GenerationRequest> {
        self.sequences.get(&slot)
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Admit a request: allocate (or reuse) blocks covering its prompt.
    /// Returns the number of prompt tokens prepopulated from the prefix
    /// tree (always 0 on the non-reuse path).
    pub fn add_sequence(
        &mut self,
        slot: SeqSlot,
        prompt: &[TokenId],
        beam_width: usize,
    ) -> Result<usize, CacheError> {
        if slot >= self.max_num_sequences {
            return Err(CacheError::MaxBatchExceeded {
                slot,
                max: self.max_num_sequences,
            });
        }
        if self.sequences.contains_key(&slot) {
            return Err(CacheError::SlotInUse(slot));
        }
        if beam_width > self.max_beam_width {
            return Err(CacheError::BeamWidthExceeded {
                got: beam_width,
                max: self.max_beam_width,
            });
        }

        let mut req = GenerationRequest::new(slot, prompt.len(), beam_width);
        let reusable = beam_width == 1
            && self.block_manager.reuse_enabled()
            && self.sink_bubble_length == 0
            && prompt.len() <= self.max_token_num;

        let matched = if reusable {
            self.block_manager.add_sequence(&mut req, prompt)?
        } else {
            let num_blocks = self.needed_blocks(prompt.len());
            let unshared = self.fork_block_index(prompt.len(), num_blocks);
            self.block_manager
                .add_sequence_unshared(&mut req, num_blocks, unshared)?;
            0
        };

        self.sequences.insert(slot, req);
        self.refresh_block_offsets(slot);
        Ok(matched)
    }

    /// Remove a request and release its blocks. `final_tokens` (prompt plus
    /// generated) enables storing full blocks for reuse; wrapped or
    /// bubble-padded sequences are never stored.
    pub fn remove_sequence(
        &mut self,
        slot: SeqSlot,
        final_tokens: Option<&[TokenId]>,
    ) -> Result<(), CacheError> {
        let mut req = self
            .sequences
            .remove(&slot)
            .ok_or(CacheError::SlotNotFound(slot))?;

        let storable = self.sink_bubble_length == 0 && req.num_tokens <= self.max_token_num;
        self.block_manager
            .release_blocks(&mut req, if storable { final_tokens } else { None });
        self.clear_block_offsets(slot);

        debug!(slot, num_tokens = req.num_tokens, "Removed sequence");
        Ok(())
    }

    /// Account one decoded token; allocates a block per beam (shared for
    /// width 1) when the tail block fills. Past the attention window the
    /// slot wraps cyclically and no further blocks are allocated.
    pub fn add_token(&mut self, slot: SeqSlot) -> Result<(), CacheError> {
        let num_tokens = {
            let req = self
                .sequences
                .get_mut(&slot)
                .ok_or(CacheError::SlotNotFound(slot))?;
            req.num_tokens += 1;
            req.num_tokens
        };

        let needed = self.needed_blocks(num_tokens);
        let req = self.sequences.get_mut(&slot).expect("checked above");
        if needed > req.blocks_per_beam() {
            let share = req.beam_width == 1;
            self.block_manager.allocate_block(req, share)?;
            self.refresh_block_offsets(slot);
        }
        Ok(())
    }

    /// Un-account the most recent token; frees the tail block when it
    /// becomes empty.
    pub fn remove_token(&mut self, slot: SeqSlot) -> Result<(), CacheError> {
        let num_tokens = {
            let req = self
                .sequences
                .get_mut(&slot)
                .ok_or(CacheError::SlotNotFound(slot))?;
            assert!(req.num_tokens > 0, "remove_token on empty sequence");

            // A wrapped slot never shrinks its ring.
            if req.num_tokens > self.max_token_num {
                req.num_tokens -= 1;
                return Ok(());
            }
            req.num_tokens -= 1;
            req.num_tokens
        };

        let needed = self.needed_blocks_inner(num_tokens);
        let req = self.sequences.get_mut(&slot).expect("checked above");
        while req.blocks_per_beam() > needed {
            for beam in 0..req.beam_width {
                let idx = req.block_ids[beam].pop().expect("beam block list empty");
                self.block_manager.release_block(idx, true);
            }
        }
        self.refresh_block_offsets(slot);
        Ok(())
    }

    /// Speculative-decoding rollback: drop the last `n` tokens.
    pub fn rewind_kv_cache(&mut self, slot: SeqSlot, n: usize) -> Result<(), CacheError> {
        for _ in 0..n {
            self.remove_token(slot)?;
        }
        debug!(slot, rewound = n, "Rewound KV cache");
        Ok(())
    }

    // ---- forecasting -------------------------------------------------------

    /// How many new blocks one more decoded token (or two, with lookahead)
    /// would require. Forecast only; no state is touched.
    pub fn get_needed_blocks_one_step(
        &self,
        slot: SeqSlot,
        two_steps_look_ahead: bool,
    ) -> Result<usize, CacheError> {
        let req = self
            .sequences
            .get(&slot)
            .ok_or(CacheError::SlotNotFound(slot))?;

        let steps = if two_steps_look_ahead { 2 } else { 1 };
        let needed = self
            .needed_blocks_inner(req.num_tokens + steps)
            .min(self.max_blocks_per_seq);
        let delta = needed.saturating_sub(req.blocks_per_beam());
        let per_step_width = if req.beam_width == 1 { 1 } else { req.beam_width };
        Ok(delta * per_step_width)
    }

    /// Dry-run release of a slot's blocks for scheduler capacity planning.
    pub fn scheduling_release_blocks(&mut self, slot: SeqSlot) -> Result<(), CacheError> {
        let req = self
            .sequences
            .get(&slot)
            .ok_or(CacheError::SlotNotFound(slot))?;
        self.block_manager.scheduling_release_blocks(req);
        Ok(())
    }

    pub fn get_num_scheduled_free_blocks(&self) -> usize {
        self.block_manager.get_num_scheduled_free_blocks()
    }

    // ---- attention interface -----------------------------------------------

    /// Publish a slot's current block offsets into `dst` at `dst_offset`,
    /// laid out `[beam, 2, max_blocks_per_seq]` (K plane, then V plane).
    /// Live blocks are always primary-resident, so every offset indexes
    /// the primary pool. Returns the maximum number of blocks written for
    /// any beam.
    pub fn copy_block_pointers(
        &self,
        dst: &mut [i64],
        dst_offset: usize,
        slot: SeqSlot,
        beam_width: usize,
    ) -> Result<usize, CacheError> {
        let req = self
            .sequences
            .get(&slot)
            .ok_or(CacheError::SlotNotFound(slot))?;

        let mut max_blocks = 0;
        for (beam, list) in req.block_ids[..beam_width.min(req.beam_width)]
            .iter()
            .enumerate()
        {
            max_blocks = max_blocks.max(list.len());
            for (pos, &idx) in list.iter().enumerate() {
                let (k_off, v_off) = self.plane_offsets(idx);
                let base = dst_offset + beam * 2 * self.max_blocks_per_seq;
                dst[base + pos] = k_off;
                dst[base + self.max_blocks_per_seq + pos] = v_off;
            }
        }
        Ok(max_blocks)
    }

    /// The internal `[slot, beam, 2, max_blocks_per_seq]` offset table,
    /// refreshed whenever a slot's block list changes.
    pub fn block_offsets(&self) -> &[i64] {
        &self.block_offsets
    }

    fn refresh_block_offsets(&mut self, slot: SeqSlot) {
        let stride = self.max_beam_width * 2 * self.max_blocks_per_seq;
        let base = slot * stride;
        self.block_offsets[base..base + stride].fill(OFFSET_NONE);

        let Some(req) = self.sequences.get(&slot) else {
            return;
        };
        let lists = req.block_ids.clone();
        let mbps = self.max_blocks_per_seq;
        for (beam, list) in lists.iter().enumerate() {
            for (pos, &idx) in list.iter().enumerate() {
                let (k_off, v_off) = self.plane_offsets(idx);
                let row = base + beam * 2 * mbps;
                self.block_offsets[row + pos] = k_off;
                self.block_offsets[row + mbps + pos] = v_off;
            }
        }
    }

    fn clear_block_offsets(&mut self, slot: SeqSlot) {
        let stride = self.max_beam_width * 2 * self.max_blocks_per_seq;
        self.block_offsets[slot * stride..(slot + 1) * stride].fill(OFFSET_NONE);
    }

    /// (K, V) element offsets of a block in the primary pool. The
    /// allocator only hands out primary-resident blocks; anything else
    /// here is an invariant violation.
    fn plane_offsets(&self, idx: usize) -> (i64, i64) {
        let block = self.block_manager.block(idx);
        assert_eq!(
            block.tier,
            MemoryTier::Primary,
            "sequence block {idx} not primary-resident"
        );
        let pool = self.block_manager.pool();
        let k = (block.pool_offset * pool.block_elems()) as i64;
        let v = k + (pool.block_elems() / 2) as i64;
        (k, v)
    }

    // ---- cyclic window -----------------------------------------------------

    /// Map a logical token position to its cache position. Sink tokens map
    /// to themselves; later positions shift past the sink bubble and wrap
    /// over the attention window once the capacity is reached.
    pub fn cache_position(&self, token_pos: usize) -> usize {
        if token_pos < self.sink_token_length {
            return token_pos;
        }
        let shifted = token_pos + self.sink_bubble_length;
        if shifted < self.max_token_num {
            shifted
        } else {
            self.sink_block_tokens + (shifted - self.sink_block_tokens) % self.max_attention_window
        }
    }

    /// Cache positions occupied by an `num_tokens`-long sequence.
    fn cache_extent(&self, num_tokens: usize) -> usize {
        let padded = if num_tokens > self.sink_token_length {
            num_tokens + self.sink_bubble_length
        } else {
            num_tokens
        };
        padded.min(self.max_token_num)
    }

    fn needed_blocks_inner(&self, num_tokens: usize) -> usize {
        self.cache_extent(num_tokens).div_ceil(self.tokens_per_block)
    }

    fn needed_blocks(&self, num_tokens: usize) -> usize {
        self.needed_blocks_inner(num_tokens)
            .min(self.max_blocks_per_seq)
    }

    /// Context block index at which beams diverge: the block holding the
    /// first generated token, or `num_blocks` when generation starts on a
    /// block boundary.
    fn fork_block_index(&self, prompt_len: usize, num_blocks: usize) -> usize {
        let pos = self.cache_position(prompt_len);
        (pos / self.tokens_per_block).min(num_blocks)
    }
}
