//! Fixed-size FP16 block pools.
//!
//! The primary pool backs attention directly; the secondary pool is the
//! slow tier blocks are demoted to and onboarded from. Both are flat `f16`
//! slabs shaped `[blocks, 2, num_kv_heads, tokens_per_block, size_per_head]`
//! and addressed by block offset.

use half::f16;
use tracing::debug;

use crate::cache::block::MemoryTier;
use crate::config::KvCacheConfig;

/// The two KV pools. Blocks never escape; the managers hand out offsets.
#[derive(Debug)]
pub struct BlockPool {
    primary: Vec<f16>,
    secondary: Vec<f16>,
    blocks_primary: usize,
    blocks_secondary: usize,
    block_elems: usize,
}

impl BlockPool {
    pub fn new(config: &KvCacheConfig) -> Self {
        let block_elems = config.block_elems();
        let primary = vec![f16::ZERO; config.blocks_in_primary_pool * block_elems];
        let secondary = vec![f16::ZERO; config.blocks_in_secondary_pool * block_elems];
        debug!(
            blocks_primary = config.blocks_in_primary_pool,
            blocks_secondary = config.blocks_in_secondary_pool,
            block_elems,
            use_uvm = config.use_uvm,
            "Allocated KV block pools"
        );
        Self {
            primary,
            secondary,
            blocks_primary: config.blocks_in_primary_pool,
            blocks_secondary: config.blocks_in_secondary_pool,
            block_elems,
        }
    }

    pub fn blocks_in(&self, tier: MemoryTier) -> usize {
        match tier {
            MemoryTier::Primary => self.blocks_primary,
            MemoryTier::Secondary => self.blocks_secondary,
        }
    }

    /// Elements per block (K and V planes together).
    pub fn block_elems(&self) -> usize {
        self.block_elems
    }

    /// Element offset of a block's K plane within its tier slab. The V
    /// plane follows at `+ block_elems / 2`.
    pub fn elem_offset(&self, pool_offset: usize) -> usize {
        pool_offset * self.block_elems
    }

    pub fn slab(&self, tier: MemoryTier, pool_offset: usize) -> &[f16] {
        let start = self.elem_offset(pool_offset);
        match tier {
            MemoryTier::Primary => &self.primary[start..start + self.block_elems],
            MemoryTier::Secondary => &self.secondary[start..start + self.block_elems],
        }
    }

    pub fn slab_mut(&mut self, tier: MemoryTier, pool_offset: usize) -> &mut [f16] {
        let start = self.elem_offset(pool_offset);
        match tier {
            MemoryTier::Primary => &mut self.primary[start..start + self.block_elems],
            MemoryTier::Secondary => &mut self.secondary[start..start + self.block_elems],
        }
    }

    /// Raw byte view of the primary pool, for the attention consumer.
    pub fn primary_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.primary)
    }

    /// Copy one block slab onto another (possibly across tiers).
    pub fn copy_slab(
        &mut self,
        src_tier: MemoryTier,
        src_offset: usize,
        dst_tier: MemoryTier,
        dst_offset: usize,
    ) {
        if src_tier == dst_tier {
            let slab = match src_tier {
                MemoryTier::Primary => &mut self.primary,
                MemoryTier::Secondary => &mut self.secondary,
            };
            let src = self.block_elems * src_offset;
            let dst = self.block_elems * dst_offset;
            slab.copy_within(src..src + self.block_elems, dst);
        } else {
            let (src_slab, dst_slab) = match src_tier {
                MemoryTier::Primary => (&self.primary, &mut self.secondary),
                MemoryTier::Secondary => (&self.secondary, &mut self.primary),
            };
            let src = self.block_elems * src_offset;
            let dst = self.block_elems * dst_offset;
            dst_slab[dst..dst + self.block_elems]
                .copy_from_slice(&src_slab[src..src + self.block_elems]);
        }
    }

    /// Swap the contents of a primary and a secondary slab. Used by
    /// onboarding: the promoted block takes the vacated primary slot and
    /// the demoted block keeps its data in secondary.
    pub fn swap_slabs(&mut self, primary_offset: usize, secondary_offset: usize) {
        let p = self.elem_offset(primary_offset);
        let s = self.elem_offset(secondary_offset);
        let n = self.block_elems;
        for i in 0..n {
            std::mem::swap(&mut self.primary[p + i], &mut self.secondary[s + i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KvCacheConfig {
        KvCacheConfig {
            blocks_in_primary_pool: 2,
            blocks_in_secondary_pool: 2,
            tokens_per_block: 4,
            num_kv_heads: 1,
            size_per_head: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_slab_shapes() {
        let pool = BlockPool::new(&test_config());
        // 2 * 1 head * 4 tokens * 2 dims
        assert_eq!(pool.block_elems(), 16);
        assert_eq!(pool.slab(MemoryTier::Primary, 1).len(), 16);
        assert_eq!(pool.primary_bytes().len(), 2 * 16 * 2);
    }

    #[test]
    fn test_copy_and_swap() {
        let mut pool = BlockPool::new(&test_config());
        pool.slab_mut(MemoryTier::Secondary, 0).fill(f16::ONE);

        pool.copy_slab(MemoryTier::Secondary, 0, MemoryTier::Primary, 1);
        assert_eq!(pool.slab(MemoryTier::Primary, 1)[0], f16::ONE);

        pool.slab_mut(MemoryTier::Primary, 0)
            .fill(f16::from_f32(2.0));
        pool.swap_slabs(0, 1);
        assert_eq!(pool.slab(MemoryTier::Secondary, 1)[0], f16::from_f32(2.0));
        assert_eq!(pool.slab(MemoryTier::Primary, 0)[0], f16::ZERO);
    }
}
