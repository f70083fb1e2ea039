//! Integration tests for the paged KV cache.

use paged_decode::cache::block::MemoryTier;
use paged_decode::cache::{CacheError, KvCacheManager};
use paged_decode::config::KvCacheConfig;

fn small_config() -> KvCacheConfig {
    KvCacheConfig {
        blocks_in_primary_pool: 3,
        blocks_in_secondary_pool: 0,
        tokens_per_block: 4,
        max_attention_window: 64,
        sink_token_length: 0,
        enable_block_reuse: true,
        num_kv_heads: 1,
        size_per_head: 2,
        ..Default::default()
    }
}

#[test]
fn test_refcount_conservation() {
    // Property: after every sequence is removed, every block is free again,
    // whatever the interleaving of admits, token growth, and removals.
    let cfg = KvCacheConfig {
        blocks_in_primary_pool: 16,
        blocks_in_secondary_pool: 4,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 4, 2);
    let max = mgr.block_manager().get_max_num_blocks();

    mgr.add_sequence(0, &[1, 2, 3, 4, 5], 1).unwrap();
    mgr.add_sequence(1, &[1, 2, 3, 4], 1).unwrap();
    mgr.add_sequence(2, &[9, 9], 2).unwrap();

    for _ in 0..6 {
        mgr.add_token(0).unwrap();
        mgr.add_token(2).unwrap();
    }
    mgr.remove_token(0).unwrap();
    mgr.rewind_kv_cache(2, 3).unwrap();

    mgr.remove_sequence(1, Some(&[1, 2, 3, 4])).unwrap();
    mgr.remove_sequence(0, None).unwrap();
    mgr.remove_sequence(2, None).unwrap();

    assert_eq!(mgr.get_num_free_blocks(), max);
}

#[test]
fn test_prefix_reuse_prepopulates_second_request() {
    // Two requests sharing a prompt of length >= tokens_per_block: the
    // second gets at least the full-block prefix from the tree, and no
    // extra prompt blocks are allocated for it.
    let cfg = KvCacheConfig {
        blocks_in_primary_pool: 8,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 2, 1);

    let prompt = [1, 2, 3, 4]; // exactly one full block
    mgr.add_sequence(0, &prompt, 1).unwrap();
    let free_before_store = mgr.get_num_free_blocks();
    mgr.remove_sequence(0, Some(&prompt)).unwrap();

    let matched = mgr.add_sequence(1, &prompt, 1).unwrap();
    assert_eq!(matched, 4);
    assert_eq!(mgr.sequence(1).unwrap().num_prepopulated_tokens[0], 4);
    // The reused block came out of the tree, not the allocator.
    assert_eq!(mgr.get_num_free_blocks(), free_before_store);
}

#[test]
fn test_freed_blocks_are_recycled_front_of_queue() {
    // Pool of 3: R1 takes two blocks, R2 one. Freeing R1 leaves its blocks
    // at the front of the queue, so R3's allocation picks them up without
    // touching the secondary tier.
    let cfg = KvCacheConfig {
        blocks_in_secondary_pool: 2,
        enable_block_reuse: false,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 3, 1);

    mgr.add_sequence(0, &[1, 2, 3, 4, 5, 6, 7, 8], 1).unwrap();
    let r1_blocks: Vec<usize> = mgr.sequence(0).unwrap().block_ids[0].clone();
    mgr.add_sequence(1, &[9, 9, 9], 1).unwrap();

    mgr.remove_sequence(0, None).unwrap();
    mgr.add_sequence(2, &[5, 5, 5, 5, 5, 5], 1).unwrap();

    let r3 = mgr.sequence(2).unwrap();
    for &idx in &r3.block_ids[0] {
        assert_eq!(mgr.block_manager().block(idx).tier, MemoryTier::Primary);
        assert!(r1_blocks.contains(&idx), "expected R1's freed blocks first");
    }
}

#[test]
fn test_cyclic_window_stabilizes_blocks_and_sink() {
    // maxAttentionWindow=8, sink=4, 16 generated tokens: the block count
    // settles at (sink + window) / tokens_per_block and sink positions
    // never remap.
    let cfg = KvCacheConfig {
        blocks_in_primary_pool: 8,
        max_attention_window: 8,
        sink_token_length: 4,
        enable_block_reuse: false,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 1, 1);
    mgr.add_sequence(0, &[1, 2, 3, 4], 1).unwrap();

    for _ in 0..16 {
        mgr.add_token(0).unwrap();
    }

    assert_eq!(mgr.sequence(0).unwrap().blocks_per_beam(), (4 + 8) / 4);
    for t in 0..4 {
        assert_eq!(mgr.cache_position(t), t, "sink token {t} must stay pinned");
    }
    // Positions past capacity wrap into the window, never the sink.
    for t in 12..20 {
        assert!(mgr.cache_position(t) >= 4);
        assert!(mgr.cache_position(t) < 12);
    }
}

#[test]
fn test_sink_bubble_block_alignment_boundary() {
    // Block-aligned sink: no bubble, capacity is exactly sink + window.
    let aligned = KvCacheConfig {
        max_attention_window: 8,
        sink_token_length: 4,
        ..small_config()
    };
    assert_eq!(aligned.sink_bubble_length(), 0);
    let mgr = KvCacheManager::new(&aligned, 1, 1);
    assert_eq!(mgr.max_blocks_per_seq(), 3);

    // Misaligned sink: the bubble pads it to the next block boundary.
    let misaligned = KvCacheConfig {
        sink_token_length: 5,
        ..aligned
    };
    assert_eq!(misaligned.sink_bubble_length(), 3);
    let mgr = KvCacheManager::new(&misaligned, 1, 1);
    assert_eq!(mgr.max_blocks_per_seq(), 4);
}

#[test]
fn test_live_blocks_stay_primary_resident() {
    // The secondary tier extends cache retention, never live capacity:
    // every block backing an active sequence is primary-resident and every
    // published offset lies within the primary pool.
    let cfg = KvCacheConfig {
        blocks_in_primary_pool: 2,
        blocks_in_secondary_pool: 2,
        enable_block_reuse: false,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 2, 1);
    mgr.add_sequence(0, &[1, 2, 3, 4, 5], 1).unwrap();

    let tiers: Vec<MemoryTier> = mgr.sequence(0).unwrap().block_ids[0]
        .iter()
        .map(|&i| mgr.block_manager().block(i).tier)
        .collect();
    assert_eq!(tiers, vec![MemoryTier::Primary, MemoryTier::Primary]);

    let mbps = mgr.max_blocks_per_seq();
    let mut dst = vec![-1i64; 2 * mbps];
    mgr.copy_block_pointers(&mut dst, 0, 0, 1).unwrap();
    let pool = mgr.block_manager().pool();
    let primary_elems = (pool.blocks_in(MemoryTier::Primary) * pool.block_elems()) as i64;
    for &off in &dst {
        assert!(
            off < primary_elems,
            "offset {off} points outside the primary pool"
        );
    }

    // With every primary slab pinned, secondary space alone cannot admit
    // another request.
    let err = mgr.add_sequence(1, &[5, 6, 7, 8], 1).unwrap_err();
    assert!(matches!(err, CacheError::OutOfCache { .. }));
}

#[test]
fn test_out_of_cache_propagates() {
    let cfg = KvCacheConfig {
        blocks_in_primary_pool: 1,
        blocks_in_secondary_pool: 0,
        enable_block_reuse: false,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 2, 1);
    mgr.add_sequence(0, &[1, 2, 3, 4], 1).unwrap();

    let err = mgr.add_sequence(1, &[5, 6, 7, 8], 1).unwrap_err();
    assert!(err.to_string().contains("out of KV cache blocks"));
}

#[test]
fn test_scheduling_release_is_dry_run() {
    let cfg = KvCacheConfig {
        blocks_in_primary_pool: 4,
        enable_block_reuse: false,
        ..small_config()
    };
    let mut mgr = KvCacheManager::new(&cfg, 1, 1);
    mgr.add_sequence(0, &[1, 2, 3, 4, 5, 6], 1).unwrap();

    assert_eq!(mgr.get_num_free_blocks(), 2);
    assert_eq!(mgr.get_num_scheduled_free_blocks(), 2);

    mgr.scheduling_release_blocks(0).unwrap();
    // The forecast sees all blocks free; real state is untouched.
    assert_eq!(mgr.get_num_scheduled_free_blocks(), 4);
    assert_eq!(mgr.get_num_free_blocks(), 2);
    assert_eq!(mgr.sequence(0).unwrap().blocks_per_beam(), 2);
}
