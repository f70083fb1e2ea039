//! Draft-tree preparation for tree-based speculative decoding.
//!
//! A draft tree proposes several continuation branches at once; the target
//! model verifies them in a single step using a packed ancestor mask per
//! token. This module extracts per-level top-K expansions from node logits
//! and packs the dense tensors (position offsets, attention masks,
//! generation lengths) from possibly sparse batch slots. [`DraftPrepLayer`]
//! runs the packing as a pipeline stage ahead of draft acceptance.

use tracing::debug;

use crate::config::{DecoderDomain, SamplingConfig};
use crate::decode::io::{DecodingInput, DecodingOutput};
use crate::decode::layer::{DecodeLayer, DecodeWorkspace};
use crate::decode::DecodeError;
use crate::{SeqSlot, TokenId};

/// One request's draft tree. Node 0 is the root (the last accepted token);
/// every path lists node indices from the root to a leaf.
#[derive(Debug, Clone)]
pub struct DraftTree {
    pub num_nodes: usize,
    pub paths: Vec<Vec<u32>>,
}

impl DraftTree {
    /// Depth of every node (root = 0), derived from the paths.
    pub fn depths(&self) -> Vec<u32> {
        let mut depths = vec![0u32; self.num_nodes];
        for path in &self.paths {
            for (d, &node) in path.iter().enumerate() {
                depths[node as usize] = d as u32;
            }
        }
        depths
    }

    /// Ancestors of a node including itself, in root-to-node order.
    pub fn ancestors(&self, node: u32) -> Vec<u32> {
        for path in &self.paths {
            if let Some(pos) = path.iter().position(|&n| n == node) {
                return path[..=pos].to_vec();
            }
        }
        vec![node]
    }
}

/// Dense per-batch tensors consumed by the tree-verification step.
#[derive(Debug, Clone)]
pub struct DraftBuffers {
    pub max_decoding_tokens: usize,
    /// `u32` words per packed mask row.
    pub mask_words: usize,
    /// `[max_batch, max_decoding_tokens]` position offset (= tree depth)
    /// of every draft token.
    pub position_offsets: Vec<i32>,
    /// `[max_batch, max_decoding_tokens, mask_words]`; bit `a` of a row
    /// marks that the token attends to draft token `a`.
    pub packed_masks: Vec<u32>,
    /// `[max_batch]` number of draft tokens per request.
    pub generation_lengths: Vec<u32>,
}

/// Top-`k` token ids of one node's logits, best first.
pub fn top_k_expansions(logits: &[f32], k: usize) -> Vec<TokenId> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(k);
    order.into_iter().map(|i| i as TokenId).collect()
}

/// Pack draft trees from sparse batch slots into dense verification
/// tensors. Masks are packed as `u32` groups of 32 tokens.
pub fn prepare_draft_buffers(
    batch_slots: &[SeqSlot],
    trees: &[DraftTree],
    max_batch: usize,
    max_decoding_tokens: usize,
) -> DraftBuffers {
    assert_eq!(batch_slots.len(), trees.len(), "one tree per batch entry");
    let mask_words = max_decoding_tokens.div_ceil(32);

    let mut buffers = DraftBuffers {
        max_decoding_tokens,
        mask_words,
        position_offsets: vec![0; max_batch * max_decoding_tokens],
        packed_masks: vec![0; max_batch * max_decoding_tokens * mask_words],
        generation_lengths: vec![0; max_batch],
    };

    for (&slot, tree) in batch_slots.iter().zip(trees) {
        assert!(
            tree.num_nodes <= max_decoding_tokens,
            "draft tree of {} nodes exceeds max decoding tokens {max_decoding_tokens}",
            tree.num_nodes
        );
        buffers.generation_lengths[slot] = tree.num_nodes as u32;

        let depths = tree.depths();
        for node in 0..tree.num_nodes as u32 {
            let row = slot * max_decoding_tokens + node as usize;
            buffers.position_offsets[row] = depths[node as usize] as i32;
            for ancestor in tree.ancestors(node) {
                let word = row * mask_words + (ancestor as usize) / 32;
                buffers.packed_masks[word] |= 1u32 << (ancestor % 32);
            }
        }
    }

    debug!(
        entries = batch_slots.len(),
        max_decoding_tokens, mask_words, "Prepared draft buffers"
    );
    buffers
}

/// Pipeline stage for tree-based speculation: packs the step's draft trees
/// into the dense verification tensors and publishes them on the outputs
/// for the attention side. Runs ahead of the acceptance layer.
pub struct DraftPrepLayer {
    max_batch: usize,
    max_decoding_tokens: usize,
}

impl DraftPrepLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            max_batch: domain.max_batch_size,
            max_decoding_tokens: domain.max_decoding_tokens,
        }
    }
}

impl DecodeLayer for DraftPrepLayer {
    fn name(&self) -> &'static str {
        "draft_prep"
    }

    fn setup(
        &mut self,
        _batch_size: usize,
        _beam_width: usize,
        _batch_slots: &[SeqSlot],
        _config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        _workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        let draft = inputs
            .draft
            .as_ref()
            .ok_or_else(|| DecodeError::InvalidArgument("missing draft inputs".into()))?;
        let trees = draft.draft_trees.as_ref().ok_or_else(|| {
            DecodeError::InvalidArgument("draft-tree mode requires draft trees".into())
        })?;

        outputs.draft_buffers = Some(prepare_draft_buffers(
            &inputs.batch_slots,
            trees,
            self.max_batch,
            self.max_decoding_tokens,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root with two children, one of which has its own child:
    /// 0 → 1 → 3, 0 → 2.
    fn tree() -> DraftTree {
        DraftTree {
            num_nodes: 4,
            paths: vec![vec![0, 1, 3], vec![0, 2]],
        }
    }

    #[test]
    fn test_depths_from_paths() {
        assert_eq!(tree().depths(), vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_top_k_expansions_ordered() {
        let logits = [0.1, 2.0, -1.0, 0.5];
        assert_eq!(top_k_expansions(&logits, 2), vec![1, 3]);
    }

    #[test]
    fn test_packed_masks_cover_ancestors() {
        let buffers = prepare_draft_buffers(&[1], &[tree()], 2, 4);

        assert_eq!(buffers.generation_lengths, vec![0, 4]);
        let row = |node: usize| buffers.packed_masks[(4 + node) * buffers.mask_words];
        // Node 0 attends to itself only.
        assert_eq!(row(0), 0b0001);
        // Node 3 attends to 0, 1, 3.
        assert_eq!(row(3), 0b1011);
        // Node 2 attends to 0, 2.
        assert_eq!(row(2), 0b0101);

        assert_eq!(buffers.position_offsets[4..8], [0, 1, 1, 2]);
    }

    #[test]
    fn test_sparse_slot_packing() {
        let small = DraftTree {
            num_nodes: 1,
            paths: vec![vec![0]],
        };
        let buffers = prepare_draft_buffers(&[3], &[small], 4, 4);
        assert_eq!(buffers.generation_lengths, vec![0, 0, 0, 1]);
        // Untouched slots stay zeroed.
        assert_eq!(buffers.packed_masks[0], 0);
    }
}
