//! Step inputs and outputs of the decoding pipeline.
//!
//! `DecodingInput` lives for exactly one step; `DecodingOutput` is
//! caller-owned and mutated in place every step. Both are flat tensors
//! with index helpers, sized once from the decoder domain.

use serde::{Deserialize, Serialize};

use crate::config::DecoderDomain;
use crate::decode::beam::BeamHypotheses;
use crate::decode::draft::{DraftBuffers, DraftTree};
use crate::{SeqSlot, TokenId};

/// Terminal and non-terminal finish states of one (slot, beam).
/// Terminal states are sticky until the sequence is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FinishedState {
    #[default]
    NotFinished,
    /// Sampled token equals the slot's end id.
    FinishedEos,
    /// Sequence length reached its limit.
    FinishedMaxLen,
    /// A stop-word sequence matched the tail.
    FinishedStopWords,
}

impl FinishedState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, FinishedState::NotFinished)
    }
}

/// Lifecycle stage of a batch slot inside the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotStage {
    #[default]
    Idle,
    Context,
    Generation,
    Finished,
}

/// Dense logits for one step, shaped
/// `[batch, tokens_per_step, beam, vocab_padded]`.
///
/// Built either from one packed buffer or from per-slot rows when the
/// caller cannot produce a contiguous batch.
#[derive(Debug, Clone)]
pub struct Logits {
    data: Vec<f32>,
    pub batch: usize,
    pub tokens_per_step: usize,
    pub beam: usize,
    pub vocab: usize,
}

impl Logits {
    pub fn packed(
        data: Vec<f32>,
        batch: usize,
        tokens_per_step: usize,
        beam: usize,
        vocab: usize,
    ) -> Self {
        assert_eq!(
            data.len(),
            batch * tokens_per_step * beam * vocab,
            "packed logits shape mismatch"
        );
        Self {
            data,
            batch,
            tokens_per_step,
            beam,
            vocab,
        }
    }

    /// Assemble from per-slot buffers, each `[tokens_per_step, beam, vocab]`.
    pub fn from_slot_rows(
        rows: Vec<Vec<f32>>,
        tokens_per_step: usize,
        beam: usize,
        vocab: usize,
    ) -> Self {
        let batch = rows.len();
        let per_slot = tokens_per_step * beam * vocab;
        let mut data = Vec::with_capacity(batch * per_slot);
        for row in &rows {
            assert_eq!(row.len(), per_slot, "per-slot logits shape mismatch");
            data.extend_from_slice(row);
        }
        Self {
            data,
            batch,
            tokens_per_step,
            beam,
            vocab,
        }
    }

    /// One vocab row for (dense batch index, step token, beam).
    pub fn row(&self, batch_idx: usize, token: usize, beam: usize) -> &[f32] {
        let start =
            ((batch_idx * self.tokens_per_step + token) * self.beam + beam) * self.vocab;
        &self.data[start..start + self.vocab]
    }
}

/// Per-batch-entry ragged word lists: the host rendering of the
/// pointer+length encoding attention uses on device.
#[derive(Debug, Clone, Default)]
pub struct WordLists {
    /// `[batch_entry][word][token]`
    pub words: Vec<Vec<Vec<TokenId>>>,
}

impl WordLists {
    pub fn for_entry(&self, batch_idx: usize) -> &[Vec<TokenId>] {
        self.words.get(batch_idx).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Speculative-decoding inputs for one step.
#[derive(Debug, Clone)]
pub struct DraftInputs {
    /// Drafted token ids per batch entry.
    pub draft_ids: Vec<Vec<TokenId>>,

    /// Draft-model logits per batch entry, `[draft_pos][vocab]`. Present
    /// for acceptance by logits, absent for acceptance by ids.
    pub draft_logits: Option<Vec<Vec<Vec<f32>>>>,

    /// Per-entry draft trees for tree-based (Eagle) speculation; absent
    /// for linear draft sequences.
    pub draft_trees: Option<Vec<DraftTree>>,

    /// Accept with a constant probability instead of the target/draft
    /// likelihood ratio.
    pub use_random_accept_threshold: bool,
    pub random_accept_threshold: f32,
}

/// Everything the pipeline consumes for one step.
#[derive(Debug, Clone)]
pub struct DecodingInput {
    pub step: usize,
    pub max_length: usize,
    pub batch_size: usize,

    /// Dense index → batch slot remap (values in `[0, max_batch)`).
    pub batch_slots: Vec<SeqSlot>,

    pub logits: Logits,

    /// Per slot, indexed by slot (not dense index).
    pub end_ids: Vec<TokenId>,
    pub sequence_limit_length: Vec<u32>,
    pub input_lengths: Vec<u32>,

    pub bad_words: Option<WordLists>,
    pub stop_words: Option<WordLists>,
    pub draft: Option<DraftInputs>,

    /// Beam-tied cache reindexing table `[max_batch, beam, max_len]`,
    /// forwarded to attention when beams share rewritten cache blocks.
    pub cache_indirection: Option<Vec<u32>>,
}

impl DecodingInput {
    pub fn new(
        domain: &DecoderDomain,
        step: usize,
        batch_slots: Vec<SeqSlot>,
        logits: Logits,
        end_ids: Vec<TokenId>,
    ) -> Self {
        let batch_size = batch_slots.len();
        Self {
            step,
            max_length: domain.max_seq_len,
            batch_size,
            batch_slots,
            logits,
            end_ids,
            sequence_limit_length: vec![domain.max_seq_len as u32; domain.max_batch_size],
            input_lengths: vec![0; domain.max_batch_size],
            bad_words: None,
            stop_words: None,
            draft: None,
            cache_indirection: None,
        }
    }
}

/// Everything the pipeline produces, mutated in place per step.
#[derive(Debug, Clone)]
pub struct DecodingOutput {
    pub max_batch: usize,
    pub max_beam: usize,
    pub max_seq_len: usize,
    pub max_decoding_tokens: usize,

    /// `[max_batch, max_beam, max_seq_len]`, prompt followed by generation.
    pub output_ids: Vec<TokenId>,
    /// `[max_decoding_tokens, max_batch, max_beam]`, this step's tokens.
    pub new_tokens: Vec<TokenId>,
    /// `[max_batch, max_beam]`
    pub sequence_lengths: Vec<u32>,
    pub cum_log_probs: Vec<f32>,
    /// `[max_batch, max_beam, max_seq_len]`, per-position token log-probs.
    pub log_probs: Vec<f32>,
    /// `[max_batch, max_beam, max_seq_len]`, beam search parent pointers.
    pub parent_ids: Vec<u32>,
    /// `[max_batch, max_beam]`
    pub finished: Vec<FinishedState>,
    /// `[max_batch]`, count of terminal beams per slot.
    pub finished_sum: Vec<u32>,

    /// `[max_batch]`
    pub beam_hypotheses: Vec<BeamHypotheses>,

    /// `[max_batch]`, accepted draft length (+1 corrective token) per step.
    pub accepted_lengths: Vec<u32>,
    /// Dense verification tensors packed from this step's draft trees by
    /// the draft-preparation layer (Eagle mode only).
    pub draft_buffers: Option<DraftBuffers>,
}

impl DecodingOutput {
    pub fn new(domain: &DecoderDomain) -> Self {
        let bb = domain.max_batch_size * domain.max_beam_width;
        Self {
            max_batch: domain.max_batch_size,
            max_beam: domain.max_beam_width,
            max_seq_len: domain.max_seq_len,
            max_decoding_tokens: domain.max_decoding_tokens,
            output_ids: vec![0; bb * domain.max_seq_len],
            new_tokens: vec![0; domain.max_decoding_tokens * bb],
            sequence_lengths: vec![0; bb],
            cum_log_probs: vec![0.0; bb],
            log_probs: vec![0.0; bb * domain.max_seq_len],
            parent_ids: vec![0; bb * domain.max_seq_len],
            finished: vec![FinishedState::NotFinished; bb],
            finished_sum: vec![0; domain.max_batch_size],
            beam_hypotheses: (0..domain.max_batch_size)
                .map(|_| BeamHypotheses::new(domain.max_beam_width))
                .collect(),
            accepted_lengths: vec![0; domain.max_batch_size],
            draft_buffers: None,
        }
    }

    #[inline]
    pub fn bb(&self, slot: SeqSlot, beam: usize) -> usize {
        slot * self.max_beam + beam
    }

    #[inline]
    pub fn seq_idx(&self, slot: SeqSlot, beam: usize, pos: usize) -> usize {
        (slot * self.max_beam + beam) * self.max_seq_len + pos
    }

    pub fn seq_len(&self, slot: SeqSlot, beam: usize) -> usize {
        self.sequence_lengths[self.bb(slot, beam)] as usize
    }

    pub fn token_at(&self, slot: SeqSlot, beam: usize, pos: usize) -> TokenId {
        self.output_ids[self.seq_idx(slot, beam, pos)]
    }

    /// Append one token to a beam and advance its length.
    pub fn push_token(&mut self, slot: SeqSlot, beam: usize, token: TokenId) {
        let len = self.seq_len(slot, beam);
        assert!(len < self.max_seq_len, "sequence overflow on slot {slot}");
        let idx = self.seq_idx(slot, beam, len);
        self.output_ids[idx] = token;
        let bb = self.bb(slot, beam);
        self.sequence_lengths[bb] += 1;
    }

    /// Record this step's token for (step position, slot, beam).
    pub fn set_new_token(&mut self, step_token: usize, slot: SeqSlot, beam: usize, token: TokenId) {
        let idx = step_token * self.max_batch * self.max_beam + self.bb(slot, beam);
        self.new_tokens[idx] = token;
    }

    pub fn new_token(&self, step_token: usize, slot: SeqSlot, beam: usize) -> TokenId {
        self.new_tokens[step_token * self.max_batch * self.max_beam + self.bb(slot, beam)]
    }

    /// Install a prompt into every beam of a slot and reset its per-beam
    /// decoding state. Beam 0 starts at cumulative log-prob zero; other
    /// beams start heavily penalized so the first generation step expands
    /// from beam 0 only.
    pub fn init_slot(&mut self, slot: SeqSlot, prompt: &[TokenId], beam_width: usize) {
        for beam in 0..self.max_beam {
            let bb = self.bb(slot, beam);
            for (pos, &tok) in prompt.iter().enumerate() {
                let idx = self.seq_idx(slot, beam, pos);
                self.output_ids[idx] = tok;
            }
            self.sequence_lengths[bb] = prompt.len() as u32;
            self.cum_log_probs[bb] = if beam == 0 || beam >= beam_width {
                0.0
            } else {
                -1e9
            };
            self.finished[bb] = FinishedState::NotFinished;
        }
        self.finished_sum[slot] = 0;
        self.accepted_lengths[slot] = 0;
        self.beam_hypotheses[slot].reset(prompt.len() as u32);
    }
}
