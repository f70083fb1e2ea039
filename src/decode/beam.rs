//! Beam search: per-step beam maintenance, the candidate-beam-array of
//! finished hypotheses, and final path reconstruction.
//!
//! Beam histories are never reordered in place; each step records the
//! chosen token and its parent beam, and `gather_tree` reconstructs full
//! hypotheses by walking parent pointers back to the prompt.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{
    DecoderDomain, EarlyStopping, SamplingConfig, DEFAULT_BEAM_DIVERSITY, DEFAULT_LENGTH_PENALTY,
};
use crate::decode::io::{DecodingInput, DecodingOutput, FinishedState};
use crate::decode::layer::{DecodeLayer, DecodeWorkspace};
use crate::decode::DecodeError;
use crate::{SeqSlot, TokenId};

/// One finished hypothesis: generated tokens (end id excluded) with scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbaEntry {
    pub normed_score: f32,
    pub cum_log_prob: f32,
    pub tokens: Vec<TokenId>,
    pub log_probs: Vec<f32>,
}

/// Candidate-beam-array: per-slot set of up to `2 * beam_width` finished
/// hypotheses ranked by length-normalized score, with min-heap push
/// semantics (a full array only admits entries beating its minimum, which
/// gets replaced).
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    beam_width: usize,
    pub is_done: bool,
    pub input_length: u32,
    pub entries: Vec<CbaEntry>,
    pub min_normed_score: f32,
}

impl BeamHypotheses {
    pub fn new(beam_width: usize) -> Self {
        Self {
            beam_width,
            is_done: false,
            input_length: 0,
            entries: Vec::with_capacity(2 * beam_width),
            min_normed_score: f32::INFINITY,
        }
    }

    pub fn reset(&mut self, input_length: u32) {
        self.is_done = false;
        self.input_length = input_length;
        self.entries.clear();
        self.min_normed_score = f32::INFINITY;
    }

    pub fn num_beams(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        2 * self.beam_width
    }

    pub fn push(&mut self, entry: CbaEntry) {
        if self.entries.len() < self.capacity() {
            self.entries.push(entry);
        } else if entry.normed_score > self.min_normed_score {
            let worst = self.worst_index();
            self.entries[worst] = entry;
        } else {
            return;
        }
        self.recompute_min();
    }

    /// Entry indices ranked by normed score, best first; equal scores keep
    /// insertion order (lower beam index first).
    pub fn ranked(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|&a, &b| {
            self.entries[b]
                .normed_score
                .partial_cmp(&self.entries[a].normed_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order
    }

    fn worst_index(&self) -> usize {
        let mut worst = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.normed_score < self.entries[worst].normed_score {
                worst = i;
            }
        }
        worst
    }

    fn recompute_min(&mut self) {
        self.min_normed_score = self
            .entries
            .iter()
            .map(|e| e.normed_score)
            .fold(f32::INFINITY, f32::min);
    }
}

/// Final, reordered beam outputs: `[max_batch, max_beam, max_seq_len]`
/// with prompt prefixes included.
#[derive(Debug, Clone)]
pub struct GatheredBeams {
    pub max_beam: usize,
    pub max_seq_len: usize,
    pub output_ids: Vec<TokenId>,
    pub sequence_lengths: Vec<u32>,
    pub cum_log_probs: Vec<f32>,
    pub normed_scores: Vec<f32>,
}

impl GatheredBeams {
    pub fn beam_tokens(&self, slot: SeqSlot, beam: usize) -> &[TokenId] {
        let bb = slot * self.max_beam + beam;
        let len = self.sequence_lengths[bb] as usize;
        &self.output_ids[bb * self.max_seq_len..bb * self.max_seq_len + len]
    }
}

/// Walk parent pointers from `end_pos` back to the prompt, collecting the
/// generated tokens and their per-step log-probs for one beam.
fn backtrack(
    outputs: &DecodingOutput,
    slot: SeqSlot,
    beam: usize,
    input_len: usize,
    end_pos: usize,
) -> (Vec<TokenId>, Vec<f32>) {
    let mut tokens = Vec::with_capacity(end_pos.saturating_sub(input_len));
    let mut log_probs = Vec::with_capacity(tokens.capacity());
    let mut b = beam;
    for pos in (input_len..end_pos).rev() {
        let idx = outputs.seq_idx(slot, b, pos);
        tokens.push(outputs.output_ids[idx]);
        log_probs.push(outputs.log_probs[idx]);
        b = outputs.parent_ids[idx] as usize;
    }
    tokens.reverse();
    log_probs.reverse();
    (tokens, log_probs)
}

fn length_normalized(cum_log_prob: f32, gen_len: usize, length_penalty: f32) -> f32 {
    cum_log_prob / (gen_len.max(1) as f32).powf(length_penalty)
}

pub struct BeamSearchLayer {
    max_beam: usize,
    vocab: usize,
    beam_width: usize,

    diversity_rate: Vec<f32>,
    length_penalty: Vec<f32>,
    early_stopping: Vec<EarlyStopping>,
}

impl BeamSearchLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        let n = domain.max_batch_size;
        Self {
            max_beam: domain.max_beam_width,
            vocab: domain.vocab_size,
            beam_width: 0,
            diversity_rate: vec![DEFAULT_BEAM_DIVERSITY; n],
            length_penalty: vec![DEFAULT_LENGTH_PENALTY; n],
            early_stopping: vec![EarlyStopping::Once; n],
        }
    }

    fn slot_done(&self, hyp: &BeamHypotheses, slot: SeqSlot, best_live_cum: f32,
                 gen_len: usize, max_gen_len: usize) -> bool {
        if hyp.num_beams() < self.beam_width {
            return false;
        }
        match self.early_stopping[slot] {
            EarlyStopping::Always => true,
            EarlyStopping::Never => false,
            EarlyStopping::Once => {
                let lp = self.length_penalty[slot];
                // Best score any live beam could still attain.
                let attainable = if lp > 0.0 {
                    length_normalized(best_live_cum, max_gen_len, lp)
                } else {
                    length_normalized(best_live_cum, gen_len, lp)
                };
                attainable <= hyp.min_normed_score
            }
        }
    }
}

impl DecodeLayer for BeamSearchLayer {
    fn name(&self) -> &'static str {
        "beam_search"
    }

    fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[SeqSlot],
        config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        if beam_width < 2 || beam_width > self.max_beam {
            return Err(DecodeError::InvalidArgument(format!(
                "beam search needs beam width in [2, {}], got {beam_width}",
                self.max_beam
            )));
        }
        self.beam_width = beam_width;
        for i in 0..batch_size {
            let slot = batch_slots[i];
            self.diversity_rate[slot] = SamplingConfig::get_or(
                &config.beam_search_diversity_rate,
                i,
                DEFAULT_BEAM_DIVERSITY,
            );
            self.length_penalty[slot] =
                SamplingConfig::get_or(&config.length_penalty, i, DEFAULT_LENGTH_PENALTY);
            self.early_stopping[slot] =
                SamplingConfig::get_or(&config.early_stopping, i, EarlyStopping::Once);
        }
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        let bw = self.beam_width;
        if inputs.logits.beam != bw {
            return Err(DecodeError::InvalidArgument(format!(
                "logits carry {} beams, layer configured for {bw}",
                inputs.logits.beam
            )));
        }

        for (i, &slot) in inputs.batch_slots.iter().enumerate() {
            if outputs.beam_hypotheses[slot].is_done {
                continue;
            }
            let seq_len = outputs.seq_len(slot, 0);
            let input_len = inputs.input_lengths[slot] as usize;
            let end_id = inputs.end_ids[slot];

            // Rank (token, parent beam) pairs across all beams of the slot.
            let mut candidates: Vec<(f32, f32, usize, TokenId)> =
                Vec::with_capacity(bw * self.vocab);
            let mut old_cums = vec![0.0f32; bw];
            for (b, old_cum) in old_cums.iter_mut().enumerate() {
                let row = workspace.logits_row(i, 0, b);
                let max = row[..self.vocab]
                    .iter()
                    .copied()
                    .fold(f32::NEG_INFINITY, f32::max);
                let lse = row[..self.vocab]
                    .iter()
                    .map(|&l| (l - max).exp())
                    .sum::<f32>()
                    .ln()
                    + max;
                let cum = outputs.cum_log_probs[outputs.bb(slot, b)];
                *old_cum = cum;
                let diversity = self.diversity_rate[slot] * b as f32;
                for v in 0..self.vocab {
                    let log_p = row[v] - lse;
                    candidates.push((cum + log_p - diversity, cum + log_p, b, v as TokenId));
                }
            }
            candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

            // The top 2B candidates feed the CBA; the first B non-ended
            // ones become the next beam set.
            let mut next: Vec<(usize, TokenId, f32)> = Vec::with_capacity(bw);
            for (rank, &(_, cum, parent, token)) in candidates.iter().enumerate() {
                if token == end_id {
                    if rank < 2 * bw {
                        let gen_len = seq_len - input_len + 1;
                        // The end id itself is excluded from the stored
                        // hypothesis; its probability still counts in `cum`.
                        let (tokens, log_probs) =
                            backtrack(outputs, slot, parent, input_len, seq_len);
                        let entry = CbaEntry {
                            normed_score: length_normalized(
                                cum,
                                gen_len,
                                self.length_penalty[slot],
                            ),
                            cum_log_prob: cum,
                            tokens,
                            log_probs,
                        };
                        outputs.beam_hypotheses[slot].push(entry);
                        debug!(slot, parent, "Hypothesis finished into CBA");
                    }
                } else if next.len() < bw {
                    next.push((parent, token, cum));
                }
                if next.len() == bw && rank + 1 >= 2 * bw {
                    break;
                }
            }

            // Advance the beam set in place; histories stay unreordered.
            for (j, &(parent, token, cum)) in next.iter().enumerate() {
                let idx = outputs.seq_idx(slot, j, seq_len);
                outputs.output_ids[idx] = token;
                outputs.parent_ids[idx] = parent as u32;
                outputs.log_probs[idx] = cum - old_cums[parent];
                outputs.set_new_token(0, slot, j, token);
            }
            for (j, &(_, _, cum)) in next.iter().enumerate() {
                let bb = outputs.bb(slot, j);
                outputs.cum_log_probs[bb] = cum;
                outputs.sequence_lengths[bb] += 1;
            }

            let best_live_cum = next
                .iter()
                .map(|&(_, _, c)| c)
                .fold(f32::NEG_INFINITY, f32::max);
            let max_gen_len = inputs.max_length.saturating_sub(input_len);
            let done = self.slot_done(
                &outputs.beam_hypotheses[slot],
                slot,
                best_live_cum,
                seq_len + 1 - input_len,
                max_gen_len,
            );
            if done {
                outputs.beam_hypotheses[slot].is_done = true;
                for b in 0..bw {
                    let bb = outputs.bb(slot, b);
                    outputs.finished[bb] = FinishedState::FinishedEos;
                }
                debug!(slot, "Beam search finished early");
            }
        }
        Ok(())
    }

    fn workspace_bytes(&self, batch_size: usize, beam_width: usize) -> usize {
        // candidate list dominates
        batch_size * beam_width * self.vocab * std::mem::size_of::<(f32, f32, usize, TokenId)>()
    }
}

/// Reconstruct the final ranked hypotheses for every slot in the batch.
///
/// Still-live beams are inserted into a scratch copy of each slot's CBA, so
/// repeated calls with unchanged inputs return identical results.
pub fn gather_tree(
    outputs: &DecodingOutput,
    inputs: &DecodingInput,
    length_penalty: &[f32],
    beam_width: usize,
) -> GatheredBeams {
    let mut gathered = GatheredBeams {
        max_beam: outputs.max_beam,
        max_seq_len: outputs.max_seq_len,
        output_ids: vec![0; outputs.max_batch * outputs.max_beam * outputs.max_seq_len],
        sequence_lengths: vec![0; outputs.max_batch * outputs.max_beam],
        cum_log_probs: vec![0.0; outputs.max_batch * outputs.max_beam],
        normed_scores: vec![0.0; outputs.max_batch * outputs.max_beam],
    };

    for &slot in &inputs.batch_slots {
        let mut scratch = outputs.beam_hypotheses[slot].clone();
        let seq_len = outputs.seq_len(slot, 0);
        let input_len = inputs.input_lengths[slot] as usize;
        let lp = length_penalty[slot];

        // Insert still-live paths so slots that never finished a full CBA
        // still emit beam_width hypotheses.
        for b in 0..beam_width {
            let cum = outputs.cum_log_probs[outputs.bb(slot, b)];
            let (tokens, log_probs) = backtrack(outputs, slot, b, input_len, seq_len);
            scratch.push(CbaEntry {
                normed_score: length_normalized(cum, seq_len.saturating_sub(input_len), lp),
                cum_log_prob: cum,
                tokens,
                log_probs,
            });
        }

        let ranked = scratch.ranked();
        for (j, &e_idx) in ranked.iter().take(beam_width).enumerate() {
            let entry = &scratch.entries[e_idx];
            let bb = slot * outputs.max_beam + j;
            let base = bb * outputs.max_seq_len;
            for pos in 0..input_len {
                gathered.output_ids[base + pos] = outputs.token_at(slot, 0, pos);
            }
            for (k, &tok) in entry.tokens.iter().enumerate() {
                gathered.output_ids[base + input_len + k] = tok;
            }
            gathered.sequence_lengths[bb] = (input_len + entry.tokens.len()) as u32;
            gathered.cum_log_probs[bb] = entry.cum_log_prob;
            gathered.normed_scores[bb] = entry.normed_score;
        }
    }
    gathered
}
