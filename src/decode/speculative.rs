//! Speculative-decoding acceptance.
//!
//! Verifies externally drafted tokens against the target model, in one of
//! two modes: by ids (longest matching prefix against the target's own
//! tokens, plus one corrective token) or by logits (per-position acceptance
//! with probability `min(1, p_target / p_draft)` and residual resampling on
//! rejection). Both require beam width 1 and respect the `batch_slots`
//! remap.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{DecoderDomain, SamplingConfig};
use crate::decode::io::{DecodingInput, DecodingOutput, DraftInputs, FinishedState};
use crate::decode::layer::{softmax_into, DecodeLayer, DecodeWorkspace};
use crate::decode::DecodeError;
use crate::{SeqSlot, TokenId};

pub struct SpeculativeLayer {
    vocab: usize,
    max_decoding_tokens: usize,
    rngs: Vec<Option<StdRng>>,
}

impl SpeculativeLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            vocab: domain.vocab_size,
            max_decoding_tokens: domain.max_decoding_tokens,
            rngs: (0..domain.max_batch_size).map(|_| None).collect(),
        }
    }

    /// Greedy target tokens for each drafted position plus the bonus
    /// position, then the longest matching prefix.
    fn accept_by_ids(
        &self,
        workspace: &DecodeWorkspace,
        batch_idx: usize,
        draft_ids: &[TokenId],
    ) -> Vec<TokenId> {
        let mut accepted = Vec::with_capacity(draft_ids.len() + 1);
        for (p, &drafted) in draft_ids.iter().enumerate() {
            let target = argmax(&workspace.logits_row(batch_idx, p, 0)[..self.vocab]) as TokenId;
            if target == drafted {
                accepted.push(drafted);
            } else {
                accepted.push(target);
                return accepted;
            }
        }
        // Every draft matched: emit the bonus token from the last position.
        let bonus =
            argmax(&workspace.logits_row(batch_idx, draft_ids.len(), 0)[..self.vocab]) as TokenId;
        accepted.push(bonus);
        accepted
    }

    /// Per-position stochastic acceptance against the draft distribution.
    fn accept_by_logits(
        &mut self,
        workspace: &mut DecodeWorkspace,
        batch_idx: usize,
        slot: SeqSlot,
        draft_ids: &[TokenId],
        draft_logits: &[Vec<f32>],
        draft: &DraftInputs,
    ) -> Result<Vec<TokenId>, DecodeError> {
        let mut accepted = Vec::with_capacity(draft_ids.len() + 1);
        let mut draft_probs = vec![0.0f32; self.vocab];

        for (p, &drafted) in draft_ids.iter().enumerate() {
            let target_probs = workspace.softmax_row(batch_idx, p, 0)[..self.vocab].to_vec();
            softmax_into(&draft_logits[p][..self.vocab], &mut draft_probs);

            let x = drafted as usize;
            let threshold = if draft.use_random_accept_threshold {
                draft.random_accept_threshold
            } else {
                (target_probs[x] / draft_probs[x].max(1e-20)).min(1.0)
            };
            let u: f32 = self.rng(slot)?.gen();

            if u < threshold {
                accepted.push(drafted);
                continue;
            }

            // Rejected: resample from the normalized residual
            // max(0, p_target - p_draft).
            let mut residual: Vec<f32> = target_probs
                .iter()
                .zip(&draft_probs)
                .map(|(&t, &d)| (t - d).max(0.0))
                .collect();
            let sum: f32 = residual.iter().sum();
            if sum <= 0.0 {
                residual.copy_from_slice(&target_probs);
            }
            accepted.push(sample_categorical(&residual, self.rng(slot)?) as TokenId);
            return Ok(accepted);
        }

        let bonus_probs = workspace.softmax_row(batch_idx, draft_ids.len(), 0)[..self.vocab].to_vec();
        accepted.push(sample_categorical(&bonus_probs, self.rng(slot)?) as TokenId);
        Ok(accepted)
    }

    fn rng(&mut self, slot: SeqSlot) -> Result<&mut StdRng, DecodeError> {
        self.rngs[slot]
            .as_mut()
            .ok_or_else(|| DecodeError::InvalidArgument(format!("slot {slot} was never set up")))
    }
}

impl DecodeLayer for SpeculativeLayer {
    fn name(&self) -> &'static str {
        "speculative"
    }

    fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[SeqSlot],
        config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        if beam_width != 1 {
            return Err(DecodeError::InvalidArgument(format!(
                "speculative decoding requires beam width 1, got {beam_width}"
            )));
        }
        for i in 0..batch_size {
            let slot = batch_slots[i];
            let seed = SamplingConfig::get_or(&config.random_seed, i, 0);
            self.rngs[slot] = Some(StdRng::seed_from_u64(seed));
        }
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        let draft = inputs
            .draft
            .as_ref()
            .ok_or_else(|| DecodeError::InvalidArgument("missing draft inputs".into()))?;

        for (i, &slot) in inputs.batch_slots.iter().enumerate() {
            let bb = outputs.bb(slot, 0);
            if outputs.finished[bb].is_finished() {
                outputs.set_new_token(0, slot, 0, inputs.end_ids[slot]);
                outputs.accepted_lengths[slot] = 0;
                continue;
            }

            let draft_ids = &draft.draft_ids[i];
            if draft_ids.len() >= self.max_decoding_tokens {
                return Err(DecodeError::InvalidArgument(format!(
                    "{} draft tokens leave no room for the corrective token (max decoding tokens {})",
                    draft_ids.len(),
                    self.max_decoding_tokens
                )));
            }

            let tokens = match &draft.draft_logits {
                Some(all_logits) => self.accept_by_logits(
                    workspace,
                    i,
                    slot,
                    draft_ids,
                    &all_logits[i],
                    draft,
                )?,
                None => self.accept_by_ids(workspace, i, draft_ids),
            };

            let mut written: u32 = 0;
            for (t, &tok) in tokens.iter().enumerate() {
                outputs.push_token(slot, 0, tok);
                outputs.set_new_token(t, slot, 0, tok);
                written += 1;
                if tok == inputs.end_ids[slot] {
                    outputs.finished[bb] = FinishedState::FinishedEos;
                    break;
                }
            }
            outputs.accepted_lengths[slot] = written as u32;
            debug!(
                slot,
                drafted = draft_ids.len(),
                accepted = written.saturating_sub(1),
                "Speculative step"
            );
        }

        // This layer owns the finished reduction for its step.
        for &slot in &inputs.batch_slots {
            outputs.finished_sum[slot] =
                u32::from(outputs.finished[outputs.bb(slot, 0)].is_finished());
        }
        Ok(())
    }

    fn workspace_bytes(&self, batch_size: usize, _beam_width: usize) -> usize {
        batch_size * self.max_decoding_tokens * self.vocab * std::mem::size_of::<f32>()
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn sample_categorical(weights: &[f32], rng: &mut StdRng) -> usize {
    let total: f32 = weights.iter().sum();
    let mut r: f32 = rng.gen::<f32>() * total.max(1e-20);
    for (i, &w) in weights.iter().enumerate() {
        r -= w;
        if r <= 0.0 {
            return i;
        }
    }
    weights.len() - 1
}
