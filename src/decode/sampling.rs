//! Token sampling layers: top-k, top-p, min-p.
//!
//! Probabilities come from the shared softmax prologue over the workspace
//! logits. Each slot draws from its own seeded RNG, so two steps with
//! identical seed, logits, and batch slots produce identical outputs.
//! Greedy slots (top-k 1 or temperature 0) take an argmax path and
//! consume no draw.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{
    DecoderDomain, DecodingMode, SamplingConfig, DEFAULT_TEMPERATURE, DEFAULT_TOP_K,
    DEFAULT_TOP_P, DEFAULT_TOP_P_DECAY, DEFAULT_TOP_P_MIN,
};
use crate::decode::io::{DecodingInput, DecodingOutput, FinishedState};
use crate::decode::layer::{DecodeLayer, DecodeWorkspace};
use crate::decode::DecodeError;
use crate::{SeqSlot, TokenId};

/// Sentinel meaning "no reset id installed".
const TOP_P_RESET_NONE: TokenId = TokenId::MAX;

pub struct SamplingLayer {
    mode: DecodingMode,
    vocab: usize,

    // Per-slot parameter columns.
    top_k: Vec<u32>,
    top_p: Vec<f32>,
    top_p_init: Vec<f32>,
    top_p_decay: Vec<f32>,
    top_p_min: Vec<f32>,
    top_p_reset_ids: Vec<TokenId>,
    min_p: Vec<f32>,

    /// Slots that take the argmax shortcut (top-k 1 or temperature 0) and
    /// must not consume an RNG draw.
    greedy: Vec<bool>,

    /// Per-slot sampler state, the host analogue of per-slot curand states.
    rngs: Vec<Option<StdRng>>,

    /// Scratch: indices sorted by descending probability.
    sorted: Vec<usize>,
}

impl SamplingLayer {
    pub fn new(mode: DecodingMode, domain: &DecoderDomain) -> Self {
        let n = domain.max_batch_size;
        Self {
            mode,
            vocab: domain.vocab_size,
            top_k: vec![DEFAULT_TOP_K; n],
            top_p: vec![DEFAULT_TOP_P; n],
            top_p_init: vec![DEFAULT_TOP_P; n],
            top_p_decay: vec![DEFAULT_TOP_P_DECAY; n],
            top_p_min: vec![DEFAULT_TOP_P_MIN; n],
            top_p_reset_ids: vec![TOP_P_RESET_NONE; n],
            min_p: vec![0.0; n],
            greedy: vec![false; n],
            rngs: (0..n).map(|_| None).collect(),
            sorted: Vec::new(),
        }
    }

    /// Candidate set for one probability row under this layer's mode:
    /// fills `self.sorted` most-probable-first and returns how many leading
    /// entries survive truncation.
    fn truncate(&mut self, probs: &[f32], slot: SeqSlot) -> usize {
        self.sorted.clear();
        self.sorted.extend(0..self.vocab);
        let sorted = &mut self.sorted;
        sorted.sort_unstable_by(|&a, &b| {
            probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut keep = self.vocab;

        if matches!(self.mode, DecodingMode::TopK | DecodingMode::TopKTopP) {
            let k = self.top_k[slot] as usize;
            if k > 0 {
                keep = keep.min(k);
            }
        }

        if matches!(self.mode, DecodingMode::TopP | DecodingMode::TopKTopP) {
            let p = self.top_p[slot];
            if p < 1.0 {
                let mut acc = 0.0f32;
                let mut nucleus = 0;
                for &idx in sorted[..keep].iter() {
                    acc += probs[idx];
                    nucleus += 1;
                    if acc >= p {
                        break;
                    }
                }
                keep = nucleus.max(1);
            }
        }

        if matches!(self.mode, DecodingMode::MinP) {
            let floor = self.min_p[slot] * probs[sorted[0]];
            let mut kept = 0;
            for &idx in sorted.iter() {
                if probs[idx] >= floor {
                    kept += 1;
                } else {
                    break;
                }
            }
            keep = kept.max(1);
        }

        keep
    }

    /// Multiplicative top-p decay, with reset when the drawn token matches
    /// the slot's reset id.
    fn update_top_p(&mut self, slot: SeqSlot, token: TokenId) {
        if !matches!(self.mode, DecodingMode::TopP | DecodingMode::TopKTopP) {
            return;
        }
        if self.top_p_reset_ids[slot] != TOP_P_RESET_NONE && token == self.top_p_reset_ids[slot] {
            self.top_p[slot] = self.top_p_init[slot];
        } else {
            self.top_p[slot] =
                (self.top_p[slot] * self.top_p_decay[slot]).max(self.top_p_min[slot]);
        }
    }
}

impl DecodeLayer for SamplingLayer {
    fn name(&self) -> &'static str {
        "sampling"
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
                "sampling layers require beam width 1, got {beam_width}"
            )));
        }

        for i in 0..batch_size {
            let slot = batch_slots[i];
            self.top_k[slot] = SamplingConfig::get_or(&config.top_k, i, DEFAULT_TOP_K);
            let p = SamplingConfig::get_or(&config.top_p, i, DEFAULT_TOP_P);
            self.top_p[slot] = p;
            self.top_p_init[slot] = p;
            self.top_p_decay[slot] =
                SamplingConfig::get_or(&config.top_p_decay, i, DEFAULT_TOP_P_DECAY);
            self.top_p_min[slot] =
                SamplingConfig::get_or(&config.top_p_min, i, DEFAULT_TOP_P_MIN);
            self.top_p_reset_ids[slot] =
                SamplingConfig::get_or(&config.top_p_reset_ids, i, TOP_P_RESET_NONE);
            self.min_p[slot] = SamplingConfig::get_or(&config.min_p, i, 0.0);

            let temperature =
                SamplingConfig::get_or(&config.temperature, i, DEFAULT_TEMPERATURE);
            self.greedy[slot] = self.top_k[slot] == 1 || temperature == 0.0;

            let seed = SamplingConfig::get_or(&config.random_seed, i, 0);
            self.rngs[slot] = Some(StdRng::seed_from_u64(seed));
        }
        debug!(batch_size, mode = ?self.mode, "Sampling layer configured");
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        for (i, &slot) in inputs.batch_slots.iter().enumerate() {
            let bb = outputs.bb(slot, 0);

            // Sticky terminal state: emit the end id, never touch the
            // recorded sequence.
            if outputs.finished[bb].is_finished() {
                outputs.set_new_token(0, slot, 0, inputs.end_ids[slot]);
                continue;
            }

            let probs = workspace.softmax_row(i, 0, 0).to_vec();

            let token = if self.greedy[slot] {
                argmax(&probs[..self.vocab]) as TokenId
            } else {
                let keep = self.truncate(&probs, slot);
                let kept = &self.sorted[..keep];
                let total: f32 = kept.iter().map(|&idx| probs[idx]).sum();
                let rng = self.rngs[slot]
                    .as_mut()
                    .ok_or_else(|| {
                        DecodeError::InvalidArgument(format!("slot {slot} was never set up"))
                    })?;
                let mut r: f32 = rng.gen::<f32>() * total.max(1e-20);
                let mut chosen = kept[keep - 1];
                for &idx in kept {
                    r -= probs[idx];
                    if r <= 0.0 {
                        chosen = idx;
                        break;
                    }
                }
                chosen as TokenId
            };

            let log_prob = probs[token as usize].max(1e-20).ln();
            let pos = outputs.seq_len(slot, 0);
            let log_prob_idx = outputs.seq_idx(slot, 0, pos);
            outputs.push_token(slot, 0, token);
            outputs.log_probs[log_prob_idx] = log_prob;
            outputs.cum_log_probs[bb] += log_prob;
            outputs.set_new_token(0, slot, 0, token);

            self.update_top_p(slot, token);

            if token == inputs.end_ids[slot] {
                outputs.finished[bb] = FinishedState::FinishedEos;
            }
        }
        Ok(())
    }

    fn workspace_bytes(&self, batch_size: usize, _beam_width: usize) -> usize {
        // probs row plus the sorted-index scratch
        batch_size * self.vocab * (std::mem::size_of::<f32>() + std::mem::size_of::<usize>())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::io::Logits;

    fn domain() -> DecoderDomain {
        DecoderDomain::new(2, 1, 8, 32)
    }

    fn greedy_input(domain: &DecoderDomain, logits: Vec<f32>) -> DecodingInput {
        DecodingInput::new(
            domain,
            0,
            vec![0],
            Logits::packed(logits, 1, 1, 1, domain.vocab_size_padded),
            vec![7; domain.max_batch_size],
        )
    }

    #[test]
    fn test_greedy_takes_argmax() {
        let d = domain();
        let mut layer = SamplingLayer::new(DecodingMode::TopKTopP, &d);
        layer.setup(1, 1, &[0], &SamplingConfig::greedy(1)).unwrap();

        let mut out = DecodingOutput::new(&d);
        out.init_slot(0, &[1, 2], 1);
        let input = greedy_input(&d, vec![0.0, 0.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0]);

        let mut ws = DecodeWorkspace::new(&d);
        // Samplers read workspace logits; stage them directly.
        ws.logits_row_mut(0, 0, 0).copy_from_slice(input.logits.row(0, 0, 0));
        layer.forward(&mut out, &input, &mut ws).unwrap();

        assert_eq!(out.token_at(0, 0, 2), 5);
        assert_eq!(out.new_token(0, 0, 0), 5);
        assert_eq!(out.seq_len(0, 0), 3);
    }

    #[test]
    fn test_end_id_finishes() {
        let d = domain();
        let mut layer = SamplingLayer::new(DecodingMode::TopKTopP, &d);
        layer.setup(1, 1, &[0], &SamplingConfig::greedy(1)).unwrap();

        let mut out = DecodingOutput::new(&d);
        out.init_slot(0, &[1], 1);
        let input = greedy_input(&d, vec![0.0; 7].into_iter().chain([9.0]).collect());

        let mut ws = DecodeWorkspace::new(&d);
        ws.logits_row_mut(0, 0, 0).copy_from_slice(input.logits.row(0, 0, 0));
        layer.forward(&mut out, &input, &mut ws).unwrap();

        assert_eq!(out.finished[0], FinishedState::FinishedEos);
    }

    #[test]
    fn test_identical_seeds_identical_draws() {
        let d = domain();
        let config = SamplingConfig {
            beam_width: 1,
            random_seed: Some(vec![42]),
            top_p: Some(vec![0.9]),
            ..Default::default()
        };

        let sample_once = || {
            let mut layer = SamplingLayer::new(DecodingMode::TopP, &d);
            layer.setup(1, 1, &[0], &config).unwrap();
            let mut out = DecodingOutput::new(&d);
            out.init_slot(0, &[1], 1);
            let input = greedy_input(&d, vec![1.0, 0.5, 2.0, 0.1, 0.0, 1.5, 0.7, -1.0]);
            let mut ws = DecodeWorkspace::new(&d);
            ws.logits_row_mut(0, 0, 0).copy_from_slice(input.logits.row(0, 0, 0));
            layer.forward(&mut out, &input, &mut ws).unwrap();
            (out.token_at(0, 0, 1), out.cum_log_probs[0])
        };

        assert_eq!(sample_once(), sample_once());
    }

    #[test]
    fn test_top_p_decay_and_reset() {
        let d = domain();
        let config = SamplingConfig {
            beam_width: 1,
            top_p: Some(vec![0.8]),
            top_p_decay: Some(vec![0.5]),
            top_p_min: Some(vec![0.1]),
            top_p_reset_ids: Some(vec![2]),
            ..Default::default()
        };
        let mut layer = SamplingLayer::new(DecodingMode::TopP, &d);
        layer.setup(1, 1, &[0], &config).unwrap();

        layer.update_top_p(0, 5);
        assert!((layer.top_p[0] - 0.4).abs() < 1e-6);
        layer.update_top_p(0, 5);
        layer.update_top_p(0, 5);
        // Floored at top_p_min.
        assert!((layer.top_p[0] - 0.1).abs() < 1e-6);

        layer.update_top_p(0, 2);
        assert!((layer.top_p[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_temperature_zero_takes_argmax() {
        let d = domain();
        // No top-k installed: temperature 0 alone must trigger the greedy
        // shortcut instead of a nucleus draw.
        let config = SamplingConfig {
            beam_width: 1,
            temperature: Some(vec![0.0]),
            top_p: Some(vec![0.5]),
            random_seed: Some(vec![9]),
            ..Default::default()
        };
        let mut layer = SamplingLayer::new(DecodingMode::TopKTopP, &d);
        layer.setup(1, 1, &[0], &config).unwrap();
        assert!(layer.greedy[0]);

        let mut out = DecodingOutput::new(&d);
        out.init_slot(0, &[1], 1);
        let input = greedy_input(&d, vec![0.0, 0.0, 4.0, 0.0, 3.9, 0.0, 0.0, 0.0]);

        let mut ws = DecodeWorkspace::new(&d);
        ws.logits_row_mut(0, 0, 0).copy_from_slice(input.logits.row(0, 0, 0));
        layer.forward(&mut out, &input, &mut ws).unwrap();

        assert_eq!(out.token_at(0, 0, 1), 2);
    }

    #[test]
    fn test_min_p_filters_below_floor() {
        let d = domain();
        let config = SamplingConfig {
            beam_width: 1,
            min_p: Some(vec![0.5]),
            random_seed: Some(vec![7]),
            ..Default::default()
        };
        let mut layer = SamplingLayer::new(DecodingMode::MinP, &d);
        layer.setup(1, 1, &[0], &config).unwrap();

        // One dominant token; everything below half its probability drops.
        let probs = vec![0.04, 0.6, 0.05, 0.31, 0.0, 0.0, 0.0, 0.0];
        let keep = layer.truncate(&probs, 0);
        assert_eq!(&layer.sorted[..keep], &[1, 3]);
    }
}
