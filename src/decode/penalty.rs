//! Penalty application: temperature, repetition, presence, frequency, and
//! minimum length.
//!
//! Parameters live in structure-of-arrays columns sized to the domain's
//! maximum batch and indexed by slot; absent parameters hold sentinel
//! defaults. Each penalty class is enabled lazily the first time any slot
//! installs a non-default value and then stays on. Output logits go to the
//! workspace buffer; step input logits are never written.

use tracing::debug;

use crate::config::{
    DecoderDomain, SamplingConfig, DEFAULT_FREQUENCY_PENALTY, DEFAULT_MIN_LENGTH,
    DEFAULT_PRESENCE_PENALTY, DEFAULT_REPETITION_PENALTY, DEFAULT_TEMPERATURE,
};
use crate::decode::io::{DecodingInput, DecodingOutput};
use crate::decode::layer::{DecodeLayer, DecodeWorkspace};
use crate::decode::DecodeError;
use crate::SeqSlot;

pub struct PenaltyLayer {
    vocab: usize,
    vocab_padded: usize,
    max_seq_len: usize,

    // Per-slot parameter columns.
    temperature: Vec<f32>,
    repetition: Vec<f32>,
    presence: Vec<f32>,
    frequency: Vec<f32>,
    min_length: Vec<u32>,

    // Lazily enabled penalty classes; once on, they stay on.
    use_temperature: bool,
    use_repetition: bool,
    use_presence: bool,
    use_frequency: bool,
    use_min_length: bool,

    /// Cyclic step counter over `max_seq_len`, indexing the rolling window
    /// of workspace row offsets for multi-token steps.
    cyclic_step: usize,
    logits_window: Vec<usize>,
}

impl PenaltyLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        let n = domain.max_batch_size;
        Self {
            vocab: domain.vocab_size,
            vocab_padded: domain.vocab_size_padded,
            max_seq_len: domain.max_seq_len,
            temperature: vec![DEFAULT_TEMPERATURE; n],
            repetition: vec![DEFAULT_REPETITION_PENALTY; n],
            presence: vec![DEFAULT_PRESENCE_PENALTY; n],
            frequency: vec![DEFAULT_FREQUENCY_PENALTY; n],
            min_length: vec![DEFAULT_MIN_LENGTH; n],
            use_temperature: false,
            use_repetition: false,
            use_presence: false,
            use_frequency: false,
            use_min_length: false,
            cyclic_step: 0,
            logits_window: vec![0; domain.max_seq_len],
        }
    }

    /// Rolling window of workspace row offsets, indexed by cyclic step.
    /// Multi-token verification steps read their recent logits rows
    /// through this window.
    pub fn recent_logits_offsets(&self) -> &[usize] {
        &self.logits_window
    }

    fn count_tokens(
        counts: &mut [u32],
        outputs: &DecodingOutput,
        slot: SeqSlot,
        beam: usize,
    ) {
        counts.fill(0);
        let len = outputs.seq_len(slot, beam);
        for pos in 0..len {
            let tok = outputs.token_at(slot, beam, pos) as usize;
            if tok < counts.len() {
                counts[tok] += 1;
            }
        }
    }
}

impl DecodeLayer for PenaltyLayer {
    fn name(&self) -> &'static str {
        "penalty"
    }

    fn setup(
        &mut self,
        batch_size: usize,
        _beam_width: usize,
        batch_slots: &[SeqSlot],
        config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        for i in 0..batch_size {
            let slot = batch_slots[i];
            self.temperature[slot] =
                SamplingConfig::get_or(&config.temperature, i, DEFAULT_TEMPERATURE);
            self.repetition[slot] =
                SamplingConfig::get_or(&config.repetition_penalty, i, DEFAULT_REPETITION_PENALTY);
            self.presence[slot] =
                SamplingConfig::get_or(&config.presence_penalty, i, DEFAULT_PRESENCE_PENALTY);
            self.frequency[slot] =
                SamplingConfig::get_or(&config.frequency_penalty, i, DEFAULT_FREQUENCY_PENALTY);
            self.min_length[slot] =
                SamplingConfig::get_or(&config.min_length, i, DEFAULT_MIN_LENGTH);

            self.use_temperature |= self.temperature[slot] != DEFAULT_TEMPERATURE;
            self.use_repetition |= self.repetition[slot] != DEFAULT_REPETITION_PENALTY;
            self.use_presence |= self.presence[slot] != DEFAULT_PRESENCE_PENALTY;
            self.use_frequency |= self.frequency[slot] != DEFAULT_FREQUENCY_PENALTY;
            self.use_min_length |= self.min_length[slot] != DEFAULT_MIN_LENGTH;
        }
        debug!(
            temperature = self.use_temperature,
            repetition = self.use_repetition,
            presence = self.use_presence,
            frequency = self.use_frequency,
            min_length = self.use_min_length,
            "Penalty classes enabled"
        );
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        let tokens_per_step = inputs.logits.tokens_per_step;
        let beams = inputs.logits.beam;

        for (i, &slot) in inputs.batch_slots.iter().enumerate() {
            for beam in 0..beams {
                if outputs.finished[outputs.bb(slot, beam)].is_finished() {
                    continue;
                }

                let apply_counts =
                    self.use_repetition || self.use_presence || self.use_frequency;
                if apply_counts {
                    Self::count_tokens(&mut workspace.token_counts, outputs, slot, beam);
                }

                for t in 0..tokens_per_step {
                    let src = inputs.logits.row(i, t, beam);
                    // Split-borrow the scratch so the counts stay readable
                    // while the row is written.
                    let counts = std::mem::take(&mut workspace.token_counts);
                    let dst = workspace.logits_row_mut(i, t, beam);
                    dst.copy_from_slice(src);

                    // Padded vocab tail is never a valid candidate.
                    for v in self.vocab..self.vocab_padded {
                        dst[v] = f32::NEG_INFINITY;
                    }

                    if apply_counts {
                        for (v, &count) in counts.iter().enumerate().take(self.vocab) {
                            if count == 0 {
                                continue;
                            }
                            if self.use_repetition {
                                let r = self.repetition[slot];
                                dst[v] = if dst[v] > 0.0 { dst[v] / r } else { dst[v] * r };
                            }
                            if self.use_presence {
                                dst[v] -= self.presence[slot];
                            }
                            if self.use_frequency {
                                dst[v] -= self.frequency[slot] * count as f32;
                            }
                        }
                    }

                    if self.use_temperature {
                        let inv = 1.0 / self.temperature[slot].max(1e-6);
                        for v in dst.iter_mut() {
                            *v *= inv;
                        }
                    }

                    if self.use_min_length {
                        let generated = outputs.seq_len(slot, beam) as u32
                            - inputs.input_lengths[slot].min(outputs.seq_len(slot, beam) as u32);
                        if generated < self.min_length[slot] {
                            let end = inputs.end_ids[slot] as usize;
                            if end < dst.len() {
                                dst[end] = f32::NEG_INFINITY;
                            }
                        }
                    }

                    workspace.token_counts = counts;
                }
            }
        }

        // Rolling window of row offsets for kernels that consume a recent
        // logits history.
        self.logits_window[self.cyclic_step] = workspace.row_index(0, 0, 0);
        self.cyclic_step = (self.cyclic_step + 1) % self.max_seq_len;
        Ok(())
    }

    fn workspace_bytes(&self, batch_size: usize, beam_width: usize) -> usize {
        batch_size * beam_width * self.vocab_padded * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderDomain;
    use crate::decode::io::Logits;

    fn setup_layer(domain: &DecoderDomain, config: &SamplingConfig) -> PenaltyLayer {
        let mut layer = PenaltyLayer::new(domain);
        layer.setup(1, 1, &[0], config).unwrap();
        layer
    }

    fn run(
        layer: &mut PenaltyLayer,
        domain: &DecoderDomain,
        outputs: &mut DecodingOutput,
        logits: Vec<f32>,
    ) -> Vec<f32> {
        let input = DecodingInput::new(
            domain,
            0,
            vec![0],
            Logits::packed(logits, 1, 1, 1, domain.vocab_size_padded),
            vec![3; domain.max_batch_size],
        );
        let mut ws = DecodeWorkspace::new(domain);
        layer.forward(outputs, &input, &mut ws).unwrap();
        ws.logits_row(0, 0, 0).to_vec()
    }

    #[test]
    fn test_defaults_pass_through() {
        let domain = DecoderDomain::new(1, 1, 4, 16);
        let mut layer = setup_layer(&domain, &SamplingConfig::default());
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[1], 1);

        let res = run(&mut layer, &domain, &mut out, vec![0.5, -1.0, 2.0, 0.0]);
        assert_eq!(res, vec![0.5, -1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_repetition_penalty_scales_seen_tokens() {
        let domain = DecoderDomain::new(1, 1, 4, 16);
        let config = SamplingConfig {
            beam_width: 1,
            repetition_penalty: Some(vec![2.0]),
            ..Default::default()
        };
        let mut layer = setup_layer(&domain, &config);
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[2], 1); // token 2 already seen

        let res = run(&mut layer, &domain, &mut out, vec![1.0, -1.0, 2.0, 0.0]);
        // Seen positive logit divided, unseen untouched.
        assert_eq!(res[2], 1.0);
        assert_eq!(res[0], 1.0);
        assert_eq!(res[1], -1.0);
    }

    #[test]
    fn test_min_length_masks_end_id() {
        let domain = DecoderDomain::new(1, 1, 4, 16);
        let config = SamplingConfig {
            beam_width: 1,
            min_length: Some(vec![5]),
            ..Default::default()
        };
        let mut layer = setup_layer(&domain, &config);
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[1], 1);

        // end id is 3 in `run`.
        let res = run(&mut layer, &domain, &mut out, vec![0.0, 0.0, 0.0, 9.0]);
        assert_eq!(res[3], f32::NEG_INFINITY);
    }

    #[test]
    fn test_frequency_penalty_counts_occurrences() {
        let domain = DecoderDomain::new(1, 1, 4, 16);
        let config = SamplingConfig {
            beam_width: 1,
            frequency_penalty: Some(vec![0.5]),
            ..Default::default()
        };
        let mut layer = setup_layer(&domain, &config);
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[2, 2, 1], 1);

        let res = run(&mut layer, &domain, &mut out, vec![0.0, 0.0, 0.0, 0.0]);
        assert_eq!(res[2], -1.0); // two occurrences
        assert_eq!(res[1], -0.5); // one occurrence
        assert_eq!(res[0], 0.0);
    }
}
