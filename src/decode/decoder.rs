//! The batch-level decoder facade.
//!
//! `GptDecoder` owns a pipeline for one decoding mode, validates step
//! shapes, drives per-slot lifecycle stages, and exposes both forward
//! entry points: `forward` reduces `finished_sum` and reports whether
//! every active slot is terminal, `forward_async` runs the same pipeline
//! without the reduction.

use tracing::{debug, info};

use crate::config::{DecoderDomain, DecodingMode, SamplingConfig, DEFAULT_LENGTH_PENALTY};
use crate::decode::beam::{gather_tree, GatheredBeams};
use crate::decode::io::{DecodingInput, DecodingOutput, SlotStage};
use crate::decode::layer::DecodePipeline;
use crate::decode::DecodeError;
use crate::{SeqSlot, TokenId};

pub struct GptDecoder {
    domain: DecoderDomain,
    requested_mode: DecodingMode,
    pipeline: Option<DecodePipeline>,
    stages: Vec<SlotStage>,
    beam_width: usize,

    // Per-slot finalization parameters mirrored from setup.
    length_penalty: Vec<f32>,
    normalize_log_probs: bool,
}

impl GptDecoder {
    pub fn new(mode: DecodingMode, domain: DecoderDomain) -> Result<Self, DecodeError> {
        domain.validate().map_err(DecodeError::InvalidArgument)?;
        info!(?mode, max_batch = domain.max_batch_size, "GptDecoder created");
        Ok(Self {
            stages: vec![SlotStage::Idle; domain.max_batch_size],
            length_penalty: vec![DEFAULT_LENGTH_PENALTY; domain.max_batch_size],
            domain,
            requested_mode: mode,
            pipeline: None,
            beam_width: 1,
            normalize_log_probs: false,
        })
    }

    pub fn domain(&self) -> &DecoderDomain {
        &self.domain
    }

    /// The resolved mode, once setup has run.
    pub fn mode(&self) -> DecodingMode {
        self.pipeline
            .as_ref()
            .map(DecodePipeline::mode)
            .unwrap_or(self.requested_mode)
    }

    pub fn slot_stage(&self, slot: SeqSlot) -> SlotStage {
        self.stages[slot]
    }

    /// Install per-slot sampling parameters for a batch of requests and
    /// (re)build the pipeline for the resolved mode. Setup-time errors
    /// surface before any decoding work.
    pub fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[SeqSlot],
        config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        if batch_slots.len() != batch_size {
            return Err(DecodeError::InvalidArgument(format!(
                "{} batch slots for batch size {batch_size}",
                batch_slots.len()
            )));
        }
        if beam_width != config.beam_width {
            return Err(DecodeError::InvalidArgument(format!(
                "beam width {beam_width} disagrees with sampling config {}",
                config.beam_width
            )));
        }
        if beam_width > self.domain.max_beam_width {
            return Err(DecodeError::InvalidArgument(format!(
                "beam width {beam_width} exceeds domain maximum {}",
                self.domain.max_beam_width
            )));
        }
        config
            .validate(batch_size)
            .map_err(DecodeError::InvalidArgument)?;
        for &slot in batch_slots {
            if slot >= self.domain.max_batch_size {
                return Err(DecodeError::Cache(
                    crate::cache::CacheError::MaxBatchExceeded {
                        slot,
                        max: self.domain.max_batch_size,
                    },
                ));
            }
        }

        let resolved = self.requested_mode.resolve(config);
        let rebuild = self
            .pipeline
            .as_ref()
            .map(|p| p.mode() != resolved)
            .unwrap_or(true);
        if rebuild {
            self.pipeline = Some(DecodePipeline::new(resolved, &self.domain)?);
        }
        self.beam_width = beam_width;
        self.normalize_log_probs = config.normalize_log_probs;

        for i in 0..batch_size {
            let slot = batch_slots[i];
            self.length_penalty[slot] =
                SamplingConfig::get_or(&config.length_penalty, i, DEFAULT_LENGTH_PENALTY);
            self.stages[slot] = SlotStage::Context;
        }

        self.pipeline
            .as_mut()
            .expect("pipeline built above")
            .setup(batch_size, beam_width, batch_slots, config)
    }

    /// Install a slot's prompt into the outputs and reset its decoding
    /// state.
    pub fn init_slot(
        &mut self,
        outputs: &mut DecodingOutput,
        slot: SeqSlot,
        prompt: &[TokenId],
    ) {
        outputs.init_slot(slot, prompt, self.beam_width);
        self.stages[slot] = SlotStage::Context;
        debug!(slot, prompt_len = prompt.len(), "Slot initialized");
    }

    /// One decoding step without the finished reduction.
    pub fn forward_async(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
    ) -> Result<(), DecodeError> {
        self.validate_step(inputs)?;
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| DecodeError::InvalidArgument("forward before setup".into()))?;
        pipeline.forward(outputs, inputs)?;

        for &slot in &inputs.batch_slots {
            let all_finished = (0..self.beam_width)
                .all(|b| outputs.finished[outputs.bb(slot, b)].is_finished());
            self.stages[slot] = if all_finished {
                SlotStage::Finished
            } else {
                SlotStage::Generation
            };
        }
        Ok(())
    }

    /// One decoding step; reduces `finished_sum` and returns `true` iff
    /// every slot of this batch is in a terminal state.
    pub fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
    ) -> Result<bool, DecodeError> {
        self.forward_async(outputs, inputs)?;

        let mut all_done = true;
        for &slot in &inputs.batch_slots {
            let finished = (0..self.beam_width)
                .filter(|&b| outputs.finished[outputs.bb(slot, b)].is_finished())
                .count() as u32;
            outputs.finished_sum[slot] = finished;
            all_done &= finished as usize == self.beam_width;
        }
        Ok(all_done)
    }

    /// Finalize: reconstruct ranked hypotheses from parent pointers and the
    /// CBA (beam search), or emit the decoded sequences as-is (sampling).
    /// Pure with respect to `outputs`; calling twice yields identical
    /// results.
    pub fn gather_tree(
        &self,
        outputs: &DecodingOutput,
        inputs: &DecodingInput,
    ) -> GatheredBeams {
        if self.mode().is_beam_search() {
            return gather_tree(outputs, inputs, &self.length_penalty, self.beam_width);
        }

        // Width-1 passthrough.
        let mut gathered = GatheredBeams {
            max_beam: outputs.max_beam,
            max_seq_len: outputs.max_seq_len,
            output_ids: vec![0; outputs.max_batch * outputs.max_beam * outputs.max_seq_len],
            sequence_lengths: vec![0; outputs.max_batch * outputs.max_beam],
            cum_log_probs: vec![0.0; outputs.max_batch * outputs.max_beam],
            normed_scores: vec![0.0; outputs.max_batch * outputs.max_beam],
        };
        for &slot in &inputs.batch_slots {
            let len = outputs.seq_len(slot, 0);
            let bb = slot * outputs.max_beam;
            let base = bb * outputs.max_seq_len;
            for pos in 0..len {
                gathered.output_ids[base + pos] = outputs.token_at(slot, 0, pos);
            }
            gathered.sequence_lengths[bb] = len as u32;
            let cum = outputs.cum_log_probs[outputs.bb(slot, 0)];
            gathered.cum_log_probs[bb] = cum;
            let gen_len = len.saturating_sub(inputs.input_lengths[slot] as usize).max(1);
            gathered.normed_scores[bb] = if self.normalize_log_probs {
                cum / gen_len as f32
            } else {
                cum
            };
        }
        gathered
    }

    /// Return a slot to the idle stage after its request is removed.
    pub fn release_slot(&mut self, slot: SeqSlot) {
        self.stages[slot] = SlotStage::Idle;
    }

    fn validate_step(&self, inputs: &DecodingInput) -> Result<(), DecodeError> {
        if inputs.logits.vocab != self.domain.vocab_size_padded {
            return Err(DecodeError::InvalidArgument(format!(
                "logits vocab {} does not match padded vocab {}",
                inputs.logits.vocab, self.domain.vocab_size_padded
            )));
        }
        if inputs.logits.batch != inputs.batch_size
            || inputs.batch_slots.len() != inputs.batch_size
        {
            return Err(DecodeError::InvalidArgument(format!(
                "batch mismatch: logits {} / slots {} / declared {}",
                inputs.logits.batch,
                inputs.batch_slots.len(),
                inputs.batch_size
            )));
        }
        if inputs.logits.tokens_per_step > self.domain.max_decoding_tokens {
            return Err(DecodeError::InvalidArgument(format!(
                "{} step tokens exceed max decoding tokens {}",
                inputs.logits.tokens_per_step, self.domain.max_decoding_tokens
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::io::Logits;

    fn domain() -> DecoderDomain {
        DecoderDomain::new(2, 1, 8, 16)
    }

    #[test]
    fn test_setup_validates_shapes() {
        let mut dec = GptDecoder::new(DecodingMode::TopKTopP, domain()).unwrap();
        let config = SamplingConfig::greedy(1);

        assert!(dec.setup(1, 1, &[0], &config).is_ok());
        // Slot out of range surfaces as a capacity error.
        assert!(dec.setup(1, 1, &[9], &config).is_err());
        // Beam width disagreement with the config.
        assert!(dec.setup(1, 2, &[0], &config).is_err());
    }

    #[test]
    fn test_forward_before_setup_fails() {
        let d = domain();
        let mut dec = GptDecoder::new(DecodingMode::TopKTopP, d.clone()).unwrap();
        let mut out = DecodingOutput::new(&d);
        let input = DecodingInput::new(
            &d,
            0,
            vec![0],
            Logits::packed(vec![0.0; 8], 1, 1, 1, 8),
            vec![7; 2],
        );
        assert!(dec.forward_async(&mut out, &input).is_err());
    }

    #[test]
    fn test_vocab_mismatch_rejected() {
        let d = domain();
        let mut dec = GptDecoder::new(DecodingMode::TopKTopP, d.clone()).unwrap();
        dec.setup(1, 1, &[0], &SamplingConfig::greedy(1)).unwrap();

        let mut out = DecodingOutput::new(&d);
        let input = DecodingInput::new(
            &d,
            0,
            vec![0],
            Logits::packed(vec![0.0; 4], 1, 1, 1, 4),
            vec![7; 2],
        );
        let err = dec.forward_async(&mut out, &input).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidArgument(_)));
    }

    #[test]
    fn test_stage_transitions() {
        let d = domain();
        let mut dec = GptDecoder::new(DecodingMode::TopKTopP, d.clone()).unwrap();
        dec.setup(1, 1, &[0], &SamplingConfig::greedy(1)).unwrap();
        assert_eq!(dec.slot_stage(0), SlotStage::Context);

        let mut out = DecodingOutput::new(&d);
        dec.init_slot(&mut out, 0, &[1, 2]);

        let mut logits = vec![0.0f32; 8];
        logits[5] = 9.0;
        let input = DecodingInput::new(
            &d,
            0,
            vec![0],
            Logits::packed(logits, 1, 1, 1, 8),
            vec![7; 2],
        );
        let all_done = dec.forward(&mut out, &input).unwrap();
        assert!(!all_done);
        assert_eq!(dec.slot_stage(0), SlotStage::Generation);

        dec.release_slot(0);
        assert_eq!(dec.slot_stage(0), SlotStage::Idle);
    }
}
