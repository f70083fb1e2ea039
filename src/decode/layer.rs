//! The layer contract and pipeline composition.
//!
//! Every stage of the decoding pipeline implements the same
//! three-operation contract: install per-slot parameters (`setup`),
//! transform logits / produce tokens in place (`forward`), and declare its
//! scratch requirement (`workspace_bytes`). The pipeline is an explicit
//! ordered list of layers fixed at construction for a given mode.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::{DecoderDomain, DecodingMode, SamplingConfig};
use crate::decode::beam::BeamSearchLayer;
use crate::decode::draft::DraftPrepLayer;
use crate::decode::io::{DecodingInput, DecodingOutput};
use crate::decode::penalty::PenaltyLayer;
use crate::decode::sampling::SamplingLayer;
use crate::decode::speculative::SpeculativeLayer;
use crate::decode::words::{BanWordsLayer, StopCriteriaLayer};
use crate::decode::DecodeError;
use crate::SeqSlot;

/// Shared scratch for one pipeline. The logits buffer is the dedicated
/// output the penalty layer writes into (step input logits stay
/// immutable); later layers read and refine it in place.
pub struct DecodeWorkspace {
    /// `[max_batch, max_decoding_tokens, max_beam, vocab_padded]`
    pub logits: Vec<f32>,
    /// Same shape; softmax scratch for the samplers and accepters.
    pub probs: Vec<f32>,
    /// `[vocab_padded]` occurrence counts for penalty application.
    pub token_counts: Vec<u32>,

    max_decoding_tokens: usize,
    max_beam: usize,
    vocab: usize,
}

impl DecodeWorkspace {
    pub fn new(domain: &DecoderDomain) -> Self {
        let rows = domain.max_batch_size * domain.max_decoding_tokens * domain.max_beam_width;
        Self {
            logits: vec![0.0; rows * domain.vocab_size_padded],
            probs: vec![0.0; rows * domain.vocab_size_padded],
            token_counts: vec![0; domain.vocab_size_padded],
            max_decoding_tokens: domain.max_decoding_tokens,
            max_beam: domain.max_beam_width,
            vocab: domain.vocab_size_padded,
        }
    }

    #[inline]
    pub fn row_index(&self, batch_idx: usize, token: usize, beam: usize) -> usize {
        ((batch_idx * self.max_decoding_tokens + token) * self.max_beam + beam) * self.vocab
    }

    pub fn logits_row(&self, batch_idx: usize, token: usize, beam: usize) -> &[f32] {
        let start = self.row_index(batch_idx, token, beam);
        &self.logits[start..start + self.vocab]
    }

    pub fn logits_row_mut(&mut self, batch_idx: usize, token: usize, beam: usize) -> &mut [f32] {
        let start = self.row_index(batch_idx, token, beam);
        &mut self.logits[start..start + self.vocab]
    }

    pub fn probs_row_mut(&mut self, batch_idx: usize, token: usize, beam: usize) -> &mut [f32] {
        let start = self.row_index(batch_idx, token, beam);
        &mut self.probs[start..start + self.vocab]
    }

    /// Softmax one workspace logits row into the probs buffer, returning
    /// the row as a slice.
    pub fn softmax_row(&mut self, batch_idx: usize, token: usize, beam: usize) -> &[f32] {
        let start = self.row_index(batch_idx, token, beam);
        let logits = &self.logits[start..start + self.vocab];
        let probs = &mut self.probs[start..start + self.vocab];
        softmax_into(logits, probs);
        &self.probs[start..start + self.vocab]
    }
}

/// Numerically stable softmax.
pub fn softmax_into(logits: &[f32], probs: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (p, &l) in probs.iter_mut().zip(logits) {
        let e = (l - max).exp();
        *p = e;
        sum += e;
    }
    let inv = 1.0 / sum.max(1e-20);
    for p in probs.iter_mut() {
        *p *= inv;
    }
}

/// One stage of the decoding pipeline.
pub trait DecodeLayer {
    fn name(&self) -> &'static str;

    /// Install per-slot parameters for the given batch, sized to the
    /// decoder domain's maximum batch.
    fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[SeqSlot],
        config: &SamplingConfig,
    ) -> Result<(), DecodeError>;

    /// Transform workspace logits / produce tokens in place.
    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError>;

    /// Pre-declared scratch requirement in bytes.
    fn workspace_bytes(&self, batch_size: usize, beam_width: usize) -> usize {
        let _ = (batch_size, beam_width);
        0
    }
}

/// The composed chain of layers for one decoding mode.
pub struct DecodePipeline {
    mode: DecodingMode,
    layers: Vec<Box<dyn DecodeLayer>>,
    workspace: DecodeWorkspace,
    /// Workspace sizes memoized per (batch, beam, vocab); scoped to this
    /// pipeline's lifetime.
    size_cache: HashMap<(usize, usize, usize), usize>,
    vocab: usize,
}

impl DecodePipeline {
    pub fn new(mode: DecodingMode, domain: &DecoderDomain) -> Result<Self, DecodeError> {
        let layers: Vec<Box<dyn DecodeLayer>> = match mode {
            DecodingMode::TopKTopP
            | DecodingMode::TopK
            | DecodingMode::TopP
            | DecodingMode::MinP => vec![
                Box::new(PenaltyLayer::new(domain)),
                Box::new(BanWordsLayer::new(domain)),
                Box::new(SamplingLayer::new(mode, domain)),
                Box::new(StopCriteriaLayer::new(domain)),
            ],
            DecodingMode::BeamSearch => vec![
                Box::new(PenaltyLayer::new(domain)),
                Box::new(BanWordsLayer::new(domain)),
                Box::new(BeamSearchLayer::new(domain)),
                Box::new(StopCriteriaLayer::new(domain)),
            ],
            DecodingMode::ExternalDraftTokens => vec![
                Box::new(PenaltyLayer::new(domain)),
                Box::new(SpeculativeLayer::new(domain)),
                Box::new(StopCriteriaLayer::new(domain)),
            ],
            DecodingMode::Eagle => vec![
                Box::new(PenaltyLayer::new(domain)),
                Box::new(DraftPrepLayer::new(domain)),
                Box::new(SpeculativeLayer::new(domain)),
                Box::new(StopCriteriaLayer::new(domain)),
            ],
            DecodingMode::Auto => {
                return Err(DecodeError::InvalidArgument(
                    "Auto mode must be resolved before pipeline construction".into(),
                ))
            }
        };

        info!(?mode, num_layers = layers.len(), "Built decode pipeline");
        Ok(Self {
            mode,
            layers,
            workspace: DecodeWorkspace::new(domain),
            size_cache: HashMap::new(),
            vocab: domain.vocab_size_padded,
        })
    }

    pub fn mode(&self) -> DecodingMode {
        self.mode
    }

    pub fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        batch_slots: &[SeqSlot],
        config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        for layer in &mut self.layers {
            layer.setup(batch_size, beam_width, batch_slots, config)?;
        }
        debug!(batch_size, beam_width, "Pipeline setup complete");
        Ok(())
    }

    pub fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
    ) -> Result<(), DecodeError> {
        for layer in &mut self.layers {
            layer.forward(outputs, inputs, &mut self.workspace)?;
        }
        Ok(())
    }

    /// Total scratch the pipeline needs for a batch shape, memoized.
    pub fn workspace_bytes(&mut self, batch_size: usize, beam_width: usize) -> usize {
        let key = (batch_size, beam_width, self.vocab);
        if let Some(&bytes) = self.size_cache.get(&key) {
            return bytes;
        }
        let bytes = self
            .layers
            .iter()
            .map(|l| l.workspace_bytes(batch_size, beam_width))
            .max()
            .unwrap_or(0);
        self.size_cache.insert(key, bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_normalizes() {
        let logits = [1.0f32, 2.0, 3.0];
        let mut probs = [0.0f32; 3];
        softmax_into(&logits, &mut probs);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_pipeline_rejects_unresolved_auto() {
        let domain = DecoderDomain::new(2, 1, 8, 16);
        assert!(DecodePipeline::new(DecodingMode::Auto, &domain).is_err());
    }

    #[test]
    fn test_workspace_size_memoized() {
        let domain = DecoderDomain::new(2, 1, 8, 16);
        let mut p = DecodePipeline::new(DecodingMode::TopKTopP, &domain).unwrap();
        let a = p.workspace_bytes(2, 1);
        let b = p.workspace_bytes(2, 1);
        assert_eq!(a, b);
        assert_eq!(p.size_cache.len(), 1);
    }
}
