//! Decoder configuration.
//!
//! All knobs for the decoding core live here: the immutable decoder domain
//! (batch/beam/vocab bounds), the KV cache geometry, and the per-request
//! sampling configuration installed through `setup`.

use serde::{Deserialize, Serialize};

use crate::TokenId;

/// Immutable bounds of a decoder instance. Fixed at construction; every
/// buffer in the pipeline is sized from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderDomain {
    /// Maximum number of concurrent batch slots.
    pub max_batch_size: usize,

    /// Maximum beam width any slot may request.
    pub max_beam_width: usize,

    /// Logical vocabulary size.
    pub vocab_size: usize,

    /// Padded vocabulary size as produced by the model head
    /// (`vocab_size_padded >= vocab_size`; the tail is ignored).
    pub vocab_size_padded: usize,

    /// Maximum tokens decoded per step per slot (> 1 only for
    /// speculative/draft-tree modes).
    pub max_decoding_tokens: usize,

    /// Maximum sequence length (context + generation).
    pub max_seq_len: usize,
}

impl DecoderDomain {
    pub fn new(
        max_batch_size: usize,
        max_beam_width: usize,
        vocab_size: usize,
        max_seq_len: usize,
    ) -> Self {
        Self {
            max_batch_size,
            max_beam_width,
            vocab_size,
            vocab_size_padded: vocab_size,
            max_decoding_tokens: 1,
            max_seq_len,
        }
    }

    pub fn with_vocab_padded(mut self, vocab_size_padded: usize) -> Self {
        self.vocab_size_padded = vocab_size_padded;
        self
    }

    pub fn with_max_decoding_tokens(mut self, max_decoding_tokens: usize) -> Self {
        self.max_decoding_tokens = max_decoding_tokens;
        self
    }

    /// Check internal consistency. Called once by the decoder facade.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 || self.max_beam_width == 0 {
            return Err("batch size and beam width must be nonzero".into());
        }
        if self.vocab_size == 0 || self.vocab_size_padded < self.vocab_size {
            return Err(format!(
                "invalid vocab sizes: vocab_size={} vocab_size_padded={}",
                self.vocab_size, self.vocab_size_padded
            ));
        }
        if self.max_decoding_tokens == 0 || self.max_seq_len == 0 {
            return Err("max_decoding_tokens and max_seq_len must be nonzero".into());
        }
        Ok(())
    }
}

/// Which decoding pipeline to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodingMode {
    /// Top-k filtering followed by top-p within the kept set.
    TopKTopP,
    /// Pure top-k sampling.
    TopK,
    /// Pure nucleus sampling.
    TopP,
    /// Min-p sampling (relative-to-peak probability floor).
    MinP,
    /// Beam search with a candidate-beam-array of finished hypotheses.
    BeamSearch,
    /// Speculative decoding against externally drafted tokens.
    ExternalDraftTokens,
    /// Draft-tree speculative decoding (Eagle-style).
    Eagle,
    /// Resolve from the sampling configuration at setup.
    Auto,
}

impl DecodingMode {
    /// Resolve `Auto` against an installed sampling configuration.
    pub fn resolve(self, config: &SamplingConfig) -> DecodingMode {
        match self {
            DecodingMode::Auto => {
                if config.beam_width > 1 {
                    DecodingMode::BeamSearch
                } else if config.min_p.is_some() {
                    DecodingMode::MinP
                } else {
                    DecodingMode::TopKTopP
                }
            }
            other => other,
        }
    }

    /// Whether this mode runs the beam-search layer.
    pub fn is_beam_search(&self) -> bool {
        matches!(self, DecodingMode::BeamSearch)
    }
}

/// KV cache geometry and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheConfig {
    /// Number of blocks in the primary (fast) pool.
    pub blocks_in_primary_pool: usize,

    /// Number of blocks in the secondary (slow) pool.
    pub blocks_in_secondary_pool: usize,

    /// Tokens stored per block.
    pub tokens_per_block: usize,

    /// Attention window in tokens (excluding the sink prefix). Sequences
    /// longer than `sink + window` wrap cyclically over their blocks.
    pub max_attention_window: usize,

    /// Number of sink tokens always retained at the head of a sequence.
    pub sink_token_length: usize,

    /// Enable prefix-tree block reuse across requests.
    pub enable_block_reuse: bool,

    /// Allocate pools from unified (managed) memory. Advisory here: the
    /// host runtime decides the actual backing; the manager only records it.
    pub use_uvm: bool,

    /// Copy secondary-resident blocks into the primary pool before they are
    /// published to attention.
    pub onboard_blocks: bool,

    /// KV heads per block.
    pub num_kv_heads: usize,

    /// Per-head embedding size.
    pub size_per_head: usize,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            blocks_in_primary_pool: 512,
            blocks_in_secondary_pool: 0,
            tokens_per_block: 64,
            max_attention_window: 4096,
            sink_token_length: 0,
            enable_block_reuse: true,
            use_uvm: false,
            onboard_blocks: true,
            num_kv_heads: 8,
            size_per_head: 128,
        }
    }
}

impl KvCacheConfig {
    /// Elements (K and V) a single block holds:
    /// `2 * num_kv_heads * tokens_per_block * size_per_head`.
    pub fn block_elems(&self) -> usize {
        2 * self.num_kv_heads * self.tokens_per_block * self.size_per_head
    }

    /// Padding that rounds the sink prefix up to a block boundary. Zero when
    /// the sink length is already block-aligned.
    pub fn sink_bubble_length(&self) -> usize {
        let rem = self.sink_token_length % self.tokens_per_block;
        if rem == 0 {
            0
        } else {
            self.tokens_per_block - rem
        }
    }
}

/// Early-stopping policy for beam search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EarlyStopping {
    /// Run to max length regardless of finished hypotheses.
    Never,
    /// Stop once the CBA holds `beam_width` hypotheses and no live beam can
    /// still beat the worst kept score.
    Once,
    /// Stop as soon as the CBA holds `beam_width` hypotheses.
    Always,
}

/// Sentinel defaults used when a per-slot parameter is absent.
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.0;
pub const DEFAULT_PRESENCE_PENALTY: f32 = 0.0;
pub const DEFAULT_FREQUENCY_PENALTY: f32 = 0.0;
pub const DEFAULT_MIN_LENGTH: u32 = 0;
pub const DEFAULT_TOP_K: u32 = 0;
pub const DEFAULT_TOP_P: f32 = 1.0;
pub const DEFAULT_TOP_P_DECAY: f32 = 1.0;
pub const DEFAULT_TOP_P_MIN: f32 = 1e-6;
pub const DEFAULT_LENGTH_PENALTY: f32 = 0.0;
pub const DEFAULT_BEAM_DIVERSITY: f32 = 0.0;

/// Per-request sampling configuration, batched column-wise.
///
/// Each optional vector holds one entry per dense batch index of the
/// `setup` call it is passed to (not per slot); absent vectors mean "use
/// the sentinel default for every entry". Layers scatter these into
/// slot-indexed columns sized to the decoder domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Beam width shared by every request in the `setup` batch.
    pub beam_width: usize,

    pub random_seed: Option<Vec<u64>>,
    pub temperature: Option<Vec<f32>>,
    pub repetition_penalty: Option<Vec<f32>>,
    pub presence_penalty: Option<Vec<f32>>,
    pub frequency_penalty: Option<Vec<f32>>,
    pub min_length: Option<Vec<u32>>,

    pub top_k: Option<Vec<u32>>,
    pub top_p: Option<Vec<f32>>,
    pub top_p_decay: Option<Vec<f32>>,
    pub top_p_min: Option<Vec<f32>>,
    pub top_p_reset_ids: Option<Vec<TokenId>>,
    pub min_p: Option<Vec<f32>>,

    pub beam_search_diversity_rate: Option<Vec<f32>>,
    pub length_penalty: Option<Vec<f32>>,
    pub early_stopping: Option<Vec<EarlyStopping>>,

    /// Divide emitted cumulative log-probs by sequence length.
    pub normalize_log_probs: bool,
}

impl SamplingConfig {
    /// A width-1 sampling config with every field defaulted.
    pub fn greedy(batch_size: usize) -> Self {
        Self {
            beam_width: 1,
            top_k: Some(vec![1; batch_size]),
            ..Default::default()
        }
    }

    /// Check that every present vector matches the setup batch size.
    pub fn validate(&self, batch_size: usize) -> Result<(), String> {
        fn check<T>(name: &str, v: &Option<Vec<T>>, n: usize) -> Result<(), String> {
            match v {
                Some(v) if v.len() != n => Err(format!(
                    "{name} has {} entries, expected {n}",
                    v.len()
                )),
                _ => Ok(()),
            }
        }
        if self.beam_width == 0 {
            return Err("beam_width must be nonzero".into());
        }
        check("random_seed", &self.random_seed, batch_size)?;
        check("temperature", &self.temperature, batch_size)?;
        check("repetition_penalty", &self.repetition_penalty, batch_size)?;
        check("presence_penalty", &self.presence_penalty, batch_size)?;
        check("frequency_penalty", &self.frequency_penalty, batch_size)?;
        check("min_length", &self.min_length, batch_size)?;
        check("top_k", &self.top_k, batch_size)?;
        check("top_p", &self.top_p, batch_size)?;
        check("top_p_decay", &self.top_p_decay, batch_size)?;
        check("top_p_min", &self.top_p_min, batch_size)?;
        check("top_p_reset_ids", &self.top_p_reset_ids, batch_size)?;
        check("min_p", &self.min_p, batch_size)?;
        check(
            "beam_search_diversity_rate",
            &self.beam_search_diversity_rate,
            batch_size,
        )?;
        check("length_penalty", &self.length_penalty, batch_size)?;
        check("early_stopping", &self.early_stopping, batch_size)?;
        Ok(())
    }

    /// Entry `i` of an optional vector, or the given default.
    pub fn get_or<T: Copy>(v: &Option<Vec<T>>, i: usize, default: T) -> T {
        v.as_ref().map(|v| v[i]).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_bubble_rounding() {
        let mut cfg = KvCacheConfig {
            tokens_per_block: 4,
            sink_token_length: 4,
            ..Default::default()
        };
        // Block-aligned sink: no bubble.
        assert_eq!(cfg.sink_bubble_length(), 0);

        cfg.sink_token_length = 5;
        assert_eq!(cfg.sink_bubble_length(), 3);

        cfg.sink_token_length = 0;
        assert_eq!(cfg.sink_bubble_length(), 0);
    }

    #[test]
    fn test_mode_resolution() {
        let mut cfg = SamplingConfig {
            beam_width: 1,
            ..Default::default()
        };
        assert_eq!(DecodingMode::Auto.resolve(&cfg), DecodingMode::TopKTopP);

        cfg.min_p = Some(vec![0.1]);
        assert_eq!(DecodingMode::Auto.resolve(&cfg), DecodingMode::MinP);

        cfg.beam_width = 4;
        assert_eq!(DecodingMode::Auto.resolve(&cfg), DecodingMode::BeamSearch);

        // Explicit modes resolve to themselves.
        assert_eq!(DecodingMode::TopP.resolve(&cfg), DecodingMode::TopP);
    }

    #[test]
    fn test_sampling_config_validation() {
        let cfg = SamplingConfig {
            beam_width: 1,
            temperature: Some(vec![0.7, 0.9]),
            ..Default::default()
        };
        assert!(cfg.validate(2).is_ok());
        assert!(cfg.validate(3).is_err());
    }

    #[test]
    fn test_domain_validation() {
        let domain = DecoderDomain::new(8, 4, 32000, 2048);
        assert!(domain.validate().is_ok());

        let bad = DecoderDomain::new(8, 4, 32000, 2048).with_vocab_padded(100);
        assert!(bad.validate().is_err());
    }
}
