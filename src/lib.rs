//! paged-decode: batched autoregressive decoding core for LLM inference.
//!
//! Given per-step model logits for a dynamically sized batch of concurrent
//! requests, produces the next output token(s) for each request while
//! maintaining per-request sampling state, beam-search hypotheses,
//! speculative-decoding acceptance, and the paged key-value cache that backs
//! attention. Three components compose the core:
//!   - [`cache`]: paged KV allocator with prefix reuse and two-tier pools
//!   - [`decode`]: the dynamic decoding pipeline (penalties, sampling, beam
//!     search, speculative acceptance)
//!   - [`config`]: decoder domain, sampling and cache configuration
//!
//! The model forward pass, request scheduler, and tokenizer are external
//! collaborators; this crate is embedded by a host runtime that owns them.

pub mod cache;
pub mod config;
pub mod decode;

/// Token identifier in the model vocabulary.
pub type TokenId = u32;

/// Stable per-request index in `[0, max_batch_size)`, assigned by the
/// scheduler on admit. Distinct from the dense batch index used per step.
pub type SeqSlot = usize;
