//! The dynamic decoding pipeline.
//!
//! A composable chain of stateful layers turns per-step model logits into
//! output tokens for a heterogeneous batch where each slot has its own
//! sampling configuration and lifecycle stage:
//! - [`io`]: step inputs/outputs and per-slot lifecycle state
//! - [`layer`]: the layer contract, pipeline composition, workspace
//! - [`penalty`]: temperature and repetition/presence/frequency penalties
//! - [`words`]: bad-word banning and stop criteria
//! - [`sampling`]: top-k / top-p / min-p token sampling
//! - [`beam`]: beam search, finished-hypothesis bookkeeping, gather_tree
//! - [`speculative`]: draft-token acceptance (by ids and by logits)
//! - [`draft`]: draft-tree preparation for tree-based speculation
//! - [`decoder`]: the batch-level decoder facade

pub mod beam;
pub mod decoder;
pub mod draft;
pub mod io;
pub mod layer;
pub mod penalty;
pub mod sampling;
pub mod speculative;
pub mod words;

use thiserror::Error;

use crate::cache::CacheError;

#[derive(Error, Debug)]
pub enum DecodeError {
    /// Shape/type mismatch caught at setup or on first forward.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Capacity errors propagate untouched so the scheduler can evict or
    /// defer.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub use decoder::GptDecoder;
pub use io::{DecodingInput, DecodingOutput, FinishedState, Logits};
pub use layer::{DecodeLayer, DecodePipeline, DecodeWorkspace};
