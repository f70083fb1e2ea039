//! Word-list guards: bad-word banning before sampling, stop-word and
//! length criteria after it.

use tracing::debug;

use crate::config::{DecoderDomain, SamplingConfig};
use crate::decode::io::{DecodingInput, DecodingOutput, FinishedState};
use crate::decode::layer::{DecodeLayer, DecodeWorkspace};
use crate::decode::DecodeError;
use crate::SeqSlot;

/// Masks the final token of any bad word whose prefix matches the current
/// tail, so the sampler cannot complete it.
pub struct BanWordsLayer {
    vocab: usize,
}

impl BanWordsLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            vocab: domain.vocab_size,
        }
    }
}

impl DecodeLayer for BanWordsLayer {
    fn name(&self) -> &'static str {
        "ban_words"
    }

    fn setup(
        &mut self,
        _batch_size: usize,
        _beam_width: usize,
        _batch_slots: &[SeqSlot],
        _config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        let Some(bad_words) = &inputs.bad_words else {
            return Ok(());
        };

        for (i, &slot) in inputs.batch_slots.iter().enumerate() {
            for beam in 0..inputs.logits.beam {
                if outputs.finished[outputs.bb(slot, beam)].is_finished() {
                    continue;
                }
                let len = outputs.seq_len(slot, beam);
                for word in bad_words.for_entry(i) {
                    if word.is_empty() {
                        continue;
                    }
                    let prefix = &word[..word.len() - 1];
                    if prefix.len() > len {
                        continue;
                    }
                    let tail_matches = prefix
                        .iter()
                        .enumerate()
                        .all(|(k, &w)| outputs.token_at(slot, beam, len - prefix.len() + k) == w);
                    if tail_matches {
                        let banned = *word.last().expect("nonempty word") as usize;
                        if banned < self.vocab {
                            workspace.logits_row_mut(i, 0, beam)[banned] = f32::NEG_INFINITY;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Terminal-state criteria: stop-word tail matches and sequence length
/// limits. Runs after token emission; terminal states are sticky.
pub struct StopCriteriaLayer {
    max_beam: usize,
}

impl StopCriteriaLayer {
    pub fn new(domain: &DecoderDomain) -> Self {
        Self {
            max_beam: domain.max_beam_width,
        }
    }

    fn tail_matches_word(
        outputs: &DecodingOutput,
        slot: SeqSlot,
        beam: usize,
        word: &[crate::TokenId],
    ) -> bool {
        let len = outputs.seq_len(slot, beam);
        if word.is_empty() || word.len() > len {
            return false;
        }
        word.iter()
            .enumerate()
            .all(|(k, &w)| outputs.token_at(slot, beam, len - word.len() + k) == w)
    }
}

impl DecodeLayer for StopCriteriaLayer {
    fn name(&self) -> &'static str {
        "stop_criteria"
    }

    fn setup(
        &mut self,
        _batch_size: usize,
        beam_width: usize,
        _batch_slots: &[SeqSlot],
        _config: &SamplingConfig,
    ) -> Result<(), DecodeError> {
        if beam_width > self.max_beam {
            return Err(DecodeError::InvalidArgument(format!(
                "beam width {beam_width} exceeds domain maximum {}",
                self.max_beam
            )));
        }
        Ok(())
    }

    fn forward(
        &mut self,
        outputs: &mut DecodingOutput,
        inputs: &DecodingInput,
        _workspace: &mut DecodeWorkspace,
    ) -> Result<(), DecodeError> {
        for (i, &slot) in inputs.batch_slots.iter().enumerate() {
            for beam in 0..inputs.logits.beam {
                let bb = outputs.bb(slot, beam);
                if outputs.finished[bb].is_finished() {
                    continue;
                }

                if let Some(stop_words) = &inputs.stop_words {
                    let hit = stop_words
                        .for_entry(i)
                        .iter()
                        .any(|w| Self::tail_matches_word(outputs, slot, beam, w));
                    if hit {
                        outputs.finished[bb] = FinishedState::FinishedStopWords;
                        debug!(slot, beam, "Stop word matched");
                        continue;
                    }
                }

                let limit = inputs.sequence_limit_length[slot].min(inputs.max_length as u32);
                if outputs.seq_len(slot, beam) as u32 >= limit {
                    outputs.finished[bb] = FinishedState::FinishedMaxLen;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderDomain;
    use crate::decode::io::{Logits, WordLists};

    fn make_input(domain: &DecoderDomain) -> DecodingInput {
        DecodingInput::new(
            domain,
            0,
            vec![0],
            Logits::packed(vec![0.0; domain.vocab_size_padded], 1, 1, 1, domain.vocab_size_padded),
            vec![7; domain.max_batch_size],
        )
    }

    #[test]
    fn test_bad_word_banned_on_prefix_match() {
        let domain = DecoderDomain::new(1, 1, 8, 16);
        let mut layer = BanWordsLayer::new(&domain);
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[1, 2], 1);

        let mut input = make_input(&domain);
        input.bad_words = Some(WordLists {
            words: vec![vec![vec![2, 5], vec![3, 6]]],
        });

        let mut ws = DecodeWorkspace::new(&domain);
        layer.forward(&mut out, &input, &mut ws).unwrap();

        // Tail [.., 2] matches prefix of [2, 5]: token 5 banned.
        assert_eq!(ws.logits_row(0, 0, 0)[5], f32::NEG_INFINITY);
        // [3, 6] prefix does not match: token 6 untouched.
        assert_eq!(ws.logits_row(0, 0, 0)[6], 0.0);
    }

    #[test]
    fn test_stop_word_finishes_slot() {
        let domain = DecoderDomain::new(1, 1, 8, 16);
        let mut layer = StopCriteriaLayer::new(&domain);
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[1, 4, 5], 1);

        let mut input = make_input(&domain);
        input.stop_words = Some(WordLists {
            words: vec![vec![vec![4, 5]]],
        });

        let mut ws = DecodeWorkspace::new(&domain);
        layer.forward(&mut out, &input, &mut ws).unwrap();
        assert_eq!(out.finished[0], FinishedState::FinishedStopWords);
    }

    #[test]
    fn test_length_limit_finishes_slot() {
        let domain = DecoderDomain::new(1, 1, 8, 16);
        let mut layer = StopCriteriaLayer::new(&domain);
        let mut out = DecodingOutput::new(&domain);
        out.init_slot(0, &[1, 2, 3], 1);

        let mut input = make_input(&domain);
        input.sequence_limit_length[0] = 3;

        let mut ws = DecodeWorkspace::new(&domain);
        layer.forward(&mut out, &input, &mut ws).unwrap();
        assert_eq!(out.finished[0], FinishedState::FinishedMaxLen);
    }
}
