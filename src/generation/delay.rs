//! Delay pattern for multi-codebook generation.
//!
//! Codebook `c` starts producing tokens `c` steps after codebook 0, so at
//! step `s` codebook `c` emits the token for audio frame `s - c`. Each
//! codebook can therefore condition on the lower codebooks' choices for the
//! same frame. [`DelayPattern::reorder`] strips the offsets again once
//! generation has finished.
//!
//! ```text
//! step        0    1    2    3    4
//! codebook 0  t0   t1   t2   t3   t4
//! codebook 1  P    t0   t1   t2   t3
//! codebook 2  P    P    t0   t1   t2
//! codebook 3  P    P    P    t0   t1
//! ```

use crate::error::{Error, Result};

/// Staggered-start schedule for `num_codebooks` parallel codebooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPattern {
    num_codebooks: usize,
    pad_token_id: u32,
}

impl DelayPattern {
    /// Create a schedule. At least one codebook is required.
    pub fn new(num_codebooks: usize, pad_token_id: u32) -> Result<Self> {
        if num_codebooks == 0 {
            return Err(Error::precondition(
                "delay pattern needs at least one codebook",
            ));
        }
        Ok(Self {
            num_codebooks,
            pad_token_id,
        })
    }

    pub fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }

    /// Token fed for codebooks that have not started (or have finished).
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Live output position of every codebook at `step`, ordered by codebook.
    ///
    /// Entry `c` is `Some(step - c)` once codebook `c` has started and `None`
    /// before that.
    pub fn live_indices(&self, step: usize) -> Vec<Option<usize>> {
        (0..self.num_codebooks)
            .map(|codebook| step.checked_sub(codebook))
            .collect()
    }

    /// Whether the last codebook has produced `target_length` tokens after
    /// `step` completed steps.
    pub fn is_complete(&self, step: usize, target_length: usize) -> bool {
        step.checked_sub(self.num_codebooks - 1)
            .is_some_and(|produced| produced >= target_length)
    }

    /// Forward-pass invocations needed for `target_length` frames.
    pub fn total_steps(&self, target_length: usize) -> usize {
        target_length + self.num_codebooks - 1
    }

    /// Drop the first `c` entries of codebook `c`.
    ///
    /// Codebooks shorter than their offset (a session cancelled early) come
    /// back empty. Lengths are left ragged; see [`Self::reorder`].
    pub fn strip_offsets(&self, raw: &[Vec<u32>]) -> Vec<Vec<u32>> {
        raw.iter()
            .enumerate()
            .map(|(codebook, tokens)| tokens.get(codebook..).unwrap_or_default().to_vec())
            .collect()
    }

    /// Undo the delay pattern: strip the per-codebook offsets, then truncate
    /// every codebook to the shortest one so position `i` is the same audio
    /// frame in all codebooks.
    ///
    /// `raw` must have been recorded in lockstep, one entry per step for
    /// every codebook. A completed session yields exactly `target_length`
    /// tokens per codebook.
    pub fn reorder(&self, raw: &[Vec<u32>]) -> Vec<Vec<u32>> {
        let mut aligned = self.strip_offsets(raw);
        let shortest = aligned.iter().map(Vec::len).min().unwrap_or(0);
        for tokens in aligned.iter_mut() {
            tokens.truncate(shortest);
        }
        aligned
    }

    /// Apply the delay pattern to time-aligned codes (the inverse of
    /// [`Self::reorder`]): codebook `c` gets `c` leading pads and
    /// `num_codebooks - 1 - c` trailing pads.
    pub fn apply(&self, aligned: &[Vec<u32>]) -> Vec<Vec<u32>> {
        let last = self.num_codebooks - 1;
        aligned
            .iter()
            .enumerate()
            .map(|(codebook, tokens)| {
                let trailing = last.saturating_sub(codebook);
                let mut delayed = Vec::with_capacity(codebook + tokens.len() + trailing);
                delayed.resize(codebook, self.pad_token_id);
                delayed.extend_from_slice(tokens);
                delayed.resize(delayed.len() + trailing, self.pad_token_id);
                delayed
            })
            .collect()
    }
}
