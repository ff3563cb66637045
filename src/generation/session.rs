//! Generation session: the autoregressive driver loop.
//!
//! A [`GenerationSession`] borrows a model's [`LayerCaches`] and its
//! [`ForwardPass`] for the duration of one generation. Each call to
//! [`GenerationSession::step`] feeds the previous step's tokens through the
//! forward pass, records one entry per codebook, and checks the
//! [`DelayPattern`] for completion. On completion the raw buffers are
//! reordered into time-aligned codes.
//!
//! ```text
//! Idle ──step──▶ Stepping ──step──▶ … ──▶ Completed
//!                   │
//!                   ├── cancel ──▶ Cancelled
//!                   └── forward pass error ──▶ Failed
//! ```
//!
//! Every terminal transition resets the caches, so the same
//! [`LayerCaches`] can be handed to the next session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::Tensor;

use super::delay::DelayPattern;
use crate::error::{Error, Result};
use crate::models::kv_cache::LayerCaches;

/// The transformer decoder, seen from the driver loop.
pub trait ForwardPass {
    /// Run one decoder step.
    ///
    /// `tokens` holds one input id per codebook, in codebook order. The
    /// implementation must read and extend every cache in `caches` exactly
    /// once, in layer order, and return one predicted id per codebook
    /// (entries for codebooks that are not live yet are ignored).
    fn predict(
        &mut self,
        tokens: &[u32],
        caches: &mut LayerCaches,
        conditioning: &Tensor,
    ) -> anyhow::Result<Vec<u32>>;
}

impl<F: ForwardPass + ?Sized> ForwardPass for &mut F {
    fn predict(
        &mut self,
        tokens: &[u32],
        caches: &mut LayerCaches,
        conditioning: &Tensor,
    ) -> anyhow::Result<Vec<u32>> {
        (**self).predict(tokens, caches, conditioning)
    }
}

impl<F: ForwardPass + ?Sized> ForwardPass for Box<F> {
    fn predict(
        &mut self,
        tokens: &[u32],
        caches: &mut LayerCaches,
        conditioning: &Tensor,
    ) -> anyhow::Result<Vec<u32>> {
        (**self).predict(tokens, caches, conditioning)
    }
}

/// Cooperative cancellation flag, checked between steps.
///
/// Clones share the flag, so a UI thread can cancel a session running on a
/// worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a [`GenerationSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Stepping,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// Result of one [`GenerationSession::step`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Steps completed so far.
    pub step: usize,
    /// Fraction in [0, 1]; held below 1.0 until the session completes.
    pub progress: f32,
    pub state: SessionState,
}

/// How a session that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Time-aligned codes, one equal-length sequence per codebook.
    Completed(Vec<Vec<u32>>),
    Cancelled,
}

/// One generation run over borrowed caches and forward pass.
pub struct GenerationSession<'a, F: ForwardPass + ?Sized> {
    pattern: DelayPattern,
    caches: &'a mut LayerCaches,
    forward: &'a mut F,
    conditioning: Tensor,
    target_length: usize,
    step: usize,
    /// One buffer per codebook, one entry per completed step
    raw: Vec<Vec<u32>>,
    state: SessionState,
    cancel: CancelToken,
    aligned: Option<Vec<Vec<u32>>>,
    /// Exclusive upper bound for live predictions, when known
    vocab_size: Option<usize>,
}

impl<'a, F: ForwardPass + ?Sized> GenerationSession<'a, F> {
    /// Begin a session producing `target_length` frames per codebook.
    ///
    /// Clears `caches` so state from an earlier session cannot leak in.
    pub fn start(
        pattern: DelayPattern,
        caches: &'a mut LayerCaches,
        forward: &'a mut F,
        conditioning: Tensor,
        target_length: usize,
    ) -> Result<Self> {
        if target_length == 0 {
            return Err(Error::precondition("target length must be at least 1"));
        }
        caches.reset_all();

        tracing::debug!(
            "Starting generation: {} codebooks, {} frames, {} steps, {} layers",
            pattern.num_codebooks(),
            target_length,
            pattern.total_steps(target_length),
            caches.len()
        );

        let capacity = pattern.total_steps(target_length);
        let raw = vec![Vec::with_capacity(capacity); pattern.num_codebooks()];
        Ok(Self {
            pattern,
            caches,
            forward,
            conditioning,
            target_length,
            step: 0,
            raw,
            state: SessionState::Idle,
            cancel: CancelToken::new(),
            aligned: None,
            vocab_size: None,
        })
    }

    /// Use an externally owned cancellation flag.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Treat a live prediction `>= vocab_size` as a failed step.
    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = Some(vocab_size);
        self
    }

    /// A handle that cancels this session from elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancel now. No-op once the session is terminal.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.cancel.cancel();
            self.finish_cancelled();
        }
    }

    /// Run one decoder step.
    ///
    /// Returns the new state; [`SessionState::Cancelled`] when cancellation
    /// was requested before this step. A forward-pass failure moves the
    /// session to [`SessionState::Failed`] and is returned as
    /// [`Error::GenerationFailed`]. Stepping a terminal session is a
    /// precondition violation.
    pub fn step(&mut self) -> Result<StepReport> {
        if self.state.is_terminal() {
            return Err(Error::precondition(format!(
                "cannot step a session in state {:?}",
                self.state
            )));
        }
        if self.cancel.is_cancelled() {
            self.finish_cancelled();
            return Ok(self.report());
        }
        self.state = SessionState::Stepping;

        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("decode_step", step = self.step).entered();

        let pad = self.pattern.pad_token_id();
        let tokens: Vec<u32> = self
            .raw
            .iter()
            .map(|buffer| buffer.last().copied().unwrap_or(pad))
            .collect();
        let live = self.pattern.live_indices(self.step);
        let cached_before = self.caches.sequence_length().unwrap_or(0);

        tracing::trace!(
            "step {}: inputs={:?} live={:?} cached={}",
            self.step,
            tokens,
            live,
            cached_before
        );

        let predicted = match self
            .forward
            .predict(&tokens, self.caches, &self.conditioning)
        {
            Ok(predicted) => predicted,
            Err(source) => return Err(self.fail(source)),
        };
        if predicted.len() != self.pattern.num_codebooks() {
            let source = anyhow::anyhow!(
                "forward pass returned {} tokens for {} codebooks",
                predicted.len(),
                self.pattern.num_codebooks()
            );
            return Err(self.fail(source));
        }
        if let Some(vocab_size) = self.vocab_size {
            for (codebook, position) in live.iter().enumerate() {
                let token = predicted[codebook];
                let in_target = position.is_some_and(|p| p < self.target_length);
                if in_target && token as usize >= vocab_size {
                    let source = anyhow::anyhow!(
                        "codebook {} predicted token {} outside vocabulary of {}",
                        codebook,
                        token,
                        vocab_size
                    );
                    return Err(self.fail(source));
                }
            }
        }
        if !self.caches.is_empty() {
            match self.caches.sequence_length() {
                Some(len) if len > cached_before => {}
                other => {
                    let source = anyhow::anyhow!(
                        "layer caches did not advance together (before={}, after={:?})",
                        cached_before,
                        other
                    );
                    return Err(self.fail(source));
                }
            }
        }

        for (codebook, buffer) in self.raw.iter_mut().enumerate() {
            // Codebooks before their start, or past their last frame, hold pad
            let token = match live[codebook] {
                Some(position) if position < self.target_length => predicted[codebook],
                _ => pad,
            };
            buffer.push(token);
        }
        self.step += 1;

        if self.pattern.is_complete(self.step, self.target_length) {
            self.finish_completed();
        }
        Ok(self.report())
    }

    /// Step until the session completes or is cancelled, reporting progress
    /// after every step.
    pub fn run(&mut self, mut on_progress: impl FnMut(f32)) -> Result<GenerationOutcome> {
        loop {
            let report = self.step()?;
            on_progress(report.progress);
            match report.state {
                SessionState::Completed => {
                    return Ok(GenerationOutcome::Completed(
                        self.take_codes().unwrap_or_default(),
                    ))
                }
                SessionState::Cancelled => return Ok(GenerationOutcome::Cancelled),
                _ => {}
            }
        }
    }

    /// Take the aligned codes of a completed session (once).
    pub fn take_codes(&mut self) -> Option<Vec<Vec<u32>>> {
        self.aligned.take()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Forward-pass invocations completed so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn target_length(&self) -> usize {
        self.target_length
    }

    pub fn total_steps(&self) -> usize {
        self.pattern.total_steps(self.target_length)
    }

    pub fn pattern(&self) -> &DelayPattern {
        &self.pattern
    }

    /// Raw per-codebook buffers recorded so far, delay offsets included.
    pub fn raw_codes(&self) -> &[Vec<u32>] {
        &self.raw
    }

    pub fn progress(&self) -> f32 {
        match self.state {
            SessionState::Completed => 1.0,
            _ => (self.step as f32 / self.total_steps() as f32).min(0.99),
        }
    }

    fn report(&self) -> StepReport {
        StepReport {
            step: self.step,
            progress: self.progress(),
            state: self.state,
        }
    }

    fn finish_completed(&mut self) {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("reorder").entered();

        let aligned = self.pattern.reorder(&self.raw);
        debug_assert!(aligned.iter().all(|c| c.len() == self.target_length));
        self.caches.reset_all();
        self.raw.clear();
        self.aligned = Some(aligned);
        self.state = SessionState::Completed;
        tracing::info!(
            "Generation complete: {} frames in {} steps",
            self.target_length,
            self.step
        );
    }

    fn finish_cancelled(&mut self) {
        self.caches.reset_all();
        self.raw.clear();
        self.state = SessionState::Cancelled;
        tracing::info!("Generation cancelled after {} steps", self.step);
    }

    fn fail(&mut self, source: anyhow::Error) -> Error {
        self.caches.reset_all();
        self.raw.clear();
        self.state = SessionState::Failed;
        tracing::warn!("Generation failed at step {}: {:#}", self.step, source);
        Error::GenerationFailed {
            step: self.step,
            source,
        }
    }
}

impl<F: ForwardPass + ?Sized> Drop for GenerationSession<'_, F> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.caches.reset_all();
        }
    }
}
