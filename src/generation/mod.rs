//! Delayed multi-codebook generation
//!
//! This module provides:
//! - The delay pattern scheduler ([`DelayPattern`])
//! - The autoregressive driver loop ([`GenerationSession`]) and the
//!   [`ForwardPass`] seam it drives
//! - Sampling strategies (greedy, top-k, top-p, temperature, classifier-free
//!   guidance) for logits-producing decoders
//! - Per-session RNG via [`SamplingContext`] for reproducible generation

pub mod delay;
mod sampling;
pub mod session;

pub use delay::DelayPattern;
pub use sampling::{
    apply_guidance, greedy_sample, sample, CodebookLogits, GenerationConfig, LogitsModel,
    SampledForwardPass, SamplingContext,
};
pub use session::{
    CancelToken, ForwardPass, GenerationOutcome, GenerationSession, SessionState, StepReport,
};
