//! # musicgen-delay
//!
//! Delayed multi-codebook decoding engine for
//! [MusicGen](https://huggingface.co/docs/transformers/model_doc/musicgen)-style
//! text-to-music models.
//!
//! MusicGen predicts several parallel streams of audio codec tokens, one per
//! EnCodec codebook. Codebook `c` is delayed by `c` steps so every codebook
//! can condition on the lower codebooks' tokens for the same audio frame.
//! This crate owns the parts of that loop that are independent of the
//! transformer math:
//!
//! - [`DelayPattern`]: which position each codebook emits at every step,
//!   when the run is complete, and the reorder back to time-aligned codes
//! - [`KvCache`] / [`LayerCaches`]: one append-only key/value cache per
//!   decoder layer, reset as a set between runs
//! - [`GenerationSession`]: the step-by-step driver with progress reporting
//!   and cooperative cancellation
//!
//! The transformer, text encoder and audio codec plug in through the
//! [`ForwardPass`] (or [`LogitsModel`]), [`TextConditioner`] and
//! [`AudioCodec`] traits.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use musicgen_delay::{
//!     CancelToken, GenerationOptions, MusicGen, MusicGenConfig, SampledForwardPass,
//! };
//!
//! let config = MusicGenConfig::from_file("musicgen-small/config.json")?;
//! let forward = SampledForwardPass::new(decoder, Default::default(), None);
//! let mut musicgen = MusicGen::new(config, forward, text_encoder, encodec)?;
//!
//! let options = GenerationOptions {
//!     duration_secs: 8.0,
//!     seed: Some(42),
//!     ..Default::default()
//! };
//! let cancel = CancelToken::new();
//! let audio = musicgen.synthesize("lo-fi beat with warm piano", &options, &cancel, |p| {
//!     println!("{:.0}%", p * 100.0);
//! })?;
//! ```
//!
//! ## Session lifecycle
//!
//! A session borrows the caches and the forward pass for its whole run.
//! Every terminal state (completed, cancelled, failed) resets the caches, so
//! the next run starts clean. Cancellation is a normal outcome
//! ([`GenerationOutcome::Cancelled`]), not an error.

pub mod codec;
pub mod error;
pub mod generation;
pub mod models;
pub mod profiling;

use candle_core::Tensor;
use std::time::Instant;

pub use codec::{codes_to_tensor, AudioBuffer, AudioCodec};
pub use error::{Error, Result};
pub use generation::{
    CancelToken, CodebookLogits, DelayPattern, ForwardPass, GenerationConfig, GenerationOutcome,
    GenerationSession, LogitsModel, SampledForwardPass, SamplingContext, SessionState, StepReport,
};
pub use models::config::{GenerationOptions, MusicGenConfig};
pub use models::kv_cache::{KvCache, LayerCaches};

/// Peak level generated audio is normalized to.
pub const PEAK_HEADROOM: f32 = 0.95;

/// Text encoder producing the conditioning tensor the decoder cross-attends to.
pub trait TextConditioner {
    fn condition(&mut self, prompt: &str) -> anyhow::Result<Tensor>;
}

impl<T: TextConditioner + ?Sized> TextConditioner for &mut T {
    fn condition(&mut self, prompt: &str) -> anyhow::Result<Tensor> {
        (**self).condition(prompt)
    }
}

impl<T: TextConditioner + ?Sized> TextConditioner for Box<T> {
    fn condition(&mut self, prompt: &str) -> anyhow::Result<Tensor> {
        (**self).condition(prompt)
    }
}

/// Text-to-music pipeline: conditioner, delayed decoder and codec around one
/// set of layer caches.
pub struct MusicGen<F, T, C> {
    config: MusicGenConfig,
    pattern: DelayPattern,
    caches: LayerCaches,
    forward: F,
    conditioner: T,
    codec: C,
}

impl<F, T, C> MusicGen<F, T, C>
where
    F: ForwardPass,
    T: TextConditioner,
    C: AudioCodec,
{
    pub fn new(config: MusicGenConfig, forward: F, conditioner: T, codec: C) -> Result<Self> {
        config.validate()?;
        let pattern = config.delay_pattern()?;
        let caches = config.new_layer_caches();
        tracing::info!(
            "MusicGen pipeline: {} codebooks, {} layers, {} Hz @ {} frames/s",
            pattern.num_codebooks(),
            caches.len(),
            config.audio_encoder.sampling_rate,
            config.audio_encoder.frame_rate()
        );
        Ok(Self {
            config,
            pattern,
            caches,
            forward,
            conditioner,
            codec,
        })
    }

    pub fn config(&self) -> &MusicGenConfig {
        &self.config
    }

    pub fn pattern(&self) -> &DelayPattern {
        &self.pattern
    }

    pub fn caches(&self) -> &LayerCaches {
        &self.caches
    }

    pub fn forward_pass(&self) -> &F {
        &self.forward
    }

    pub fn forward_pass_mut(&mut self) -> &mut F {
        &mut self.forward
    }

    pub fn conditioner(&self) -> &T {
        &self.conditioner
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Begin a step-by-step session. The session borrows this pipeline's
    /// caches and forward pass until it is dropped, and fails any step whose
    /// live prediction falls outside `decoder.vocab_size`.
    pub fn start(
        &mut self,
        target_length: usize,
        conditioning: Tensor,
    ) -> Result<GenerationSession<'_, F>> {
        let vocab_size = self.config.decoder.vocab_size;
        let session = GenerationSession::start(
            self.pattern,
            &mut self.caches,
            &mut self.forward,
            conditioning,
            target_length,
        )?;
        Ok(session.with_vocab_size(vocab_size))
    }

    /// Run a full session to completion or cancellation.
    pub fn generate_codes(
        &mut self,
        target_length: usize,
        conditioning: Tensor,
        cancel: &CancelToken,
        on_progress: impl FnMut(f32),
    ) -> Result<GenerationOutcome> {
        let mut session = self
            .start(target_length, conditioning)?
            .with_cancel_token(cancel.clone());
        session.run(on_progress)
    }

    /// Encode a prompt with the text conditioner.
    pub fn condition(&mut self, prompt: &str) -> Result<Tensor> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("condition").entered();

        self.conditioner.condition(prompt).map_err(Error::Conditioning)
    }

    /// Decode aligned codes to a peak-normalized waveform.
    pub fn decode(&mut self, codes: &[Vec<u32>]) -> Result<AudioBuffer> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("decode").entered();

        let frames = codes.first().map_or(0, Vec::len);
        if codes.iter().any(|tokens| tokens.len() != frames) {
            return Err(Error::precondition("codebooks must have equal lengths"));
        }
        let num_samples = self.config.num_samples(frames);
        let mut audio = self
            .codec
            .decode(codes, num_samples)
            .map_err(Error::Codec)?;
        audio.fit_to(num_samples);
        audio.normalize_peak(PEAK_HEADROOM);
        Ok(audio)
    }
}

impl<M, T, C> MusicGen<SampledForwardPass<M>, T, C>
where
    M: LogitsModel,
    T: TextConditioner,
    C: AudioCodec,
{
    /// Generate `options.duration_secs` of audio for `prompt`.
    ///
    /// Returns `Ok(None)` when `cancel` fires before the audio is decoded.
    /// This includes a cancel raised after generation has completed (from
    /// the final progress callback, say): the finished codes are discarded,
    /// not decoded. `on_progress` receives values in [0, 1], reaching 1.0
    /// only once generation has completed.
    pub fn synthesize(
        &mut self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancelToken,
        on_progress: impl FnMut(f32),
    ) -> Result<Option<AudioBuffer>> {
        let start = Instant::now();
        let target_length = self.config.target_length_for_duration(options.duration_secs)?;
        self.forward
            .reconfigure(options.to_gen_config(), options.seed);

        let conditioning = self.condition(prompt)?;
        let codes = match self.generate_codes(target_length, conditioning, cancel, on_progress)? {
            GenerationOutcome::Completed(codes) => codes,
            GenerationOutcome::Cancelled => {
                tracing::info!("Generation cancelled after {:.2?}", start.elapsed());
                return Ok(None);
            }
        };
        let generated = start.elapsed();

        if cancel.is_cancelled() {
            tracing::info!("Generation cancelled before decoding");
            return Ok(None);
        }
        let audio = self.decode(&codes)?;

        tracing::info!(
            "Synthesized {:.2}s of audio ({} frames) in {:.2?} (generation {:.2?})",
            audio.duration(),
            target_length,
            start.elapsed(),
            generated
        );
        Ok(Some(audio))
    }
}
