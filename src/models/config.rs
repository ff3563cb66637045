//! Model configuration for MusicGen-style checkpoints
//!
//! [`MusicGenConfig`] reads the subset of a HuggingFace `config.json` that the
//! decoding engine needs: the decoder's codebook count, pad token and layer
//! count, and the audio codec's sample/frame rate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::generation::{DelayPattern, GenerationConfig};
use crate::models::kv_cache::LayerCaches;

/// Top-level MusicGen configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MusicGenConfig {
    /// Autoregressive token decoder
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// Audio codec (EnCodec) that turns codes into waveforms
    #[serde(default)]
    pub audio_encoder: AudioEncoderConfig,
}

/// Decoder (token generator) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Number of parallel codebooks
    #[serde(default = "default_num_codebooks")]
    pub num_codebooks: usize,

    /// Token fed for codebook positions that are not live
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,

    /// Number of transformer decoder layers (one KV cache each)
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Codebook vocabulary size; live predictions must fall below it
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Maximum sequence length the decoder was trained for
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

/// Audio codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    /// Output sample rate in Hz
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,

    /// Codec frames per second. Derived from `upsampling_ratios` when absent.
    #[serde(default)]
    pub frame_rate: Option<u32>,

    /// Decoder upsampling ratios; their product is the hop length
    #[serde(default = "default_upsampling_ratios")]
    pub upsampling_ratios: Vec<u32>,
}

// Defaults matching facebook/musicgen-small
fn default_num_codebooks() -> usize {
    4
}

fn default_pad_token_id() -> u32 {
    2048
}

fn default_num_hidden_layers() -> usize {
    24
}

fn default_vocab_size() -> usize {
    2048
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_sampling_rate() -> u32 {
    32000
}

fn default_upsampling_ratios() -> Vec<u32> {
    vec![8, 5, 4, 4]
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            num_codebooks: default_num_codebooks(),
            pad_token_id: default_pad_token_id(),
            num_hidden_layers: default_num_hidden_layers(),
            vocab_size: default_vocab_size(),
            max_position_embeddings: default_max_position_embeddings(),
        }
    }
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            frame_rate: None,
            upsampling_ratios: default_upsampling_ratios(),
        }
    }
}

impl AudioEncoderConfig {
    /// Codec frames per second: explicit `frame_rate`, else
    /// `ceil(sampling_rate / prod(upsampling_ratios))`.
    pub fn frame_rate(&self) -> u32 {
        self.frame_rate.unwrap_or_else(|| {
            let hop: u32 = self.upsampling_ratios.iter().product::<u32>().max(1);
            self.sampling_rate.div_ceil(hop)
        })
    }
}

impl MusicGenConfig {
    /// Load configuration from a local `config.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Reading model config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse and validate configuration JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.decoder.num_codebooks == 0 {
            return Err(Error::Config("decoder.num_codebooks must be > 0".into()));
        }
        if self.decoder.vocab_size == 0 {
            return Err(Error::Config("decoder.vocab_size must be > 0".into()));
        }
        if self.audio_encoder.sampling_rate == 0 || self.audio_encoder.frame_rate() == 0 {
            return Err(Error::Config(
                "audio_encoder sample and frame rates must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Scheduler for this model's codebooks.
    pub fn delay_pattern(&self) -> Result<DelayPattern> {
        DelayPattern::new(self.decoder.num_codebooks, self.decoder.pad_token_id)
    }

    /// One empty KV cache per decoder layer.
    pub fn new_layer_caches(&self) -> LayerCaches {
        LayerCaches::new(self.decoder.num_hidden_layers)
    }

    /// Longest target length whose delayed sequence fits the decoder's
    /// position budget.
    pub fn max_target_length(&self) -> usize {
        (self.decoder.max_position_embeddings + 1).saturating_sub(self.decoder.num_codebooks)
    }

    /// Frames per codebook for `duration_secs` of audio.
    pub fn target_length_for_duration(&self, duration_secs: f64) -> Result<usize> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(Error::Config(format!(
                "duration must be positive, got {duration_secs}"
            )));
        }
        let frames = (duration_secs * self.audio_encoder.frame_rate() as f64) as usize;
        if frames == 0 {
            return Err(Error::Config(format!(
                "duration {duration_secs}s is shorter than one codec frame"
            )));
        }
        let max = self.max_target_length();
        if frames > max {
            return Err(Error::Config(format!(
                "duration {duration_secs}s needs {frames} frames, model supports at most {max}"
            )));
        }
        Ok(frames)
    }

    /// Audio samples the codec produces for `target_length` frames.
    pub fn num_samples(&self, target_length: usize) -> usize {
        let rate = &self.audio_encoder;
        target_length * rate.sampling_rate as usize / rate.frame_rate() as usize
    }
}

/// Options for one music generation request
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Length of audio to generate, in seconds
    pub duration_secs: f64,
    /// Sampling temperature (higher = more random)
    pub temperature: f64,
    /// Top-k sampling
    pub top_k: usize,
    /// Top-p (nucleus) sampling, 1.0 = disabled
    pub top_p: f64,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
    /// Random seed for deterministic generation. `None` = non-deterministic.
    pub seed: Option<u64>,
}

impl GenerationOptions {
    /// Sampling parameters for the generation loop.
    pub fn to_gen_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            guidance_scale: self.guidance_scale,
        }
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        let sampling = GenerationConfig::default();
        Self {
            duration_secs: 10.0,
            temperature: sampling.temperature,
            top_k: sampling.top_k,
            top_p: sampling.top_p,
            guidance_scale: sampling.guidance_scale,
            seed: None,
        }
    }
}
