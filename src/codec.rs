//! Audio codec seam and waveform buffer.
//!
//! Generation produces time-aligned codes, one sequence per codebook. An
//! [`AudioCodec`] (EnCodec for MusicGen) turns them into samples.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Decoder from aligned codebook tokens to a waveform.
pub trait AudioCodec {
    /// Decode `codes` (one equal-length sequence per codebook, in codebook
    /// order) into roughly `num_samples` mono samples.
    fn decode(&mut self, codes: &[Vec<u32>], num_samples: usize) -> anyhow::Result<AudioBuffer>;
}

impl<C: AudioCodec + ?Sized> AudioCodec for &mut C {
    fn decode(&mut self, codes: &[Vec<u32>], num_samples: usize) -> anyhow::Result<AudioBuffer> {
        (**self).decode(codes, num_samples)
    }
}

impl<C: AudioCodec + ?Sized> AudioCodec for Box<C> {
    fn decode(&mut self, codes: &[Vec<u32>], num_samples: usize) -> anyhow::Result<AudioBuffer> {
        (**self).decode(codes, num_samples)
    }
}

/// Audio buffer holding raw waveform data.
///
/// Samples are mono 32-bit floats, nominally in \[-1.0, 1.0\].
///
/// # Example
///
/// ```rust,ignore
/// let mut audio = codec.decode(&codes, config.num_samples(codes[0].len()))?;
/// audio.normalize_peak(0.95);
/// println!("Duration: {:.2}s", audio.duration());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Mono audio samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz (32000 for MusicGen's EnCodec)
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }

    /// Scale so the loudest sample sits at `headroom` (e.g. 0.95). Silent
    /// buffers are left untouched.
    pub fn normalize_peak(&mut self, headroom: f32) {
        let peak = self.peak();
        if peak > 0.0 && peak.is_finite() {
            let scale = headroom / peak;
            for sample in &mut self.samples {
                *sample *= scale;
            }
        }
    }

    /// Cut or zero-pad to exactly `num_samples`.
    pub fn fit_to(&mut self, num_samples: usize) {
        self.samples.resize(num_samples, 0.0);
    }
}

/// Convert aligned codes into the codec's `[1, num_codebooks, T]` layout.
///
/// Every codebook must hold the same number of frames.
pub fn codes_to_tensor(codes: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let num_codebooks = codes.len();
    if num_codebooks == 0 {
        return Err(Error::precondition("no codebooks to decode"));
    }
    let num_frames = codes[0].len();
    if let Some((codebook, tokens)) = codes
        .iter()
        .enumerate()
        .find(|(_, tokens)| tokens.len() != num_frames)
    {
        return Err(Error::precondition(format!(
            "codebook {codebook} has {} frames, codebook 0 has {num_frames}",
            tokens.len()
        )));
    }

    let data: Vec<u32> = codes.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(data, (1, num_codebooks, num_frames), device)?)
}
