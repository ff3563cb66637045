//! Token sampling for logits-producing forward passes.
//!
//! [`SampledForwardPass`] wraps a [`LogitsModel`] (anything that returns one
//! row of logits per codebook) and turns it into a [`ForwardPass`] by
//! applying classifier-free guidance, temperature, top-k / top-p filtering and
//! multinomial sampling. The codebook axis doubles as the batch axis, so all
//! codebooks are sampled in one call.
//!
//! Create a [`SamplingContext`] with a seed for reproducible outputs.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};

use super::session::ForwardPass;
use crate::models::kv_cache::LayerCaches;

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_INCREMENT: u64 = 1442695040888963407;

fn seeded_state(seed: u64) -> u64 {
    // Mix the seed so small seeds don't start in a degenerate state
    seed.wrapping_mul(2685821657736338717)
        .wrapping_add(PCG_INCREMENT)
}

/// RNG state for a single generation session.
///
/// Each session owns its context, so concurrent sessions never share
/// randomness. The same seed yields the same tokens across runs.
#[derive(Debug, Clone)]
pub struct SamplingContext {
    state: u64,
    seeded: bool,
    counter: u64,
}

impl SamplingContext {
    /// `Some(seed)` for deterministic sampling, `None` for time-based entropy.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self {
                state: seeded_state(s),
                seeded: true,
                counter: 0,
            },
            None => Self {
                state: 0,
                seeded: false,
                counter: 0,
            },
        }
    }

    /// Re-seed the context.
    pub fn reset(&mut self, seed: u64) {
        self.state = seeded_state(seed);
        self.seeded = true;
    }

    /// Uniform f32 in [0, 1).
    fn rand_f32(&mut self) -> f32 {
        if !self.seeded {
            use std::time::{SystemTime, UNIX_EPOCH};

            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64;
            let count = self.counter;
            self.counter += 1;

            let mixed = nanos
                .wrapping_add(count)
                .wrapping_mul(1103515245)
                .wrapping_add(12345);
            return ((mixed >> 40) as f32) / ((1u64 << 24) as f32);
        }

        // PCG XSH RR 64/32
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(PCG_INCREMENT);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let output = xorshifted.rotate_right(rot);

        // Top 24 bits keep the result strictly below 1.0 in f32
        ((output >> 8) as f32) / ((1u32 << 24) as f32)
    }
}

/// Sampling parameters for codebook tokens.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Sampling temperature (1.0 = unchanged, <0.01 = greedy)
    pub temperature: f64,
    /// Top-k sampling (0 = disabled)
    pub top_k: usize,
    /// Top-p (nucleus) threshold (1.0 = disabled)
    pub top_p: f64,
    /// Classifier-free guidance scale (1.0 = conditional logits only)
    pub guidance_scale: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 250,
            top_p: 1.0,
            guidance_scale: 3.0,
        }
    }
}

/// Sample one token per row of `logits`.
///
/// # Arguments
/// * `logits` - shape `[rows, vocab_size]`; one row per codebook
/// * `config` - sampling parameters
/// * `ctx` - session RNG
///
/// # Returns
/// Token indices of shape `[rows]`
pub fn sample(
    logits: &Tensor,
    config: &GenerationConfig,
    ctx: &mut SamplingContext,
) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let (_rows, vocab) = logits.dims2()?;
    if vocab == 0 {
        anyhow::bail!("cannot sample from an empty vocabulary");
    }

    if config.temperature < 0.01 {
        return greedy_sample(&logits);
    }

    let logits = if config.temperature != 1.0 {
        (logits / config.temperature)?
    } else {
        logits
    };

    let logits = if config.top_k > 0 {
        top_k_filter(&logits, config.top_k)?
    } else {
        logits
    };

    let logits = if config.top_p < 1.0 && config.top_p > 0.0 {
        top_p_filter(&logits, config.top_p)?
    } else {
        logits
    };

    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    multinomial_sample(&probs, ctx)
}

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
pub fn apply_guidance(conditional: &Tensor, unconditional: &Tensor, scale: f64) -> Result<Tensor> {
    let cond = conditional.to_dtype(DType::F32)?;
    let uncond = unconditional.to_dtype(DType::F32)?;
    Ok(cond.sub(&uncond)?.affine(scale, 0.0)?.add(&uncond)?)
}

/// Keep the top `k` logits per row, set the rest to -inf.
fn top_k_filter(logits: &Tensor, k: usize) -> Result<Tensor> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_k").entered();
    let (rows, vocab) = logits.dims2()?;
    let k = k.min(vocab);

    if logits.device().is_cpu() {
        let mut filtered = Vec::with_capacity(rows * vocab);
        for r in 0..rows {
            let row: Vec<f32> = logits.i(r)?.to_vec1()?;
            let mut sorted = row.clone();
            sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let threshold = sorted[k - 1];
            filtered.extend(
                row.iter()
                    .map(|&v| if v >= threshold { v } else { f32::NEG_INFINITY }),
            );
        }
        Ok(Tensor::new(filtered.as_slice(), logits.device())?.reshape((rows, vocab))?)
    } else {
        let (sorted, _) = logits.sort_last_dim(false)?;
        let threshold = sorted.narrow(1, k - 1, 1)?;
        let mask = logits.ge(&threshold.broadcast_as(logits.shape())?)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(mask.where_cond(logits, &neg_inf)?)
    }
}

/// Keep the smallest set of tokens per row whose cumulative probability
/// exceeds `p`.
fn top_p_filter(logits: &Tensor, p: f64) -> Result<Tensor> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_p").entered();
    let (rows, vocab) = logits.dims2()?;
    let mut filtered = Vec::with_capacity(rows * vocab);

    for r in 0..rows {
        let row: Vec<f32> = logits.i(r)?.to_vec1()?;
        let mut order: Vec<usize> = (0..vocab).collect();
        order.sort_unstable_by(|&a, &b| {
            row[b]
                .partial_cmp(&row[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let max_val = row[order[0]];
        let exp: Vec<f32> = order.iter().map(|&i| (row[i] - max_val).exp()).collect();
        let total: f32 = exp.iter().sum();

        let mut cumulative = 0.0f32;
        let mut cutoff = vocab;
        for (rank, e) in exp.iter().enumerate() {
            cumulative += e / total;
            if cumulative > p as f32 {
                cutoff = rank + 1;
                break;
            }
        }

        let mut kept = vec![f32::NEG_INFINITY; vocab];
        for &idx in &order[..cutoff] {
            kept[idx] = row[idx];
        }
        filtered.extend(kept);
    }

    Ok(Tensor::new(filtered.as_slice(), logits.device())?.reshape((rows, vocab))?)
}

/// Inverse-CDF sampling, one uniform draw per row.
fn multinomial_sample(probs: &Tensor, ctx: &mut SamplingContext) -> Result<Tensor> {
    let (rows, vocab) = probs.dims2()?;
    let cumsum = probs.cumsum(1)?;

    let uniform: Vec<f32> = (0..rows).map(|_| ctx.rand_f32()).collect();
    let uniform = Tensor::new(uniform.as_slice(), probs.device())?.unsqueeze(1)?;

    // First index where cumsum >= u: positions past the threshold keep their
    // 1-based index, the rest get vocab + 1, then argmin picks the first hit.
    let mask = cumsum.ge(&uniform.broadcast_as(cumsum.shape())?)?;
    let positions: Vec<f32> = (0..vocab).map(|i| i as f32 + 1.0).collect();
    let positions = Tensor::new(positions.as_slice(), probs.device())?
        .unsqueeze(0)?
        .broadcast_as(mask.shape())?;
    let large = Tensor::new(&[vocab as f32 + 1.0], probs.device())?.broadcast_as(mask.shape())?;
    let masked_positions = mask.where_cond(&positions, &large)?;

    Ok(masked_positions.argmin(D::Minus1)?)
}

/// Greedy sampling (argmax)
pub fn greedy_sample(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax(D::Minus1)?)
}

// ─── Logits-producing forward passes ────────────────────────────────────────

/// Per-codebook logits from one decoder step.
#[derive(Debug, Clone)]
pub struct CodebookLogits {
    /// `[num_codebooks, vocab]` logits conditioned on the prompt.
    pub conditional: Tensor,
    /// `[num_codebooks, vocab]` logits with null conditioning, present when
    /// the model runs the guidance batch.
    pub unconditional: Option<Tensor>,
}

/// A decoder that produces logits instead of token ids.
///
/// Same contract as [`ForwardPass::predict`]: every layer cache in `caches`
/// is read and extended exactly once per call, in layer order.
pub trait LogitsModel {
    fn logits(
        &mut self,
        tokens: &[u32],
        caches: &mut LayerCaches,
        conditioning: &Tensor,
    ) -> Result<CodebookLogits>;
}

/// Adapts a [`LogitsModel`] into a [`ForwardPass`] by sampling one token per
/// codebook.
pub struct SampledForwardPass<M> {
    model: M,
    config: GenerationConfig,
    ctx: SamplingContext,
}

impl<M: LogitsModel> SampledForwardPass<M> {
    pub fn new(model: M, config: GenerationConfig, seed: Option<u64>) -> Self {
        Self {
            model,
            config,
            ctx: SamplingContext::new(seed),
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Replace the sampling parameters and re-seed, e.g. between sessions.
    pub fn reconfigure(&mut self, config: GenerationConfig, seed: Option<u64>) {
        self.config = config;
        self.ctx = SamplingContext::new(seed);
    }
}

impl<M: LogitsModel> ForwardPass for SampledForwardPass<M> {
    fn predict(
        &mut self,
        tokens: &[u32],
        caches: &mut LayerCaches,
        conditioning: &Tensor,
    ) -> Result<Vec<u32>> {
        let out = self.model.logits(tokens, caches, conditioning)?;
        let logits = match &out.unconditional {
            Some(uncond) if (self.config.guidance_scale - 1.0).abs() > f64::EPSILON => {
                apply_guidance(&out.conditional, uncond, self.config.guidance_scale)?
            }
            _ => out.conditional,
        };
        let (rows, _vocab) = logits.dims2()?;
        if rows != tokens.len() {
            anyhow::bail!(
                "model returned logits for {} codebooks, expected {}",
                rows,
                tokens.len()
            );
        }

        let sampled = sample(&logits, &self.config, &mut self.ctx)?;
        Ok(sampled.to_dtype(DType::U32)?.to_vec1::<u32>()?)
    }
}
