//! Integration tests for the delayed decoding engine
//!
//! These tests drive the full pipeline with mock decoders, conditioners and
//! codecs on the CPU.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, IndexOp, Tensor};
use musicgen_delay::{
    AudioBuffer, AudioCodec, CodebookLogits, LayerCaches, LogitsModel, TextConditioner,
};

const PAD: u32 = 2048;

/// Decoder mock: one-hot logits peaking at `(frame * 7 + codebook) % vocab`
/// for every codebook, one cache position appended per layer per call.
struct PeakLogits {
    vocab: usize,
    calls: usize,
    fail_at: Option<usize>,
    /// Inputs seen at every call
    seen: Arc<Mutex<Vec<Vec<u32>>>>,
}

impl PeakLogits {
    fn new(vocab: usize) -> Self {
        Self {
            vocab,
            calls: 0,
            fail_at: None,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl LogitsModel for PeakLogits {
    fn logits(
        &mut self,
        tokens: &[u32],
        caches: &mut LayerCaches,
        conditioning: &Tensor,
    ) -> anyhow::Result<CodebookLogits> {
        if self.fail_at == Some(self.calls) {
            anyhow::bail!("device lost");
        }
        self.seen.lock().unwrap().push(tokens.to_vec());

        let device = conditioning.device();
        let kv = Tensor::ones((1, 2, 1, 8), DType::F32, device)?;
        for layer in caches.iter_mut() {
            layer.update(&kv, &kv)?;
        }

        let mut data = vec![0f32; tokens.len() * self.vocab];
        for codebook in 0..tokens.len() {
            let frame = self.calls.saturating_sub(codebook);
            let peak = (frame * 7 + codebook) % self.vocab;
            data[codebook * self.vocab + peak] = 10.0;
        }
        self.calls += 1;

        let conditional = Tensor::from_vec(data, (tokens.len(), self.vocab), device)?;
        let unconditional = Tensor::zeros((tokens.len(), self.vocab), DType::F32, device)?;
        Ok(CodebookLogits {
            conditional,
            unconditional: Some(unconditional),
        })
    }
}

struct PromptLengthConditioner;

impl TextConditioner for PromptLengthConditioner {
    fn condition(&mut self, prompt: &str) -> anyhow::Result<Tensor> {
        if prompt.is_empty() {
            anyhow::bail!("empty prompt");
        }
        let len = prompt.split_whitespace().count().max(1);
        Ok(Tensor::zeros((1, len, 16), DType::F32, &Device::Cpu)?)
    }
}

/// Codec mock: a sawtooth of the requested length, remembering what it saw.
#[derive(Default)]
struct RecordingCodec {
    decoded: Vec<Vec<Vec<u32>>>,
}

impl AudioCodec for RecordingCodec {
    fn decode(&mut self, codes: &[Vec<u32>], num_samples: usize) -> anyhow::Result<AudioBuffer> {
        let tensor = musicgen_delay::codes_to_tensor(codes, &Device::Cpu)?;
        anyhow::ensure!(tensor.dims()[1] == codes.len(), "bad codebook axis");
        self.decoded.push(codes.to_vec());
        let samples = (0..num_samples).map(|i| ((i % 64) as f32 - 32.0) / 128.0).collect();
        Ok(AudioBuffer::new(samples, 32000))
    }
}

fn expected_codes(num_codebooks: usize, target_length: usize, vocab: usize) -> Vec<Vec<u32>> {
    (0..num_codebooks)
        .map(|c| {
            (0..target_length)
                .map(|frame| ((frame * 7 + c) % vocab) as u32)
                .collect()
        })
        .collect()
}

mod delay_tests {
    use super::PAD;
    use musicgen_delay::DelayPattern;

    #[test]
    fn test_four_codebook_scenario() {
        let pattern = DelayPattern::new(4, PAD).unwrap();
        assert_eq!(pattern.live_indices(0), vec![Some(0), None, None, None]);
        assert_eq!(
            pattern.live_indices(3),
            vec![Some(3), Some(2), Some(1), Some(0)]
        );
        assert!(!pattern.is_complete(12, 10));
        assert!(pattern.is_complete(13, 10));
        assert_eq!(pattern.total_steps(10), 13);
    }

    #[test]
    fn test_reorder_of_cancelled_run_is_empty_per_late_codebook() {
        let pattern = DelayPattern::new(4, PAD).unwrap();
        // Two lockstep steps: only codebooks 0 and 1 have started
        let raw = vec![vec![5, 6], vec![PAD, 9], vec![PAD, PAD], vec![PAD, PAD]];
        let stripped = pattern.strip_offsets(&raw);
        assert_eq!(stripped[0], vec![5, 6]);
        assert_eq!(stripped[1], vec![9]);
        assert!(stripped[2].is_empty() && stripped[3].is_empty());
        assert!(pattern.reorder(&raw).iter().all(Vec::is_empty));
    }
}

mod kv_cache_tests {
    use super::*;
    use musicgen_delay::KvCache;

    #[test]
    fn test_prefix_preserved_across_updates() {
        let device = Device::Cpu;
        let first = Tensor::randn(0f32, 1.0, (1, 4, 5, 64), &device).unwrap();
        let second = Tensor::randn(0f32, 1.0, (1, 4, 3, 64), &device).unwrap();

        let mut cache = KvCache::default();
        cache.update(&first, &first).unwrap();
        assert_eq!(cache.sequence_length(), 5);

        let (keys, values) = cache.update(&second, &second).unwrap();
        assert_eq!(cache.sequence_length(), 8);
        assert_eq!(keys.dims(), &[1, 4, 8, 64]);

        let flat = |t: &Tensor| -> Vec<f32> { t.flatten_all().unwrap().to_vec1().unwrap() };
        let prefix = flat(&keys.i((.., .., 0..5, ..)).unwrap());
        assert_eq!(prefix, flat(&first));

        let tail = flat(&values.i((.., .., 5..8, ..)).unwrap());
        assert_eq!(tail, flat(&second));
    }

    #[test]
    fn test_reset_twice() {
        let device = Device::Cpu;
        let kv = Tensor::zeros((1, 4, 2, 64), DType::F32, &device).unwrap();
        let mut caches = LayerCaches::new(3);
        for layer in caches.iter_mut() {
            layer.update(&kv, &kv).unwrap();
        }
        assert_eq!(caches.sequence_length(), Some(2));
        caches.reset_all();
        caches.reset_all();
        assert_eq!(caches.sequence_length(), Some(0));
        assert!(caches.iter().all(KvCache::is_empty));
    }
}

mod session_tests {
    use super::*;
    use musicgen_delay::{
        CancelToken, DelayPattern, Error, GenerationConfig, GenerationOutcome, GenerationSession,
        SampledForwardPass, SessionState,
    };

    fn greedy() -> GenerationConfig {
        GenerationConfig {
            temperature: 0.0,
            ..Default::default()
        }
    }

    fn conditioning() -> Tensor {
        Tensor::zeros((1, 3, 16), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_run_to_completion_yields_target_length() {
        for (k, target) in [(1, 5), (4, 10), (8, 3)] {
            let pattern = DelayPattern::new(k, PAD).unwrap();
            let mut caches = LayerCaches::new(3);
            let mut forward = SampledForwardPass::new(PeakLogits::new(64), greedy(), Some(1));
            let mut session =
                GenerationSession::start(pattern, &mut caches, &mut forward, conditioning(), target)
                    .unwrap();
            let outcome = session.run(|_| {}).unwrap();
            assert_eq!(session.step_count(), target + k - 1);
            assert_eq!(session.state(), SessionState::Completed);
            drop(session);

            assert_eq!(outcome, GenerationOutcome::Completed(expected_codes(k, target, 64)));
            assert_eq!(caches.sequence_length(), Some(0));
        }
    }

    #[test]
    fn test_inputs_are_previous_step_tokens() {
        let pattern = DelayPattern::new(3, PAD).unwrap();
        let model = PeakLogits::new(64);
        let seen = model.seen.clone();
        let mut caches = LayerCaches::new(2);
        let mut forward = SampledForwardPass::new(model, greedy(), None);
        let mut session =
            GenerationSession::start(pattern, &mut caches, &mut forward, conditioning(), 2)
                .unwrap();
        session.run(|_| {}).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], vec![PAD, PAD, PAD]);
        // Step 0 produced frame 0 for codebook 0 only
        assert_eq!(seen[1], vec![0, PAD, PAD]);
        assert_eq!(seen[2], vec![7, 1, PAD]);
        // Codebook 0 finished after two frames and holds pad from then on
        assert_eq!(seen[3], vec![PAD, 8, 2]);
    }

    #[test]
    fn test_cancel_from_progress_callback() {
        let pattern = DelayPattern::new(4, PAD).unwrap();
        let mut caches = LayerCaches::new(2);
        let mut forward = SampledForwardPass::new(PeakLogits::new(64), greedy(), None);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let mut session =
            GenerationSession::start(pattern, &mut caches, &mut forward, conditioning(), 20)
                .unwrap()
                .with_cancel_token(cancel);

        let mut reports = Vec::new();
        let outcome = session
            .run(|progress| {
                reports.push(progress);
                if reports.len() == 3 {
                    remote.cancel();
                }
            })
            .unwrap();
        assert_eq!(outcome, GenerationOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(session.step_count(), 3);
        assert!(reports.iter().all(|&p| p < 1.0));
        assert!(session.step().is_err());
        drop(session);
        assert_eq!(caches.sequence_length(), Some(0));
    }

    #[test]
    fn test_forward_failure_is_distinct_from_cancel() {
        let pattern = DelayPattern::new(4, PAD).unwrap();
        let mut caches = LayerCaches::new(2);
        let mut model = PeakLogits::new(64);
        model.fail_at = Some(5);
        let mut forward = SampledForwardPass::new(model, greedy(), None);
        let mut session =
            GenerationSession::start(pattern, &mut caches, &mut forward, conditioning(), 10)
                .unwrap();

        let err = session.run(|_| {}).unwrap_err();
        match &err {
            Error::GenerationFailed { step, source } => {
                assert_eq!(*step, 5);
                assert!(source.to_string().contains("device lost"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_generation_failure());
        assert_eq!(session.state(), SessionState::Failed);
        drop(session);
        assert_eq!(caches.sequence_length(), Some(0));
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let run = |seed| {
            let pattern = DelayPattern::new(4, PAD).unwrap();
            let mut caches = LayerCaches::new(1);
            let config = GenerationConfig {
                temperature: 1.5,
                top_k: 0,
                guidance_scale: 1.0,
                ..Default::default()
            };
            let mut forward = SampledForwardPass::new(PeakLogits::new(16), config, Some(seed));
            let mut session =
                GenerationSession::start(pattern, &mut caches, &mut forward, conditioning(), 6)
                    .unwrap();
            session.run(|_| {}).unwrap()
        };
        assert_eq!(run(42), run(42));
    }
}

mod pipeline_tests {
    use super::*;
    use musicgen_delay::{
        CancelToken, Error, GenerationConfig, GenerationOptions, MusicGen, MusicGenConfig,
        SampledForwardPass, PEAK_HEADROOM,
    };

    fn pipeline(
        model: PeakLogits,
    ) -> MusicGen<SampledForwardPass<PeakLogits>, PromptLengthConditioner, RecordingCodec> {
        let config = MusicGenConfig::from_json_str(
            r#"{"decoder": {"num_codebooks": 4, "pad_token_id": 2048, "num_hidden_layers": 3}}"#,
        )
        .unwrap();
        let forward = SampledForwardPass::new(model, GenerationConfig::default(), None);
        MusicGen::new(config, forward, PromptLengthConditioner, RecordingCodec::default()).unwrap()
    }

    fn greedy_options(duration_secs: f64) -> GenerationOptions {
        GenerationOptions {
            duration_secs,
            temperature: 0.0,
            seed: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_synthesize_end_to_end() {
        let mut musicgen = pipeline(PeakLogits::new(2048));
        let mut progress = Vec::new();
        let audio = musicgen
            .synthesize("ambient synth pad", &greedy_options(0.2), &CancelToken::new(), |p| {
                progress.push(p)
            })
            .unwrap()
            .unwrap();

        // 0.2s at 50 frames/s
        assert_eq!(progress.len(), 10 + 3);
        assert_eq!(progress.last().copied(), Some(1.0));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress[..progress.len() - 1].iter().all(|&p| p <= 0.99));

        assert_eq!(audio.sample_rate, 32000);
        assert_eq!(audio.len(), 10 * 640);
        assert!((audio.peak() - PEAK_HEADROOM).abs() < 1e-6);

        let decoded = &musicgen.codec().decoded;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], expected_codes(4, 10, 2048));
        assert_eq!(musicgen.caches().sequence_length(), Some(0));
    }

    #[test]
    fn test_synthesize_cancelled_returns_none() {
        let mut musicgen = pipeline(PeakLogits::new(2048));
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let result = musicgen
            .synthesize("jazz trio", &greedy_options(1.0), &cancel, |p| {
                if p > 0.2 {
                    remote.cancel();
                }
            })
            .unwrap();
        assert!(result.is_none());
        assert_eq!(musicgen.caches().sequence_length(), Some(0));
    }

    #[test]
    fn test_synthesize_cancel_after_completion_returns_none() {
        let mut musicgen = pipeline(PeakLogits::new(2048));
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let mut last = 0.0;
        let result = musicgen
            .synthesize("string quartet", &greedy_options(0.2), &cancel, |p| {
                last = p;
                if p >= 1.0 {
                    remote.cancel();
                }
            })
            .unwrap();
        assert_eq!(last, 1.0);
        assert!(result.is_none());
        assert!(musicgen.codec().decoded.is_empty());
        assert_eq!(musicgen.caches().sequence_length(), Some(0));
    }

    #[test]
    fn test_synthesize_reports_generation_failure() {
        let mut model = PeakLogits::new(2048);
        model.fail_at = Some(2);
        let mut musicgen = pipeline(model);
        let err = musicgen
            .synthesize("metal riff", &greedy_options(0.5), &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::GenerationFailed { step: 2, .. }));
        assert_eq!(musicgen.caches().sequence_length(), Some(0));
    }

    #[test]
    fn test_synthesize_conditioning_failure() {
        let mut musicgen = pipeline(PeakLogits::new(2048));
        let err = musicgen
            .synthesize("", &greedy_options(0.5), &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Conditioning(_)));
    }

    #[test]
    fn test_synthesize_rejects_bad_duration() {
        let mut musicgen = pipeline(PeakLogits::new(2048));
        let err = musicgen
            .synthesize("anything", &greedy_options(0.0), &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_pipeline_runs_back_to_back() {
        let mut musicgen = pipeline(PeakLogits::new(2048));
        for _ in 0..2 {
            let audio = musicgen
                .synthesize("two takes", &greedy_options(0.1), &CancelToken::new(), |_| {})
                .unwrap()
                .unwrap();
            assert_eq!(audio.len(), 5 * 640);
        }
    }
}
