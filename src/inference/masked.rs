//! Iterative masked denoising of all RVQ levels at once.
//!
//! The canvas starts fully masked. Each step re-masks the least confident
//! positions on a cosine schedule, predicts every masked cell in parallel
//! and keeps the rest. Confidence is the peak probability of the raw row,
//! free of temperature and history penalties.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::progress::{stage, Progress};
use super::{check_batch, require_stateless, restrict_classes, tail_rows};
use crate::data::{BatchItem, Codes};
use crate::error::DecodeError;
use crate::generation::sampling::{logits_rows, sample_row};
use crate::generation::{fuse_output, CfgGuidance, SamplingContext, SamplingPolicy};
use crate::models::{ModelInput, SequenceModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaskedOptions {
    /// Steps over the full `[0, 1]` schedule; scaled by the denoise window
    pub max_steps: usize,
    pub min_duration: usize,
    pub max_duration: usize,
    pub sampling: SamplingPolicy,
    pub cfg_strength: f64,
    /// Guidance never drops below this before annealing
    pub minimum_cfg_strength: f64,
    pub cfg_rescale: f64,
    pub denoise_start: f64,
    pub denoise_end: f64,
    /// Re-open a small fraction of resolved positions every step
    pub remasking: bool,
    /// Ramp temperature and guidance down with `1 - timestep`
    pub annealed_sampling: bool,
    /// Starting confidence of positions seeded from a reference
    pub vc_threshold: f32,
    /// Fraction of seeded positions left fully open
    pub vc_mask_p: f64,
}

impl Default for MaskedOptions {
    fn default() -> Self {
        Self {
            max_steps: 25,
            min_duration: 1,
            max_duration: 500,
            sampling: SamplingPolicy::greedy(),
            cfg_strength: 2.5,
            minimum_cfg_strength: 2.5,
            cfg_rescale: 0.75,
            denoise_start: 0.0,
            denoise_end: 1.0,
            remasking: true,
            annealed_sampling: true,
            vc_threshold: 0.25,
            vc_mask_p: 0.25,
        }
    }
}

impl MaskedOptions {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(DecodeError::InvalidInput(msg).into()) };
        if self.max_steps == 0 {
            return invalid("masked decode needs max_steps >= 1".into());
        }
        if self.min_duration > self.max_duration {
            return invalid(format!(
                "min_duration {} exceeds max_duration {}",
                self.min_duration, self.max_duration
            ));
        }
        if !(0.0..=1.0).contains(&self.denoise_start)
            || !(0.0..=1.0).contains(&self.denoise_end)
            || self.denoise_start > self.denoise_end
        {
            return invalid(format!(
                "denoise window [{}, {}] must lie ordered within [0, 1]",
                self.denoise_start, self.denoise_end
            ));
        }
        require_stateless(&self.sampling, stage::MASKED)
    }

    /// Steps actually run for this denoise window.
    pub fn scheduled_steps(&self) -> usize {
        let window = (self.denoise_end - self.denoise_start).clamp(0.0, 1.0);
        ((self.max_steps as f64 * window).floor() as usize).max(1)
    }

    /// `scheduled_steps` timesteps linearly spaced over the denoise window.
    pub fn timesteps(&self) -> Vec<f64> {
        let steps = self.scheduled_steps();
        if steps == 1 {
            return vec![self.denoise_start];
        }
        let span = self.denoise_end - self.denoise_start;
        (0..steps)
            .map(|k| self.denoise_start + span * k as f64 / (steps - 1) as f64)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskedOutput {
    pub sequences: Vec<Codes>,
    /// Masked positions per step, per item
    pub masked_counts: Vec<Vec<usize>>,
}

/// Positions to re-mask: the `count` highest scores, ties by position.
fn select_masked(scores: &[f32], count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(count);
    order
}

/// Largest softmax probability of a logits row.
fn peak_probability(row: &[f32]) -> f32 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return 0.0;
    }
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    1.0 / sum
}

/// Denoise a canvas of `target_len` frames per item.
///
/// An item's `response`, when present, seeds the canvas as a
/// voice-conversion reference.
pub fn decode_masked<M: SequenceModel>(
    model: &mut M,
    batch: &[BatchItem],
    opts: &MaskedOptions,
    ctx: &mut SamplingContext,
    progress: &mut dyn Progress,
) -> Result<MaskedOutput> {
    check_batch(batch)?;
    opts.validate()?;
    let config = model.config().clone();
    let levels = config.n_resp_levels;
    let mask = config.mask_token;

    let lens: Vec<usize> = batch
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.target_len
                .map(|len| len.clamp(opts.min_duration.max(1), opts.max_duration.max(1)))
                .ok_or_else(|| {
                    DecodeError::InvalidInput(format!("masked item {i} has no target length"))
                })
        })
        .collect::<std::result::Result<_, _>>()?;

    let mut canvas: Vec<Codes> = lens.iter().map(|&len| Codes::filled(len, levels, mask)).collect();
    let mut scores: Vec<Vec<f32>> = lens.iter().map(|&len| vec![1.0; len]).collect();

    for (i, item) in batch.iter().enumerate() {
        let Some(reference) = item.response.as_ref() else {
            continue;
        };
        let frames = reference.len().min(lens[i]);
        for t in 0..frames {
            for l in 0..reference.levels().min(levels) {
                canvas[i].set(t, l, reference.get(t, l));
            }
            if !ctx.bernoulli(opts.vc_mask_p) {
                scores[i][t] = opts.vc_threshold;
            }
        }
        tracing::debug!(item = i, frames, "seeded canvas from reference");
    }

    let timesteps = opts.timesteps();
    let steps = timesteps.len();
    let base_cfg = opts.cfg_strength.max(opts.minimum_cfg_strength);
    let remask_p = if opts.remasking {
        1.0 / (2.0 * steps as f64)
    } else {
        0.0
    };
    let mut masked_counts: Vec<Vec<usize>> = vec![Vec::with_capacity(steps); batch.len()];

    tracing::info!(items = batch.len(), ?lens, steps, cfg = base_cfg, "masked NAR decode");
    model.enable_adapter(Some(0))?;

    #[cfg(feature = "profiling")]
    let _loop_span = tracing::info_span!("masked_loop").entered();

    for (k, &timestep) in timesteps.iter().enumerate() {
        if !progress.step(stage::MASKED, k, steps) {
            model.enable_adapter(None)?;
            return Err(DecodeError::Cancelled.into());
        }

        let annealing = 1.0 - timestep;
        let noise_p = (timestep * std::f64::consts::FRAC_PI_2).cos();
        let (temperature, strength) = if opts.annealed_sampling {
            let mut t = opts.sampling.temperature * annealing;
            if opts.sampling.min_temperature >= 0.0 {
                t = t.max(opts.sampling.min_temperature);
            }
            (t, base_cfg * annealing)
        } else {
            (opts.sampling.temperature, base_cfg)
        };
        let policy = opts.sampling.with_temperature(temperature);

        let previous = canvas.clone();
        for (i, codes) in canvas.iter_mut().enumerate() {
            let len = lens[i];
            let count = ((noise_p * len as f64 + remask_p * len as f64) as usize).clamp(1, len);
            for t in select_masked(&scores[i], count) {
                for l in 0..levels {
                    codes.set(t, l, mask);
                }
            }
            let masked = codes.frames().filter(|f| f.contains(&mask)).count();
            masked_counts[i].push(masked);
        }

        let inputs: Vec<ModelInput> = batch
            .iter()
            .zip(&canvas)
            .map(|(item, codes)| {
                let mut input = ModelInput::from_item(item, 0);
                input.response = Some(codes.clone());
                input.timestep = Some(timestep as f32);
                input
            })
            .collect();
        let output = model.forward(&inputs, None)?;
        let mut logits = output.logits;
        if strength > 0.0 {
            let null_inputs: Vec<ModelInput> = inputs
                .iter()
                .map(|input| input.unconditional(config.text_bos, config.text_eos))
                .collect();
            let null_output = model.forward(&null_inputs, None)?;
            let guidance = CfgGuidance::new(strength, opts.cfg_rescale);
            logits = fuse_output(&logits, &null_output.logits, guidance, &lens)?;
        }
        if logits.len() != batch.len() {
            bail!("model returned {} items for {} inputs", logits.len(), batch.len());
        }

        for (i, item_logits) in logits.iter().enumerate() {
            if item_logits.len() < levels {
                bail!(
                    "masked decode needs logits for {levels} levels, item {i} has {}",
                    item_logits.len()
                );
            }
            let len = lens[i];
            let mut level_scores = vec![0f32; len];
            for (l, tensor) in item_logits.iter().take(levels).enumerate() {
                let tensor = restrict_classes(&tail_rows(tensor, len)?, config.n_audio_tokens)?;
                let history: Vec<u32> = previous[i]
                    .level(l)
                    .into_iter()
                    .filter(|&tok| tok != mask)
                    .collect();
                for (t, row) in logits_rows(&tensor)?.into_iter().enumerate() {
                    if canvas[i].get(t, l) != mask {
                        continue;
                    }
                    let confidence = peak_probability(&row);
                    let (token, _) = sample_row(row, &history, &policy, ctx)?;
                    canvas[i].set(t, l, token);
                    level_scores[t] += 1.0 - confidence;
                }
            }
            scores[i] = level_scores.into_iter().map(|s| s / levels as f32).collect();
        }
        tracing::debug!(step = k, timestep, temperature, strength, "denoise step");
    }
    progress.finish(stage::MASKED);
    model.enable_adapter(None)?;

    Ok(MaskedOutput {
        sequences: canvas,
        masked_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::progress::NoProgress;
    use crate::models::{ModelConfig, ModelOutput};
    use candle_core::{Device, Tensor};

    /// Predicts `(t + l) % 7` everywhere, with the mask token as a strong
    /// distractor that must never be sampled.
    struct Painter {
        config: ModelConfig,
    }

    impl SequenceModel for Painter {
        type State = ();

        fn config(&self) -> &ModelConfig {
            &self.config
        }

        fn forward(&self, inputs: &[ModelInput], _: Option<()>) -> Result<ModelOutput<()>> {
            let classes = self.config.n_audio_tokens + 2;
            let logits = inputs
                .iter()
                .map(|input| {
                    assert!(input.timestep.is_some());
                    let len = input.response.as_ref().map_or(0, Codes::len);
                    (0..self.config.n_resp_levels)
                        .map(|l| {
                            let mut data = vec![0f32; len * classes];
                            for t in 0..len {
                                data[t * classes + (t + l) % 7] = 3.0 + t as f32 * 0.1;
                                data[t * classes + self.config.mask_token as usize] = 50.0;
                            }
                            Tensor::from_vec(data, (len, classes), &Device::Cpu).unwrap()
                        })
                        .collect()
                })
                .collect();
            Ok(ModelOutput { logits, state: None })
        }
    }

    fn painter() -> Painter {
        Painter {
            config: ModelConfig {
                n_resp_levels: 3,
                n_audio_tokens: 16,
                stop_token: 16,
                mask_token: 17,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_schedule() {
        let opts = MaskedOptions::default();
        assert_eq!(opts.scheduled_steps(), 25);
        let ts = opts.timesteps();
        assert_eq!(ts.first(), Some(&0.0));
        assert!((ts[24] - 1.0).abs() < 1e-9);

        let window = MaskedOptions {
            denoise_start: 0.5,
            ..Default::default()
        };
        assert_eq!(window.scheduled_steps(), 12);
        assert!((window.timesteps()[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_select_masked_picks_highest_scores() {
        let picked = select_masked(&[0.1, 0.9, 0.5, 0.9], 2);
        assert_eq!(picked, vec![1, 3]);
    }

    #[test]
    fn test_canvas_fully_resolved() {
        let mut model = painter();
        let item = BatchItem::tts(vec![1, 2], Codes::filled(4, 3, 0)).with_target_len(12);
        let mut ctx = SamplingContext::new(Some(0));
        let out = decode_masked(
            &mut model,
            &[item],
            &MaskedOptions::default(),
            &mut ctx,
            &mut NoProgress,
        )
        .unwrap();
        let codes = &out.sequences[0];
        assert_eq!(codes.len(), 12);
        assert_eq!(codes.levels(), 3);
        assert!(!codes.contains(17));
        assert_eq!(codes.get(5, 1), 6);
        assert_eq!(codes.get(6, 2), 1);

        let counts = &out.masked_counts[0];
        assert_eq!(counts.len(), 25);
        assert_eq!(counts[0], 12);
        assert!(counts.iter().all(|&c| c >= 1));
        // beyond the remask fraction, the masked count never grows
        let remask = (12.0 / 50.0f64).ceil() as usize + 1;
        for pair in counts.windows(2) {
            assert!(pair[1] <= pair[0] + remask);
        }
    }

    #[test]
    fn test_duration_clamp_and_missing_length() {
        let mut model = painter();
        let mut ctx = SamplingContext::new(Some(0));
        let opts = MaskedOptions {
            max_duration: 5,
            max_steps: 4,
            ..Default::default()
        };
        let long = BatchItem::tts(vec![1, 2], Codes::filled(4, 3, 0)).with_target_len(80);
        let out = decode_masked(&mut model, &[long], &opts, &mut ctx, &mut NoProgress).unwrap();
        assert_eq!(out.sequences[0].len(), 5);

        let no_len = BatchItem::tts(vec![1, 2], Codes::filled(4, 3, 0));
        let err = decode_masked(&mut model, &[no_len], &opts, &mut ctx, &mut NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_vc_seed_survives_late_window() {
        let mut model = painter();
        let mut ctx = SamplingContext::new(Some(3));
        let reference = Codes::filled(8, 3, 11);
        let item = BatchItem::tts(vec![1, 2], Codes::filled(4, 3, 0))
            .with_target_len(8)
            .with_response(reference);
        let opts = MaskedOptions {
            denoise_start: 0.9,
            max_steps: 20,
            remasking: false,
            vc_mask_p: 0.0,
            ..Default::default()
        };
        let out = decode_masked(&mut model, &[item], &opts, &mut ctx, &mut NoProgress).unwrap();
        let codes = &out.sequences[0];
        assert!(!codes.contains(17));
        // cos(0.9 * pi/2) * 8 rounds down to 1 position per step
        let kept = codes.frames().filter(|f| f.iter().all(|&v| v == 11)).count();
        assert!(kept >= 8 - out.masked_counts[0].len());
    }

    #[test]
    fn test_rejects_inverted_duration_bounds() {
        let mut model = painter();
        let mut ctx = SamplingContext::new(Some(0));
        let item = BatchItem::tts(vec![1, 2], Codes::filled(4, 3, 0)).with_target_len(30);
        let opts = MaskedOptions {
            min_duration: 50,
            max_duration: 10,
            ..Default::default()
        };
        let err = decode_masked(&mut model, &[item.clone()], &opts, &mut ctx, &mut NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::InvalidInput(_))
        ));

        let no_steps = MaskedOptions {
            max_steps: 0,
            ..Default::default()
        };
        assert!(no_steps.validate().is_err());
        let backwards = MaskedOptions {
            denoise_start: 0.8,
            denoise_end: 0.2,
            ..Default::default()
        };
        assert!(backwards.validate().is_err());
        assert!(MaskedOptions::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_stateful_strategies() {
        let mut model = painter();
        let mut ctx = SamplingContext::new(Some(0));
        let item = BatchItem::tts(vec![1, 2], Codes::filled(4, 3, 0)).with_target_len(6);
        for sampling in [
            SamplingPolicy {
                beam_width: 4,
                ..SamplingPolicy::greedy()
            },
            SamplingPolicy {
                temperature: 1.0,
                mirostat_tau: 3.0,
                ..Default::default()
            },
        ] {
            let opts = MaskedOptions {
                sampling,
                ..Default::default()
            };
            let err = decode_masked(&mut model, &[item.clone()], &opts, &mut ctx, &mut NoProgress)
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DecodeError>(),
                Some(DecodeError::PolicyConflict(_))
            ));
        }
    }

    #[test]
    fn test_peak_probability_ignores_penalties() {
        assert!((peak_probability(&[0.0, 0.0]) - 0.5).abs() < 1e-6);
        assert!((peak_probability(&[0.0, 0.0, 0.0, 0.0]) - 0.25).abs() < 1e-6);
        assert!(peak_probability(&[10.0, 0.0]) > 0.99);
        assert_eq!(peak_probability(&[f32::NEG_INFINITY; 3]), 0.0);

        // a heavy repetition penalty changes the sampled token but not the
        // confidence the schedule sees
        let row = vec![2.0f32, 1.0, 0.0];
        let penalized = SamplingPolicy {
            repetition_penalty: 100.0,
            ..SamplingPolicy::greedy()
        };
        let mut ctx = SamplingContext::new(Some(0));
        let (token, _) = sample_row(row.clone(), &[0], &penalized, &mut ctx).unwrap();
        assert_eq!(token, 1);
        let expected = 1.0 / (1.0 + (-1.0f32).exp() + (-2.0f32).exp());
        assert!((peak_probability(&row) - expected).abs() < 1e-6);
    }
}
