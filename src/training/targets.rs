//! Per-item training inputs: RVQ level draw, demasking timesteps, token
//! dropout, stop rows and CFG conditioning drops.

use anyhow::Result;

use super::policy::TrainingRegime;
use crate::data::{BatchItem, Codes, Prompt, Task};
use crate::error::DecodeError;
use crate::generation::SamplingContext;
use crate::models::{Capability, ModelConfig, ModelInput};

/// What one forward+loss pass consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingBatch {
    pub inputs: Vec<ModelInput>,
    pub quant_levels: Vec<usize>,
    /// `Some` for items trained as demasking
    pub timesteps: Vec<Option<f32>>,
}

/// Build randomized training inputs for `batch`.
///
/// Ground-truth responses are copied, never mutated in place.
pub fn build_targets(
    batch: &[BatchItem],
    config: &ModelConfig,
    ctx: &mut SamplingContext,
) -> Result<TrainingBatch> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("build_targets").entered();

    if batch.is_empty() {
        return Err(DecodeError::InvalidInput("empty training batch".into()).into());
    }
    let policy = &config.training;
    let top = config.n_resp_levels.saturating_sub(1);

    let (lo, hi) = policy
        .rvq_level_range
        .unwrap_or((if config.is_causal() { 0 } else { 1 }, top));
    let table = policy.rvq_levels_p.table(lo, hi.max(lo));
    if table.is_empty() {
        return Err(DecodeError::InvalidInput("empty RVQ level distribution".into()).into());
    }
    let (drop_lo, drop_hi) = policy.token_dropout_rvq_levels.unwrap_or((0, top));
    let (mask_lo, mask_hi) = policy
        .masking_train_rvq_levels
        .unwrap_or((0, config.n_resp_levels));

    let masking_train_p = match policy.regime {
        TrainingRegime::ArNar => 0.0,
        TrainingRegime::Masked if !config.supports(Capability::Len) => 0.0,
        TrainingRegime::Masked if !config.supports(Capability::Ar) => 1.0,
        TrainingRegime::Masked => policy.masking_train_p,
    };

    let mut quant_levels: Vec<usize> = batch
        .iter()
        .map(|_| table[ctx.index(table.len())])
        .collect();
    let mut timesteps: Vec<Option<f32>> = vec![None; batch.len()];

    for (i, item) in batch.iter().enumerate() {
        if item.task.is_text_output() {
            quant_levels[i] = 0;
        } else if item.task != Task::Length
            && (mask_lo..=mask_hi).contains(&quant_levels[i])
            && ctx.bernoulli(masking_train_p)
        {
            timesteps[i] = Some(policy.masking_ratio.map(ctx.next_f32()));
        }
    }

    let mut inputs = Vec::with_capacity(batch.len());
    for (i, item) in batch.iter().enumerate() {
        let response = item.response.as_ref().ok_or_else(|| {
            DecodeError::InvalidInput(format!("training item {i} has no response"))
        })?;

        let drawn = quant_levels[i];
        let mut level = drawn.min(response.levels() - 1);
        if let Some(prompt_levels) = item.prompt.min_levels() {
            level = level.min(prompt_levels.saturating_sub(1));
        }
        if item.task == Task::Length {
            level = 0;
        }
        if level != drawn {
            tracing::debug!(item = i, drawn, level, "quant level clamped to available levels");
        }
        quant_levels[i] = level;

        let mut input = ModelInput::from_item(item, level);
        input.timestep = timesteps[i];

        let audio_out = item.task.is_audio_output();
        let mut resp = if audio_out && timesteps[i].is_none() {
            input.prompt = item.prompt.truncate_levels(level + 1);
            response.truncate_levels(level + 1)
        } else {
            response.clone()
        };

        if timesteps[i].is_none()
            && policy.token_dropout_error > 0.0
            && (drop_lo..=drop_hi).contains(&level)
        {
            token_dropout(&mut resp, level, policy.token_dropout_error, policy.token_dropout_clamp, ctx);
        }

        let wants_stop = level == 0 && (timesteps[i].is_none() || config.predict_causally);
        if audio_out && wants_stop {
            resp.push_uniform(config.stop_token);
        }
        input.response = Some(resp);

        if audio_out && item.task != Task::Length {
            apply_cfg_drops(&mut input, config, ctx);
        }
        inputs.push(input);
    }

    tracing::debug!(
        items = batch.len(),
        levels = ?quant_levels,
        demasking = timesteps.iter().filter(|t| t.is_some()).count(),
        "built training targets"
    );

    Ok(TrainingBatch {
        inputs,
        quant_levels,
        timesteps,
    })
}

/// Nudge tokens on levels below `level` by ±1 with probability `p`.
fn token_dropout(
    codes: &mut Codes,
    level: usize,
    p: f64,
    (min, max): (u32, u32),
    ctx: &mut SamplingContext,
) {
    for l in 0..level.min(codes.levels()) {
        for t in 0..codes.len() {
            if !ctx.bernoulli(p) {
                continue;
            }
            let token = codes.get(t, l) as i64;
            let offset = if ctx.bernoulli(0.5) { 1 } else { -1 };
            let nudged = (token + offset).clamp(min as i64, max as i64) as u32;
            codes.set(t, l, nudged);
        }
    }
}

/// Classifier-free guidance augmentation: independent Bernoulli drops,
/// with a text drop taking precedence over the raw-text swap.
fn apply_cfg_drops(input: &mut ModelInput, config: &ModelConfig, ctx: &mut SamplingContext) {
    let policy = &config.training;
    let mut drop_audio = ctx.bernoulli(policy.cfg_prom_dropout_p);
    let mut drop_text = false;
    if ctx.bernoulli(policy.cfg_cond_dropout_p) {
        drop_audio = true;
        drop_text = true;
    }
    let swap_text = ctx.bernoulli(policy.use_raw_text_p) && input.text.is_some();

    if drop_text {
        input.phonemes = Some(vec![config.text_bos, config.text_eos]);
    }
    if drop_audio {
        input.prompt = Prompt::Absent;
    }
    if swap_text && !drop_text {
        input.phonemes = None;
    }
}
