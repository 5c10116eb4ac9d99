//! Parallel fill of RVQ levels 1.. on top of an AR-decoded level 0.

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
pub struct NarOptions {
    /// Highest level to produce; `None` means every level the model has
    pub max_levels: Option<usize>,
    pub sampling: SamplingPolicy,
    pub guidance: CfgGuidance,
}

impl NarOptions {
    pub fn validate(&self) -> Result<()> {
        require_stateless(&self.sampling, stage::NAR)
    }
}

impl Default for NarOptions {
    fn default() -> Self {
        Self {
            max_levels: None,
            sampling: SamplingPolicy::greedy(),
            guidance: CfgGuidance::default(),
        }
    }
}

/// Append one level per model invocation to each item's `response` until
/// `max_levels` extra levels exist. Duration never changes here.
pub fn decode_nar<M: SequenceModel>(
    model: &mut M,
    batch: &[BatchItem],
    opts: &NarOptions,
    ctx: &mut SamplingContext,
    progress: &mut dyn Progress,
) -> Result<Vec<Codes>> {
    check_batch(batch)?;
    opts.validate()?;
    let config = model.config().clone();
    let top = config.n_resp_levels.saturating_sub(1);
    let max_levels = opts.max_levels.map_or(top, |levels| levels.min(top));

    let mut prev: Vec<Codes> = batch
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.response.clone().ok_or_else(|| {
                DecodeError::InvalidInput(format!("NAR item {i} has no level-0 response"))
            })
        })
        .collect::<std::result::Result<_, _>>()?;

    // items advance in lockstep from the shallowest one
    let start = prev.iter().map(Codes::levels).min().unwrap_or(1);
    if prev.iter().any(|codes| codes.levels() != start) {
        tracing::debug!(levels = start, "trimming NAR inputs to a common level count");
        prev = prev.iter().map(|codes| codes.truncate_levels(start)).collect();
    }

    tracing::info!(items = batch.len(), from = start, max_levels, "NAR decode");
    let total = (max_levels + 1).saturating_sub(start);

    #[cfg(feature = "profiling")]
    let _loop_span = tracing::info_span!("nar_loop").entered();

    for n in 0..total {
        let level = prev[0].levels();
        if level >= max_levels + 1 {
            break;
        }
        if !progress.step(stage::NAR, n, total) {
            model.enable_adapter(None)?;
            return Err(DecodeError::Cancelled.into());
        }
        model.enable_adapter(Some(level))?;

        let inputs: Vec<ModelInput> = batch
            .iter()
            .zip(&prev)
            .map(|(item, resp)| {
                let mut input = ModelInput::from_item(item, level);
                input.response = Some(resp.clone());
                input
            })
            .collect();
        let output = model.forward(&inputs, None)?;
        let mut logits = output.logits;

        if opts.guidance.is_enabled() {
            let null_inputs: Vec<ModelInput> = inputs
                .iter()
                .map(|input| input.unconditional(config.text_bos, config.text_eos))
                .collect();
            let null_output = model.forward(&null_inputs, None)?;
            let lens: Vec<usize> = prev.iter().map(Codes::len).collect();
            logits = fuse_output(&logits, &null_output.logits, opts.guidance, &lens)?;
        }
        if logits.len() != prev.len() {
            bail!("model returned {} items for {} inputs", logits.len(), prev.len());
        }

        let mut next = Vec::with_capacity(prev.len());
        for (i, (levels, resp)) in logits.iter().zip(&prev).enumerate() {
            let Some(tensor) = levels.first() else {
                bail!("model returned no logits for item {i} at level {level}");
            };
            let tensor = restrict_classes(&tail_rows(tensor, resp.len())?, config.n_audio_tokens)?;
            let mut tokens = Vec::with_capacity(resp.len());
            for row in logits_rows(&tensor)? {
                let (token, _) = sample_row(row, &[], &opts.sampling, ctx)?;
                tokens.push(token);
            }
            next.push(resp.with_level(&tokens)?);
        }
        tracing::debug!(level, "NAR level resolved");
        prev = next;
    }
    progress.finish(stage::NAR);
    model.enable_adapter(None)?;

    Ok(prev)
}
