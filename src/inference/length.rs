//! Output-length prediction: a tiny greedy AR loop over decimal digits.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::progress::{stage, Progress};
use super::{check_batch, tail_rows};
use crate::data::{BatchItem, Task};
use crate::error::DecodeError;
use crate::generation::sampling::{argmax, logits_rows};
use crate::models::{ModelInput, SequenceModel};

/// Hard cap on digit steps.
pub const MAX_LENGTH_STEPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LengthOptions {
    /// Digit steps, at most [`MAX_LENGTH_STEPS`]
    pub max_steps: usize,
    /// Token ending the digit sequence; larger tokens are clamped to it
    pub stop_digit: u32,
}

impl Default for LengthOptions {
    fn default() -> Self {
        Self {
            max_steps: MAX_LENGTH_STEPS,
            stop_digit: 10,
        }
    }
}

/// Predict an output length (in codec frames) per item.
pub fn decode_length<M: SequenceModel>(
    model: &mut M,
    batch: &[BatchItem],
    opts: &LengthOptions,
    progress: &mut dyn Progress,
) -> Result<Vec<usize>> {
    check_batch(batch)?;
    let steps = opts.max_steps.min(MAX_LENGTH_STEPS);
    let mut digits: Vec<Vec<u32>> = vec![vec![0]; batch.len()];
    let mut stopped = vec![false; batch.len()];

    model.enable_adapter(Some(0))?;

    #[cfg(feature = "profiling")]
    let _loop_span = tracing::info_span!("len_loop").entered();

    for step in 0..steps {
        if !progress.step(stage::LENGTH, step, steps) {
            model.enable_adapter(None)?;
            return Err(DecodeError::Cancelled.into());
        }
        let inputs: Vec<ModelInput> = batch
            .iter()
            .zip(&digits)
            .map(|(item, seq)| {
                let mut input = ModelInput::from_item(item, 0);
                input.task = Task::Length;
                input.len = Some(seq.clone());
                input
            })
            .collect();
        let output = model.forward(&inputs, None)?;
        if output.logits.len() != batch.len() {
            bail!("model returned {} items for {} inputs", output.logits.len(), batch.len());
        }

        for (i, levels) in output.logits.iter().enumerate() {
            if stopped[i] {
                continue;
            }
            let Some(tensor) = levels.first() else {
                bail!("model returned no length logits for item {i}");
            };
            let row = logits_rows(&tail_rows(tensor, 1)?)?.remove(0);
            let token = argmax(&row).ok_or(DecodeError::NoCandidates)? as u32;
            let token = token.min(opts.stop_digit);
            if token == opts.stop_digit {
                stopped[i] = true;
            } else {
                digits[i].push(token);
            }
        }
        if stopped.iter().all(|s| *s) {
            break;
        }
    }
    progress.finish(stage::LENGTH);
    model.enable_adapter(None)?;

    let lengths: Vec<usize> = digits.iter().map(|seq| parse_digits(seq)).collect();
    tracing::info!(?lengths, "predicted lengths");
    Ok(lengths)
}

/// Concatenate decimal digits into an integer, saturating on overflow.
pub fn parse_digits(digits: &[u32]) -> usize {
    digits.iter().fold(0usize, |acc, &d| {
        acc.saturating_mul(10).saturating_add(d.min(9) as usize)
    })
}
