//! Decode loops and the dispatcher that picks one.
//!
//! The caller states the loop explicitly through [`DecodeMode`]; nothing is
//! inferred from which batch fields happen to be filled in.

pub mod ar;
pub mod length;
pub mod masked;
pub mod nar;
pub mod progress;

pub use ar::{decode_ar, ArOptions, ArOutput};
pub use length::{decode_length, LengthOptions};
pub use masked::{decode_masked, MaskedOptions, MaskedOutput};
pub use nar::{decode_nar, NarOptions};
pub use progress::{NoProgress, Progress};

use anyhow::{bail, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::data::{BatchItem, Codes, Task};
use crate::error::DecodeError;
use crate::generation::{SamplingContext, SamplingPolicy, Strategy};
use crate::models::{Capability, ModelConfig, SequenceModel};

/// Which loop to run, with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecodeMode {
    Ar(ArOptions),
    Nar(NarOptions),
    Masked(MaskedOptions),
    Length(LengthOptions),
}

impl DecodeMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ar(_) => progress::stage::AR,
            Self::Nar(_) => progress::stage::NAR,
            Self::Masked(_) => progress::stage::MASKED,
            Self::Length(_) => progress::stage::LENGTH,
        }
    }

    /// Capability the model must advertise for this loop.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::Ar(_) => Capability::Ar,
            Self::Nar(_) | Self::Masked(_) => Capability::Nar,
            Self::Length(_) => Capability::Len,
        }
    }

    /// Whether items tagged `task` can go through this loop.
    pub fn accepts(&self, task: Task) -> bool {
        match self {
            Self::Ar(_) => task != Task::Length,
            Self::Nar(_) | Self::Masked(_) => task.is_audio_output() && task != Task::Length,
            Self::Length(_) => task.is_audio_output(),
        }
    }
}

/// What a decode produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutput {
    /// One token matrix per item
    Sequences(Vec<Codes>),
    /// One predicted frame count per item
    Lengths(Vec<usize>),
}

impl DecodeOutput {
    pub fn into_sequences(self) -> Result<Vec<Codes>> {
        match self {
            Self::Sequences(seqs) => Ok(seqs),
            Self::Lengths(_) => bail!("decode produced lengths, not sequences"),
        }
    }

    pub fn into_lengths(self) -> Result<Vec<usize>> {
        match self {
            Self::Lengths(lens) => Ok(lens),
            Self::Sequences(_) => bail!("decode produced sequences, not lengths"),
        }
    }
}

/// Run the loop named by `mode` over `batch`.
///
/// Refuses to start when the model lacks the loop's capability or an item's
/// task does not fit the loop.
pub fn decode<M: SequenceModel>(
    model: &mut M,
    batch: &[BatchItem],
    mode: &DecodeMode,
    ctx: &mut SamplingContext,
    progress: &mut dyn Progress,
) -> Result<DecodeOutput> {
    let capability = mode.required_capability();
    if !model.supports(capability) {
        return Err(DecodeError::MissingCapability(capability).into());
    }
    if let Some(item) = batch.iter().find(|item| !mode.accepts(item.task)) {
        return Err(DecodeError::TaskNotSupported {
            task: item.task.to_string(),
            mode: mode.name(),
        }
        .into());
    }

    match mode {
        DecodeMode::Ar(opts) => {
            decode_ar(model, batch, opts, ctx, progress).map(|out| DecodeOutput::Sequences(out.sequences))
        }
        DecodeMode::Nar(opts) => decode_nar(model, batch, opts, ctx, progress).map(DecodeOutput::Sequences),
        DecodeMode::Masked(opts) => {
            decode_masked(model, batch, opts, ctx, progress).map(|out| DecodeOutput::Sequences(out.sequences))
        }
        DecodeMode::Length(opts) => decode_length(model, batch, opts, progress).map(DecodeOutput::Lengths),
    }
}

pub(crate) fn check_batch(batch: &[BatchItem]) -> Result<()> {
    if batch.is_empty() {
        return Err(DecodeError::InvalidInput("empty batch".into()).into());
    }
    Ok(())
}

/// Parallel loops sample every cell independently, so stateful strategies
/// have nothing to carry between rows.
pub(crate) fn require_stateless(policy: &SamplingPolicy, mode: &str) -> Result<()> {
    policy.validate()?;
    match policy.strategy() {
        Strategy::Stateless => Ok(()),
        Strategy::Mirostat => Err(DecodeError::PolicyConflict(format!(
            "mirostat (tau {}) is not available in the {mode} loop",
            policy.mirostat_tau
        ))
        .into()),
        Strategy::Beam => Err(DecodeError::PolicyConflict(format!(
            "beam search (width {}) is not available in the {mode} loop",
            policy.beam_width
        ))
        .into()),
    }
}

/// Text-producing tasks stop on the text eos, audio on the audio stop token.
pub(crate) fn stop_token_for(task: Task, config: &ModelConfig) -> u32 {
    if task.is_text_output() {
        config.text_eos
    } else {
        config.stop_token
    }
}

/// Truncate before the first frame holding `stop`. The flag reports whether
/// one was found.
pub(crate) fn prune_at(mut codes: Codes, stop: u32) -> (Codes, bool) {
    match codes.position(stop) {
        Some(pos) => {
            codes.truncate(pos);
            (codes, true)
        }
        None => (codes, false),
    }
}

/// Last `n` rows of a `[rows, classes]` tensor.
pub(crate) fn tail_rows(tensor: &Tensor, n: usize) -> Result<Tensor> {
    let rows = tensor.dim(0)?;
    if n > rows {
        bail!("logits have {rows} rows, need {n}");
    }
    Ok(tensor.narrow(0, rows - n, n)?)
}

/// Keep the first `n` classes so reserved ids can never be sampled.
pub(crate) fn restrict_classes(tensor: &Tensor, n: usize) -> Result<Tensor> {
    let classes = tensor.dim(1)?;
    if classes <= n {
        return Ok(tensor.clone());
    }
    Ok(tensor.narrow(1, 0, n)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_mode_serde() {
        let mode: DecodeMode =
            serde_json::from_str(r#"{"mode": "ar", "max_steps": 75, "sampling": {"temperature": 0.0}}"#)
                .unwrap();
        match &mode {
            DecodeMode::Ar(opts) => {
                assert_eq!(opts.max_steps, 75);
                assert!(opts.sampling.is_greedy());
            }
            other => panic!("unexpected mode {other:?}"),
        }
        assert_eq!(mode.required_capability(), Capability::Ar);
        assert!(serde_json::from_str::<DecodeMode>(r#"{"mode": "ar", "bogus": 1}"#).is_err());
    }

    #[test]
    fn test_mode_task_compatibility() {
        let nar = DecodeMode::Nar(NarOptions::default());
        assert!(nar.accepts(Task::Tts));
        assert!(!nar.accepts(Task::SpeechToText));
        let ar = DecodeMode::Ar(ArOptions::default());
        assert!(ar.accepts(Task::Phonemize));
        assert!(!ar.accepts(Task::Length));
    }

    #[test]
    fn test_prune_at() {
        let codes = Codes::from_level(&[3, 4, 9, 5, 9]);
        let (pruned, found) = prune_at(codes, 9);
        assert!(found);
        assert_eq!(pruned.level(0), vec![3, 4]);
        let (kept, found) = prune_at(Codes::from_level(&[1, 2]), 9);
        assert!(!found);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_tail_rows_and_restrict() {
        let t = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((3, 4))
            .unwrap();
        let tail = tail_rows(&t, 2).unwrap();
        assert_eq!(tail.to_vec2::<f32>().unwrap()[0], vec![4.0, 5.0, 6.0, 7.0]);
        assert!(tail_rows(&t, 4).is_err());
        let narrow = restrict_classes(&t, 2).unwrap();
        assert_eq!(narrow.dims(), &[3, 2]);
        let same = restrict_classes(&Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap(), 8).unwrap();
        assert_eq!(same.dims(), &[1, 2]);
    }
}
