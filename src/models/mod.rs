//! Collaborator interfaces consumed by the decode and training paths
//!
//! The transformer, the audio codec and the grapheme-to-phoneme front-end
//! live outside this crate. They plug in through three traits:
//! - [`SequenceModel`]: batched forward pass returning per-level logits
//! - [`Codec`]: waveform ↔ [`Codes`]
//! - [`TextFrontEnd`]: text → phoneme token ids
//!
//! and `config` holds the [`ModelConfig`] both sides agree on.

pub mod config;

pub use config::ModelConfig;

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audio::AudioBuffer;
use crate::data::{BatchItem, Codes, Prompt, Task};

/// Decode strategies a model was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Autoregressive level-0 (or full-frame) decoding
    Ar,
    /// Parallel level filling / masked demasking
    Nar,
    /// Output-length prediction
    Len,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ar => "ar",
            Self::Nar => "nar",
            Self::Len => "len",
        })
    }
}

/// Everything the model sees for one batch item in one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInput {
    pub task: Task,
    pub phonemes: Option<Vec<u32>>,
    pub text: Option<Vec<u32>>,
    pub language: Option<u32>,
    pub tone: Option<u32>,
    pub prompt: Prompt,
    pub response: Option<Codes>,
    /// Length-digit history for the length predictor
    pub len: Option<Vec<u32>>,
    /// RVQ level being predicted
    pub quant_level: usize,
    /// Demasking timestep in `[0, 1]`, masked-NAR only
    pub timestep: Option<f32>,
}

impl ModelInput {
    /// Copy the conditioning fields of `item`.
    pub fn from_item(item: &BatchItem, quant_level: usize) -> Self {
        Self {
            task: item.task,
            phonemes: item.phonemes.clone(),
            text: item.text.clone(),
            language: item.language,
            tone: item.tone,
            prompt: item.prompt.clone(),
            response: item.response.clone(),
            len: None,
            quant_level,
            timestep: None,
        }
    }

    /// The null-conditioned twin used for classifier-free guidance: text
    /// reduced to `[bos, eos]`, no prompt audio, everything else shared.
    pub fn unconditional(&self, bos: u32, eos: u32) -> Self {
        Self {
            phonemes: Some(vec![bos, eos]),
            text: None,
            prompt: Prompt::Absent,
            ..self.clone()
        }
    }
}

/// Result of one forward pass.
///
/// `logits[item]` holds one `[positions, classes]` tensor per RVQ level
/// predicted by this invocation, in ascending level order: one tensor for a
/// level-0 AR model or a single NAR level, all levels for masked or
/// full-frame models. Rows are aligned to the end of the sequence being
/// decoded, so the last row is the next-token prediction for AR inputs.
#[derive(Debug, Clone)]
pub struct ModelOutput<S> {
    pub logits: Vec<Vec<Tensor>>,
    pub state: Option<S>,
}

/// The opaque transformer.
///
/// Parameters are read-only to the decode loops; the only mutation they
/// perform is switching the active adapter between levels.
pub trait SequenceModel {
    /// Incremental-decoding carry (e.g. a KV cache).
    type State;

    fn config(&self) -> &ModelConfig;

    /// Run one batched forward pass. `state` is only ever the value returned
    /// by the previous call of the same decode loop.
    fn forward(
        &self,
        inputs: &[ModelInput],
        state: Option<Self::State>,
    ) -> Result<ModelOutput<Self::State>>;

    /// Reorder carried state after beam search picked `parents` (one source
    /// row per new row). Returning `None` drops the carry, so the next
    /// forward pass recomputes from the full inputs.
    fn reorder_state(&self, _state: Self::State, _parents: &[usize]) -> Result<Option<Self::State>> {
        Ok(None)
    }

    /// Activate the adapter for `level`, or the base weights for `None`.
    /// Models without adapters ignore this.
    fn enable_adapter(&mut self, _level: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn supports(&self, capability: Capability) -> bool {
        self.config().capabilities.contains(&capability)
    }
}

/// Audio codec at the sequence boundary.
pub trait Codec {
    /// Codec frames per second of audio.
    fn frame_rate(&self) -> usize;

    fn encode(&self, audio: &AudioBuffer) -> Result<Codes>;

    fn decode(&self, codes: &Codes) -> Result<AudioBuffer>;
}

/// Text normalisation + grapheme-to-phoneme.
pub trait TextFrontEnd {
    /// Phoneme ids for `text`, including bos/eos.
    fn encode(&self, text: &str, language: &str) -> Result<Vec<u32>>;
}
