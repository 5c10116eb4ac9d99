//! Model configuration shared by the decode loops and the training builder

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::Capability;
use crate::training::TrainingPolicy;

/// Token layout and capabilities of a trained AR/NAR model.
///
/// Reserved ids follow the 1024-entry codebook convention: audio codes are
/// `[0, n_audio_tokens)`, the stop token and the mask token sit right after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// RVQ levels the model predicts
    #[serde(default = "default_n_resp_levels")]
    pub n_resp_levels: usize,

    /// Codebook size per level
    #[serde(default = "default_n_audio_tokens")]
    pub n_audio_tokens: usize,

    /// Audio stop token (level 0 only)
    #[serde(default = "default_stop_token")]
    pub stop_token: u32,

    /// Reserved id marking masked canvas positions
    #[serde(default = "default_mask_token")]
    pub mask_token: u32,

    /// Text/phoneme begin-of-sequence id
    #[serde(default = "default_text_bos")]
    pub text_bos: u32,

    /// Text/phoneme end-of-sequence id, doubles as the text stop token
    #[serde(default = "default_text_eos")]
    pub text_eos: u32,

    /// Tokens emitted per AR step
    #[serde(default = "default_causal_size")]
    pub causal_size: usize,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,

    /// Demasking items still get AR stop rows when training
    #[serde(default)]
    pub predict_causally: bool,

    #[serde(default)]
    pub training: TrainingPolicy,
}

fn default_n_resp_levels() -> usize {
    8
}
fn default_n_audio_tokens() -> usize {
    1024
}
fn default_stop_token() -> u32 {
    1024
}
fn default_mask_token() -> u32 {
    1025
}
fn default_text_bos() -> u32 {
    1
}
fn default_text_eos() -> u32 {
    2
}
fn default_causal_size() -> usize {
    1
}
fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Ar, Capability::Nar]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_resp_levels: default_n_resp_levels(),
            n_audio_tokens: default_n_audio_tokens(),
            stop_token: default_stop_token(),
            mask_token: default_mask_token(),
            text_bos: default_text_bos(),
            text_eos: default_text_eos(),
            causal_size: default_causal_size(),
            capabilities: default_capabilities(),
            predict_causally: false,
            training: TrainingPolicy::default(),
        }
    }
}

impl ModelConfig {
    /// Load from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether the model can be trained on level 0 autoregressively.
    pub fn is_causal(&self) -> bool {
        self.supports(Capability::Ar)
    }

    /// Short label for logs, e.g. `ar+nar/8`.
    pub fn label(&self) -> String {
        let caps: Vec<String> = self.capabilities.iter().map(|c| c.to_string()).collect();
        format!("{}/{}", caps.join("+"), self.n_resp_levels)
    }
}
