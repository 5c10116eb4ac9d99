//! Token matrix for RVQ codec output.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

use crate::error::DecodeError;

/// Codec tokens laid out `[timesteps, levels]`, row-major.
///
/// Level 0 is the coarse AR level; every timestep carries exactly
/// [`levels`](Self::levels) codes. A single-level sequence (text tokens, AR
/// output, length digits) is simply a `Codes` with one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codes {
    data: Vec<u32>,
    levels: usize,
}

impl Codes {
    /// An empty sequence with `levels` codes per timestep (at least one).
    pub fn empty(levels: usize) -> Self {
        Self {
            data: Vec::new(),
            levels: levels.max(1),
        }
    }

    /// `len` timesteps where every code is `value`.
    pub fn filled(len: usize, levels: usize, value: u32) -> Self {
        let levels = levels.max(1);
        Self {
            data: vec![value; len * levels],
            levels,
        }
    }

    /// A single-level sequence.
    pub fn from_level(tokens: &[u32]) -> Self {
        Self {
            data: tokens.to_vec(),
            levels: 1,
        }
    }

    /// Build from per-timestep frames (`frames[t][level]`).
    ///
    /// Every frame must have the same, non-zero width.
    pub fn from_frames(frames: &[Vec<u32>]) -> Result<Self> {
        let Some(first) = frames.first() else {
            bail!(DecodeError::InvalidInput(
                "cannot infer level count from zero frames".into()
            ));
        };
        let levels = first.len();
        if levels == 0 {
            bail!(DecodeError::InvalidInput("frames have zero levels".into()));
        }
        let mut data = Vec::with_capacity(frames.len() * levels);
        for (t, frame) in frames.iter().enumerate() {
            if frame.len() != levels {
                bail!(DecodeError::InvalidInput(format!(
                    "frame {t} has {} levels, expected {levels}",
                    frame.len()
                )));
            }
            data.extend_from_slice(frame);
        }
        Ok(Self { data, levels })
    }

    /// Number of timesteps.
    pub fn len(&self) -> usize {
        self.data.len() / self.levels
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Codes per timestep.
    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn get(&self, t: usize, level: usize) -> u32 {
        self.data[t * self.levels + level]
    }

    pub fn set(&mut self, t: usize, level: usize, value: u32) {
        self.data[t * self.levels + level] = value;
    }

    /// All codes of timestep `t`.
    pub fn frame(&self, t: usize) -> &[u32] {
        &self.data[t * self.levels..(t + 1) * self.levels]
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u32]> {
        self.data.chunks_exact(self.levels)
    }

    /// One RVQ level as a flat sequence.
    pub fn level(&self, level: usize) -> Vec<u32> {
        self.frames().map(|f| f[level]).collect()
    }

    /// Append one timestep.
    pub fn push_frame(&mut self, frame: &[u32]) -> Result<()> {
        if frame.len() != self.levels {
            bail!(DecodeError::InvalidInput(format!(
                "frame has {} levels, sequence has {}",
                frame.len(),
                self.levels
            )));
        }
        self.data.extend_from_slice(frame);
        Ok(())
    }

    /// Append a row where every level is `token`.
    pub fn push_uniform(&mut self, token: u32) {
        self.data.extend(std::iter::repeat(token).take(self.levels));
    }

    /// Keep the first `len` timesteps.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.levels);
    }

    /// Keep levels `[0, levels)`; a no-op when already narrower.
    pub fn truncate_levels(&self, levels: usize) -> Self {
        let levels = levels.clamp(1, self.levels);
        if levels == self.levels {
            return self.clone();
        }
        let data = self
            .frames()
            .flat_map(|f| f[..levels].iter().copied())
            .collect();
        Self { data, levels }
    }

    /// Append `tokens` as a new, finer level.
    pub fn with_level(&self, tokens: &[u32]) -> Result<Self> {
        if tokens.len() != self.len() {
            bail!(DecodeError::InvalidInput(format!(
                "new level has {} timesteps, sequence has {}",
                tokens.len(),
                self.len()
            )));
        }
        let levels = self.levels + 1;
        let mut data = Vec::with_capacity(self.len() * levels);
        for (frame, &token) in self.frames().zip(tokens) {
            data.extend_from_slice(frame);
            data.push(token);
        }
        Ok(Self { data, levels })
    }

    /// First timestep where any level equals `token`.
    pub fn position(&self, token: u32) -> Option<usize> {
        self.frames().position(|f| f.contains(&token))
    }

    pub fn contains(&self, token: u32) -> bool {
        self.data.contains(&token)
    }

    /// Frames as nested vectors (`frames[t][level]`).
    pub fn to_frames(&self) -> Vec<Vec<u32>> {
        self.frames().map(<[u32]>::to_vec).collect()
    }

    /// `[timesteps, levels]` U32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.data.clone(),
            (self.len(), self.levels),
            device,
        )?)
    }

    /// Accepts `[timesteps]` or `[timesteps, levels]` of any integer dtype.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let tensor = tensor.to_dtype(DType::U32)?;
        match tensor.rank() {
            1 => Ok(Self::from_level(&tensor.to_vec1::<u32>()?)),
            2 => {
                let (_, levels) = tensor.dims2()?;
                if levels == 0 {
                    bail!(DecodeError::InvalidInput("tensor has zero levels".into()));
                }
                let data = tensor.flatten_all()?.to_vec1::<u32>()?;
                Ok(Self { data, levels })
            }
            r => bail!(DecodeError::InvalidInput(format!(
                "expected rank 1 or 2 code tensor, got rank {r}"
            ))),
        }
    }
}
