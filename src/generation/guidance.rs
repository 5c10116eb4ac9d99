//! Classifier-free guidance: fuse conditional and null-conditioned logits.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

const STD_EPS: f64 = 1e-7;

/// Guidance strength and rescale factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfgGuidance {
    /// `<= 0` disables guidance and the unconditional pass with it
    pub strength: f64,
    /// 0 keeps the fused magnitude, 1 pulls it fully to the conditional one
    pub rescale: f64,
}

impl Default for CfgGuidance {
    fn default() -> Self {
        Self {
            strength: 0.0,
            rescale: 0.75,
        }
    }
}

impl CfgGuidance {
    pub fn new(strength: f64, rescale: f64) -> Self {
        Self { strength, rescale }
    }

    pub fn is_enabled(&self) -> bool {
        self.strength > 0.0
    }
}

/// `uncond + strength * (cond - uncond)` over the last `valid_len` rows.
///
/// Both tensors are `[rows, classes]`, aligned to the end. Rows before the
/// valid window are returned as the conditional logits. With `rescale > 0`
/// each fused row's standard deviation is pulled toward the conditional
/// row's by `rescale * std(cond)/std(fused) + (1 - rescale)`.
pub fn fuse(
    cond: &Tensor,
    uncond: &Tensor,
    strength: f64,
    rescale: f64,
    valid_len: Option<usize>,
) -> Result<Tensor> {
    if strength <= 0.0 {
        return Ok(cond.clone());
    }
    let (rows, classes) = cond.dims2()?;
    let (urows, uclasses) = uncond.dims2()?;
    if classes != uclasses {
        bail!("cfg fuse: class mismatch ({classes} vs {uclasses})");
    }
    let valid = valid_len.unwrap_or(rows).min(rows).min(urows);
    if valid == 0 {
        return Ok(cond.clone());
    }

    let dtype = cond.dtype();
    let c = cond.narrow(0, rows - valid, valid)?.to_dtype(DType::F32)?;
    let u = uncond.narrow(0, urows - valid, valid)?.to_dtype(DType::F32)?;

    let diff = (&c - &u)?;
    let mut fused = (u + diff.affine(strength, 0.0)?)?;

    if rescale > 0.0 {
        let cond_std = c.var_keepdim(D::Minus1)?.sqrt()?;
        let fused_std = (fused.var_keepdim(D::Minus1)?.sqrt()? + STD_EPS)?;
        let factor = (cond_std / fused_std)?.affine(rescale, 1.0 - rescale)?;
        fused = fused.broadcast_mul(&factor)?;
    }
    let fused = fused.to_dtype(dtype)?;

    if valid == rows {
        Ok(fused)
    } else {
        Ok(Tensor::cat(&[&cond.narrow(0, 0, rows - valid)?, &fused], 0)?)
    }
}

/// Fuse a whole forward output: `cond[item][level]` against the matching
/// unconditional tensors, `valid_lens[item]` rows each.
pub fn fuse_output(
    cond: &[Vec<Tensor>],
    uncond: &[Vec<Tensor>],
    guidance: CfgGuidance,
    valid_lens: &[usize],
) -> Result<Vec<Vec<Tensor>>> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("cfg_fuse").entered();

    if cond.len() != uncond.len() {
        bail!(
            "cfg fuse: {} conditional items vs {} unconditional",
            cond.len(),
            uncond.len()
        );
    }
    cond.iter()
        .zip(uncond)
        .enumerate()
        .map(|(i, (c_levels, u_levels))| {
            if c_levels.len() != u_levels.len() {
                bail!("cfg fuse: level count mismatch for item {i}");
            }
            c_levels
                .iter()
                .zip(u_levels)
                .map(|(c, u)| {
                    fuse(
                        c,
                        u,
                        guidance.strength,
                        guidance.rescale,
                        valid_lens.get(i).copied(),
                    )
                })
                .collect()
        })
        .collect()
}
