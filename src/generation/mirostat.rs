//! Mirostat (v1) sampling: adaptive top-k that targets a fixed average
//! surprise instead of a fixed cutoff.
//!
//! State is threaded functionally: each step consumes the per-item states
//! and returns new ones carrying the chosen token.

use anyhow::Result;

use super::sampling::{softmax, SamplingContext};
use crate::error::DecodeError;

/// Probabilities used to estimate the Zipf exponent.
const ZIPF_SAMPLES: usize = 100;

/// Per-item mirostat carry.
#[derive(Debug, Clone, PartialEq)]
pub struct MirostatState {
    /// Vocabulary size assumed by the Zipf estimate
    pub n: usize,
    /// Target surprise in bits
    pub tau: f64,
    /// Learning rate for `max_surprise`
    pub eta: f64,
    /// Running `mu`
    pub max_surprise: f64,
    /// Surprise error of the last step
    pub error_surprise: f64,
    pub running_total_surprise: f64,
    /// Token chosen on the last step
    pub token: Option<u32>,
}

impl MirostatState {
    pub fn new(tau: f64, eta: f64) -> Self {
        Self {
            n: 1024,
            tau,
            eta,
            max_surprise: 2.0 * tau,
            error_surprise: 0.0,
            running_total_surprise: 0.0,
            token: None,
        }
    }
}

/// Estimate the Zipf exponent from descending probabilities.
fn zipf_exponent(sorted: &[f32]) -> f64 {
    let m = sorted.len().min(ZIPF_SAMPLES);
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..m.saturating_sub(1) {
        let (p, q) = (sorted[i] as f64, sorted[i + 1] as f64);
        if p <= 0.0 || q <= 0.0 {
            break;
        }
        let t = ((i + 2) as f64 / (i + 1) as f64).ln();
        let b = (p / q).ln();
        num += t * b;
        den += t * t;
    }
    if den > 0.0 {
        num / den
    } else {
        1.0
    }
}

/// Sample one row per item and advance its state.
pub fn sample_mirostat(
    rows: &[Vec<f32>],
    states: Vec<MirostatState>,
    temperature: f64,
    ctx: &mut SamplingContext,
) -> Result<Vec<MirostatState>> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("mirostat").entered();

    let mut out = Vec::with_capacity(states.len());
    for (row, state) in rows.iter().zip(states) {
        let scaled: Vec<f32> = if temperature > 0.0 && temperature != 1.0 {
            row.iter().map(|v| v / temperature as f32).collect()
        } else {
            row.clone()
        };
        let probs = softmax(&scaled);

        let mut order: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
        if order.is_empty() {
            return Err(DecodeError::NoCandidates.into());
        }
        order.sort_unstable_by(|&a, &b| {
            probs[b]
                .partial_cmp(&probs[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let sorted: Vec<f32> = order.iter().map(|&i| probs[i]).collect();

        let s = zipf_exponent(&sorted);
        let eps = s - 1.0;
        let n = state.n as f64;
        let k = if eps.abs() < 1e-9 {
            order.len() as f64
        } else {
            ((eps * 2f64.powf(state.max_surprise)) / (1.0 - n.powf(-eps))).powf(1.0 / s)
        };
        let k = if k.is_finite() {
            (k.round() as usize + 1).clamp(1, order.len())
        } else {
            order.len()
        };

        let mass: f32 = sorted[..k].iter().sum();
        let u = ctx.next_f32() * mass;
        let mut acc = 0.0f32;
        let mut pick = k - 1;
        for (i, p) in sorted[..k].iter().enumerate() {
            acc += p;
            if acc > u {
                pick = i;
                break;
            }
        }
        let token = order[pick];

        let surprise = -(probs[token] as f64).log2();
        let error = surprise - state.tau;
        tracing::trace!(token, k, surprise, mu = state.max_surprise, "mirostat step");
        out.push(MirostatState {
            max_surprise: state.max_surprise - state.eta * error,
            error_surprise: error,
            running_total_surprise: state.running_total_surprise + surprise,
            token: Some(token as u32),
            ..state
        });
    }
    Ok(out)
}
