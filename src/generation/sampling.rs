//! Token sampling for the decode loops
//!
//! All row processing happens on CPU `Vec<f32>` rows: logits for one
//! position are pulled off the device once, then penalties, temperature and
//! filtering run in plain Rust. Create a [`SamplingContext`] with an optional
//! seed for reproducible outputs.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DecodeError;

/// Temperatures at or below this are treated as greedy argmax.
pub const GREEDY_TEMPERATURE: f64 = 1e-5;

/// `top_k` sentinel meaning "no filtering".
pub const TOP_K_DISABLED: i64 = -100;

/// Longest repeated suffix DRY will look for.
const DRY_MAX_MATCH: usize = 50;

static UNSEEDED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// RNG state for a single decode or training call.
///
/// Encapsulates all randomness so that multiple sessions can run
/// concurrently without interfering with each other.
///
/// # Determinism
///
/// When created with a seed, the same seed produces identical output
/// across runs and threads. Without a seed, the generator is seeded from the
/// clock and a process-wide counter.
#[derive(Debug, Clone)]
pub struct SamplingContext {
    /// PCG state
    state: u64,
    seed: Option<u64>,
}

fn mix_seed(seed: u64) -> u64 {
    // Mix seed with PCG increment to avoid degenerate states
    seed.wrapping_mul(2685821657736338717)
        .wrapping_add(1442695040888963407)
}

impl SamplingContext {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self {
                state: mix_seed(s),
                seed: Some(s),
            },
            None => {
                use std::time::{SystemTime, UNIX_EPOCH};

                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                let count = UNSEEDED_COUNTER.fetch_add(1, Ordering::Relaxed);
                Self {
                    state: mix_seed(nanos ^ count.rotate_left(32)),
                    seed: None,
                }
            }
        }
    }

    /// Reset the RNG to the state `SamplingContext::new(Some(seed))` starts in.
    pub fn reset(&mut self, seed: u64) {
        self.state = mix_seed(seed);
        self.seed = Some(seed);
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// PCG XSH RR 64/32
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform f32 in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// `true` with probability `p`. `p <= 0` never fires, `p >= 1` always does.
    pub fn bernoulli(&mut self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        (self.next_f32() as f64) < p
    }

    /// Uniform index in `[0, n)`; `n` must be non-zero.
    pub fn index(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        ((self.next_f32() as f64 * n as f64) as usize).min(n.saturating_sub(1))
    }

    /// Index drawn proportionally to `weights`.
    pub fn weighted_index(&mut self, weights: &[f64]) -> Option<usize> {
        let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
        if total <= 0.0 {
            return None;
        }
        let target = self.next_f32() as f64 * total;
        let mut acc = 0.0;
        let mut last = None;
        for (i, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            acc += w;
            last = Some(i);
            if target < acc {
                return Some(i);
            }
        }
        last
    }
}

/// Which stateful strategy a policy selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Plain per-row sampling through [`sample`]
    Stateless,
    /// Mirostat surprise targeting, see [`super::mirostat`]
    Mirostat,
    /// Beam search, see [`super::beam`]
    Beam,
}

/// Every recognized sampling option with its default.
///
/// Unknown keys are rejected when deserializing; [`SamplingPolicy::validate`]
/// rejects conflicting or degenerate combinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingPolicy {
    /// 0 = greedy argmax; >0 divides logits before softmax
    pub temperature: f64,
    /// Floor for dynamic temperature; negative disables it
    pub min_temperature: f64,
    /// Keep the k highest logits; negative (conventionally -100) disables
    pub top_k: i64,
    /// Nucleus mass in (0, 1]; 1 disables
    pub top_p: f64,
    pub repetition_penalty: f64,
    /// Recency decay exponent for the repetition penalty
    pub repetition_penalty_decay: f64,
    /// Exponent of the length penalty on the stop token and beam scores
    pub length_penalty: f64,
    /// >0 switches the AR loop to beam search
    pub beam_width: usize,
    /// >0 switches the AR loop to mirostat
    pub mirostat_tau: f64,
    pub mirostat_eta: f64,
    /// 0 disables DRY
    pub dry_multiplier: f64,
    pub dry_base: f64,
    pub dry_allowed_length: usize,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            min_temperature: -1.0,
            top_k: TOP_K_DISABLED,
            top_p: 1.0,
            repetition_penalty: 1.0,
            repetition_penalty_decay: 0.0,
            length_penalty: 0.0,
            beam_width: 0,
            mirostat_tau: 0.0,
            mirostat_eta: 0.1,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
        }
    }
}

impl SamplingPolicy {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn with_temperature(&self, temperature: f64) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= GREEDY_TEMPERATURE
    }

    /// Effective top-k, `None` when disabled.
    pub fn top_k(&self) -> Option<usize> {
        (self.top_k > 0).then_some(self.top_k as usize)
    }

    pub fn strategy(&self) -> Strategy {
        if self.mirostat_tau > 0.0 {
            Strategy::Mirostat
        } else if self.beam_width > 0 {
            Strategy::Beam
        } else {
            Strategy::Stateless
        }
    }

    /// Reject settings that would make the sampler pick arbitrarily.
    pub fn validate(&self) -> Result<()> {
        let conflict = |msg: String| -> Result<()> { Err(DecodeError::PolicyConflict(msg).into()) };

        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return conflict(format!("temperature must be >= 0, got {}", self.temperature));
        }
        if self.top_k == 0 {
            return conflict("top_k = 0 keeps no candidates (use -100 to disable)".into());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return conflict(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if self.repetition_penalty <= 0.0 {
            return conflict(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            ));
        }
        if self.mirostat_tau > 0.0 && self.beam_width > 0 {
            return conflict("mirostat and beam search are mutually exclusive".into());
        }
        if self.mirostat_tau > 0.0 && self.mirostat_eta <= 0.0 {
            return conflict(format!("mirostat_eta must be > 0, got {}", self.mirostat_eta));
        }
        if self.dry_multiplier > 0.0 && self.dry_base < 1.0 {
            return conflict(format!("dry_base must be >= 1, got {}", self.dry_base));
        }
        Ok(())
    }
}

/// Chosen ids and their probabilities, one entry per sampled row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sampled {
    pub ids: Vec<u32>,
    /// Probability of each chosen id under the distribution it was drawn from
    pub scores: Vec<f32>,
}

/// Pull a `[rows, vocab]` (or `[vocab]`) tensor into CPU rows.
pub fn logits_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let logits = logits.to_dtype(DType::F32)?;
    match logits.rank() {
        1 => Ok(vec![logits.to_vec1()?]),
        2 => Ok(logits.to_vec2()?),
        r => bail!("expected logits of rank 1 or 2, got rank {r}"),
    }
}

/// Sample every row of every item.
///
/// `logits[i]` is `[rows, vocab]` (or `[vocab]`), `previous[i]` the tokens
/// already chosen for item `i`; an empty `previous` slice means no history.
/// Only the stateless pipeline runs here; mirostat and beam search keep
/// their own state and live in sibling modules.
pub fn sample(
    logits: &[Tensor],
    previous: &[Vec<u32>],
    policy: &SamplingPolicy,
    ctx: &mut SamplingContext,
) -> Result<Vec<Sampled>> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("sample").entered();

    let mut out = Vec::with_capacity(logits.len());
    for (i, item) in logits.iter().enumerate() {
        let history = previous.get(i).map(Vec::as_slice).unwrap_or(&[]);
        let mut sampled = Sampled::default();
        for row in logits_rows(item)? {
            let (id, score) = sample_row(row, history, policy, ctx)?;
            sampled.ids.push(id);
            sampled.scores.push(score);
        }
        out.push(sampled);
    }
    Ok(out)
}

/// Run the stateless pipeline on one row: repetition penalty, DRY,
/// temperature, top-k, top-p, then a multinomial draw (or argmax).
pub fn sample_row(
    mut row: Vec<f32>,
    previous: &[u32],
    policy: &SamplingPolicy,
    ctx: &mut SamplingContext,
) -> Result<(u32, f32)> {
    apply_penalties(&mut row, previous, policy);

    if policy.is_greedy() {
        let id = argmax(&row).ok_or(DecodeError::NoCandidates)?;
        let probs = softmax(&row);
        return Ok((id as u32, probs[id]));
    }

    let temperature = if policy.min_temperature >= 0.0 && policy.min_temperature < policy.temperature
    {
        dynamic_temperature(&row, policy.temperature, policy.min_temperature)
    } else {
        policy.temperature
    };
    if temperature != 1.0 {
        let inv = (1.0 / temperature) as f32;
        for v in row.iter_mut() {
            *v *= inv;
        }
    }

    if let Some(k) = policy.top_k() {
        top_k_filter(&mut row, k);
    }
    if policy.top_p < 1.0 {
        top_p_filter(&mut row, policy.top_p);
    }

    let probs = softmax(&row);
    let id = multinomial(&probs, ctx).ok_or(DecodeError::NoCandidates)?;
    Ok((id as u32, probs[id]))
}

/// Repetition penalty and DRY, the history-dependent adjustments.
pub fn apply_penalties(row: &mut [f32], previous: &[u32], policy: &SamplingPolicy) {
    if previous.is_empty() {
        return;
    }
    if (policy.repetition_penalty - 1.0).abs() > 1e-9 {
        apply_repetition_penalty(
            row,
            previous,
            policy.repetition_penalty,
            policy.repetition_penalty_decay,
        );
    }
    if policy.dry_multiplier > 0.0 {
        apply_dry(
            row,
            previous,
            policy.dry_multiplier,
            policy.dry_base,
            policy.dry_allowed_length,
        );
    }
}

/// Index of the largest finite value.
pub fn argmax(row: &[f32]) -> Option<usize> {
    row.iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite() || **v == f32::INFINITY)
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Numerically stable softmax; all-`-inf` rows come back as all zeros.
pub fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; row.len()];
    }
    let mut out: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = out.iter().sum();
    for v in &mut out {
        *v /= sum;
    }
    out
}

pub fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![f32::NEG_INFINITY; row.len()];
    }
    let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
    row.iter().map(|&v| v - log_sum).collect()
}

/// Keep only the top `k` logits, set the rest to -inf.
pub fn top_k_filter(row: &mut [f32], k: usize) {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_k").entered();
    let k = k.min(row.len());
    if k == 0 || k == row.len() {
        return;
    }
    let mut sorted = row.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for v in row.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Keep the smallest set of logits whose cumulative probability exceeds `p`.
pub fn top_p_filter(row: &mut [f32], p: f64) {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_p").entered();
    let vocab = row.len();
    let mut indices: Vec<usize> = (0..vocab).collect();
    indices.sort_unstable_by(|&a, &b| {
        row[b]
            .partial_cmp(&row[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let probs = softmax(row);
    let mut cumsum = 0.0f32;
    let mut cutoff_idx = vocab;
    for (i, &idx) in indices.iter().enumerate() {
        cumsum += probs[idx];
        if cumsum > p as f32 {
            cutoff_idx = i + 1;
            break;
        }
    }
    for &idx in &indices[cutoff_idx..] {
        row[idx] = f32::NEG_INFINITY;
    }
}

/// Draw an index from `probs` (already normalised).
pub fn multinomial(probs: &[f32], ctx: &mut SamplingContext) -> Option<usize> {
    let u = ctx.next_f32();
    let mut cumsum = 0.0f32;
    let mut last = None;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumsum += p;
        last = Some(i);
        if cumsum > u {
            return Some(i);
        }
    }
    // rounding left cumsum just under u
    last
}

/// Discount tokens already in `previous`.
///
/// Positive logits are divided by the factor, negative logits multiplied.
/// With `decay > 0` the factor for a token last seen `d` steps ago is
/// `1 + (penalty - 1) / d^decay`.
pub fn apply_repetition_penalty(row: &mut [f32], previous: &[u32], penalty: f64, decay: f64) {
    let n = previous.len();
    let mut seen = vec![false; row.len()];
    for (i, &token) in previous.iter().enumerate().rev() {
        let idx = token as usize;
        if idx >= row.len() || seen[idx] {
            continue;
        }
        seen[idx] = true;
        let distance = (n - i) as f64;
        let factor = if decay > 0.0 {
            1.0 + (penalty - 1.0) / distance.powf(decay)
        } else {
            penalty
        } as f32;
        let v = &mut row[idx];
        if *v > 0.0 {
            *v /= factor;
        } else {
            *v *= factor;
        }
    }
}

/// "Don't repeat yourself": penalise tokens that would extend a repeat of
/// an earlier n-gram once the repeat reaches `allowed_length`.
pub fn apply_dry(row: &mut [f32], previous: &[u32], multiplier: f64, base: f64, allowed_length: usize) {
    let n = previous.len();
    if n < 2 {
        return;
    }
    let mut longest = vec![0usize; row.len()];
    for j in 1..n {
        let mut len = 0;
        while len < j && len < DRY_MAX_MATCH && previous[j - 1 - len] == previous[n - 1 - len] {
            len += 1;
        }
        let next = previous[j] as usize;
        if len > 0 && next < row.len() && len > longest[next] {
            longest[next] = len;
        }
    }
    for (idx, &len) in longest.iter().enumerate() {
        if len >= allowed_length && len > 0 {
            row[idx] -= (multiplier * base.powi((len - allowed_length) as i32)) as f32;
        }
    }
}

/// Entropy-adaptive temperature: confident rows are cooled toward
/// `min_temperature`.
pub fn dynamic_temperature(row: &[f32], temperature: f64, min_temperature: f64) -> f64 {
    let p_max = softmax(row).into_iter().fold(0.0f32, f32::max) as f64;
    temperature - (temperature - min_temperature) / (1.0 + (-10.0 * (p_max - 0.5)).exp())
}

/// Scale the stop token's logit by the current length: `len^factor`, sign
/// aware like the repetition penalty.
pub fn apply_length_penalty(row: &mut [f32], stop_token: u32, len: usize, factor: f64) {
    if factor == 0.0 || len == 0 {
        return;
    }
    let Some(v) = row.get_mut(stop_token as usize) else {
        return;
    };
    let scale = (len as f64).powf(factor) as f32;
    if *v > 0.0 {
        *v /= scale;
    } else {
        *v *= scale;
    }
}
