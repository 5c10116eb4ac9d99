//! Beam search over AR decode steps.
//!
//! Each batch item owns `width` hypotheses, laid out group-major in the
//! model batch (`row = item * width + beam`). Hypotheses start identical,
//! so the first step only expands beam 0. Finished hypotheses are frozen
//! and keep competing on their final score.

use anyhow::{bail, Result};

use super::sampling::{apply_penalties, log_softmax, SamplingPolicy};
use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    /// Cumulative log-probability
    pub score: f64,
    pub finished: bool,
}

impl Hypothesis {
    /// Score normalised by `len^length_penalty`.
    pub fn normalized_score(&self, length_penalty: f64) -> f64 {
        if length_penalty == 0.0 {
            return self.score;
        }
        let len = self.tokens.len().max(1) as f64;
        self.score / len.powf(length_penalty)
    }
}

/// Outcome of one beam step, one entry per model row.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStep {
    /// Source row each new row continues from
    pub parents: Vec<usize>,
    /// Token appended to each row (the stop token for frozen rows)
    pub tokens: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct BeamState {
    width: usize,
    groups: Vec<Vec<Hypothesis>>,
    started: bool,
}

struct Candidate {
    parent: usize,
    token: Option<u32>,
    score: f64,
}

impl BeamState {
    pub fn new(items: usize, width: usize) -> Result<Self> {
        if width == 0 {
            bail!(DecodeError::PolicyConflict("beam width must be > 0".into()));
        }
        let empty = Hypothesis {
            tokens: Vec::new(),
            score: 0.0,
            finished: false,
        };
        Ok(Self {
            width,
            groups: vec![vec![empty; width]; items],
            started: false,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows in the expanded model batch.
    pub fn rows(&self) -> usize {
        self.groups.len() * self.width
    }

    pub fn hypotheses(&self, item: usize) -> &[Hypothesis] {
        &self.groups[item]
    }

    /// Hypothesis feeding model row `row`.
    pub fn row(&self, row: usize) -> &Hypothesis {
        &self.groups[row / self.width][row % self.width]
    }

    pub fn all_finished(&self) -> bool {
        self.groups.iter().flatten().all(|h| h.finished)
    }

    /// Expand every live hypothesis by its best continuations and keep the
    /// top `width` per item. `rows[r]` are raw logits for model row `r`,
    /// `stop_tokens[item]` ends a hypothesis.
    pub fn step(
        &mut self,
        rows: &[Vec<f32>],
        stop_tokens: &[u32],
        policy: &SamplingPolicy,
    ) -> Result<BeamStep> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("beam_step").entered();

        if rows.len() != self.rows() {
            bail!(
                "beam step expected {} logit rows, got {}",
                self.rows(),
                rows.len()
            );
        }

        let width = self.width;
        let mut parents = Vec::with_capacity(self.rows());
        let mut tokens = Vec::with_capacity(self.rows());
        let live_beams = if self.started { width } else { 1 };

        for (g, group) in self.groups.iter_mut().enumerate() {
            let stop = stop_tokens.get(g).copied().unwrap_or(u32::MAX);
            let mut candidates = Vec::new();

            for (b, hyp) in group.iter().enumerate().take(live_beams) {
                if hyp.finished {
                    candidates.push(Candidate {
                        parent: b,
                        token: None,
                        score: hyp.score,
                    });
                    continue;
                }
                let mut row = rows[g * width + b].clone();
                apply_penalties(&mut row, &hyp.tokens, policy);
                if policy.temperature > 0.0 && policy.temperature != 1.0 {
                    let inv = (1.0 / policy.temperature) as f32;
                    row.iter_mut().for_each(|v| *v *= inv);
                }
                let logp = log_softmax(&row);
                let mut order: Vec<usize> =
                    (0..logp.len()).filter(|&i| logp[i].is_finite()).collect();
                order.sort_unstable_by(|&a, &b| {
                    logp[b]
                        .partial_cmp(&logp[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &t in order.iter().take(width) {
                    candidates.push(Candidate {
                        parent: b,
                        token: Some(t as u32),
                        score: hyp.score + logp[t] as f64,
                    });
                }
            }

            if candidates.is_empty() {
                return Err(DecodeError::NoCandidates.into());
            }
            candidates.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            // Fewer candidates than beams only happens with tiny vocabularies;
            // pad by repeating the best.
            let chosen: Vec<&Candidate> = (0..width)
                .map(|i| &candidates[i.min(candidates.len() - 1)])
                .collect();

            let next: Vec<Hypothesis> = chosen
                .iter()
                .map(|c| {
                    let parent = &group[c.parent];
                    match c.token {
                        None => parent.clone(),
                        Some(token) => {
                            let mut tokens = parent.tokens.clone();
                            tokens.push(token);
                            Hypothesis {
                                tokens,
                                score: c.score,
                                finished: token == stop,
                            }
                        }
                    }
                })
                .collect();

            for c in &chosen {
                parents.push(g * width + c.parent);
                tokens.push(c.token.unwrap_or(stop));
            }
            *group = next;
        }

        self.started = true;
        Ok(BeamStep { parents, tokens })
    }

    /// Winning hypothesis per item by length-normalised score.
    pub fn best(&self, length_penalty: f64) -> Vec<&Hypothesis> {
        self.groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .fold(None, |best: Option<&Hypothesis>, h| match best {
                        Some(b)
                            if b.normalized_score(length_penalty)
                                >= h.normalized_score(length_penalty) =>
                        {
                            Some(b)
                        }
                        _ => Some(h),
                    })
                    .unwrap_or(&group[0])
            })
            .collect()
    }
}
