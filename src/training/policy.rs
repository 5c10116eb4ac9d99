//! Knobs for the training-target builder.

use serde::{Deserialize, Serialize};

/// Which objective family the model trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingRegime {
    /// Discrete-level AR (level 0) + NAR (levels >= 1)
    #[default]
    ArNar,
    /// Adds demasking timesteps on top of discrete levels
    Masked,
}

/// Distribution the per-item RVQ level is drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelDistribution {
    /// Uniform over the level range
    Equal,
    /// Level `i` weighted by how many levels sit at or above it
    #[default]
    Triangular,
    /// Fixed bell-shaped table over 8 levels
    Normal,
    /// Draw uniformly from this list (repeat entries to weight them)
    Explicit(Vec<usize>),
}

/// Bell-shaped level table, one entry per draw slot.
const NORMAL_LEVELS: [usize; 30] = [
    0, //
    1, 1, //
    2, 2, 2, 2, //
    3, 3, 3, 3, 3, 3, 3, 3, //
    4, 4, 4, 4, 4, 4, 4, 4, //
    5, 5, 5, 5, //
    6, 6, //
    7,
];

impl LevelDistribution {
    /// Expand into the list of equally likely draws over `[lo, hi]`.
    pub fn table(&self, lo: usize, hi: usize) -> Vec<usize> {
        match self {
            Self::Equal => (lo..=hi).collect(),
            Self::Triangular => (lo..=hi)
                .flat_map(|i| std::iter::repeat(i).take(hi + 1 - i))
                .collect(),
            Self::Normal => {
                let inside: Vec<usize> = NORMAL_LEVELS
                    .iter()
                    .copied()
                    .filter(|l| (lo..=hi).contains(l))
                    .collect();
                if inside.is_empty() {
                    NORMAL_LEVELS.to_vec()
                } else {
                    inside
                }
            }
            Self::Explicit(levels) => levels.clone(),
        }
    }
}

/// How a drawn timestep is mapped before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingRatio {
    /// Timestep used as drawn, in `[0, 1)`
    #[default]
    Random,
    /// Squeezed into `[0.2, 0.8)`
    Rand,
}

impl MaskingRatio {
    pub fn map(&self, t: f32) -> f32 {
        match self {
            Self::Random => t,
            Self::Rand => t * 0.6 + 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingPolicy {
    pub regime: TrainingRegime,
    pub rvq_levels_p: LevelDistribution,
    /// Inclusive level range; defaults to `[0 if causal else 1, n_resp_levels - 1]`
    pub rvq_level_range: Option<(usize, usize)>,
    /// Per-token probability of a ±1 perturbation below the target level
    pub token_dropout_error: f64,
    /// Target levels (inclusive) that get token dropout; defaults to all
    pub token_dropout_rvq_levels: Option<(usize, usize)>,
    /// Valid range for perturbed tokens, keeps them off reserved ids
    pub token_dropout_clamp: (u32, u32),
    /// Chance an item trains demasking instead of a discrete level
    pub masking_train_p: f64,
    pub masking_ratio: MaskingRatio,
    /// Levels (inclusive) eligible for demasking; defaults to all
    pub masking_train_rvq_levels: Option<(usize, usize)>,
    /// Drop the prompt audio
    pub cfg_prom_dropout_p: f64,
    /// Drop text and prompt audio together
    pub cfg_cond_dropout_p: f64,
    /// Swap phonemes for raw text when raw text is present
    pub use_raw_text_p: f64,
}

impl Default for TrainingPolicy {
    fn default() -> Self {
        Self {
            regime: TrainingRegime::ArNar,
            rvq_levels_p: LevelDistribution::Triangular,
            rvq_level_range: None,
            token_dropout_error: 0.0,
            token_dropout_rvq_levels: None,
            token_dropout_clamp: (1, 1022),
            masking_train_p: 0.5,
            masking_ratio: MaskingRatio::Random,
            masking_train_rvq_levels: None,
            cfg_prom_dropout_p: 0.0,
            cfg_cond_dropout_p: 0.0,
            use_raw_text_p: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangular_table() {
        let table = LevelDistribution::Triangular.table(0, 2);
        assert_eq!(table, vec![0, 0, 0, 1, 1, 2]);
        let table = LevelDistribution::Triangular.table(1, 3);
        assert_eq!(table, vec![1, 1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_equal_and_normal_tables() {
        assert_eq!(LevelDistribution::Equal.table(1, 3), vec![1, 2, 3]);
        let normal = LevelDistribution::Normal.table(0, 7);
        assert_eq!(normal.len(), 30);
        assert_eq!(normal.iter().filter(|l| **l == 3).count(), 8);
        assert!(LevelDistribution::Normal.table(1, 7).iter().all(|l| *l >= 1));
    }

    #[test]
    fn test_masking_ratio() {
        assert_eq!(MaskingRatio::Random.map(0.5), 0.5);
        assert!((MaskingRatio::Rand.map(0.0) - 0.2).abs() < 1e-6);
        assert!((MaskingRatio::Rand.map(1.0) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_policy_serde() {
        let policy: TrainingPolicy = serde_json::from_str(
            r#"{"regime": "masked", "rvq_levels_p": {"explicit": [0, 0, 1]}, "masking_ratio": "rand"}"#,
        )
        .unwrap();
        assert_eq!(policy.regime, TrainingRegime::Masked);
        assert_eq!(policy.rvq_levels_p, LevelDistribution::Explicit(vec![0, 0, 1]));
        assert_eq!(policy.token_dropout_clamp, (1, 1022));
        assert!((policy.masking_train_p - 0.5).abs() < 1e-9);
    }
}
