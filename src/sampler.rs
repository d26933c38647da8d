// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token selection.
//!
//! The mode is a closed [`SamplingMode`] resolved once from its name when
//! the session is configured; [`Sampler::sample`] never dispatches on
//! strings.
//!
//! Greedy argmax policy:
//! - ties resolve to the **lowest** index;
//! - `NaN` scores are skipped;
//! - empty or all-`NaN` logits are a [`ChainError::Sampling`] error.

use std::collections::HashSet;

use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::Deserialize;

use crate::engine::Logits;
use crate::error::{ChainError, Result};

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Parameters of [`SamplingMode::PenaltySample`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PenaltyParams {
    /// Softmax temperature; must be positive.
    pub temperature: f32,
    /// Nucleus mass in `(0, 1]`.
    pub top_p: f32,
    /// Divisor for positive (multiplier for negative) scores of recent tokens.
    pub repeat_penalty: f32,
    /// How many of the most recent tokens are penalized.
    pub repeat_last_n: usize,
}

impl Default for PenaltyParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            repeat_penalty: 1.2,
            repeat_last_n: 32,
        }
    }
}

impl PenaltyParams {
    /// Check the parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Config`] for a non-positive temperature or
    /// penalty, or a `top_p` outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(ChainError::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ChainError::Config(format!(
                "top_p must lie in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.repeat_penalty > 0.0 && self.repeat_penalty.is_finite()) {
            return Err(ChainError::Config(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }
}

/// How the next token is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    /// Arg-max over the vocabulary.
    Greedy,
    /// Repetition penalty, temperature and nucleus sampling.
    PenaltySample(PenaltyParams),
}

impl SamplingMode {
    /// Resolve a mode name (`greedy` or `penalty_sample`).
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnsupportedSamplingMode`] for any other name,
    /// or [`ChainError::Config`] if `params` are out of range for
    /// `penalty_sample`.
    pub fn from_name(name: &str, params: PenaltyParams) -> Result<Self> {
        match name {
            "greedy" => Ok(Self::Greedy),
            "penalty_sample" => {
                params.validate()?;
                Ok(Self::PenaltySample(params))
            }
            other => Err(ChainError::UnsupportedSamplingMode(other.to_owned())),
        }
    }

    /// Name the mode is configured under.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Greedy => "greedy",
            Self::PenaltySample(_) => "penalty_sample",
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// A resolved sampling mode plus its random source.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Selection rule.
    mode: SamplingMode,
    /// Random source for stochastic modes.
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler; `seed` makes stochastic modes reproducible.
    #[must_use]
    pub fn new(mode: SamplingMode, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self { mode, rng }
    }

    /// The configured mode.
    #[must_use]
    pub const fn mode(&self) -> &SamplingMode {
        &self.mode
    }

    /// Pick the next token.
    ///
    /// `history` is the token sequence so far, most recent last; only
    /// penalty sampling reads it.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Sampling`] if no token can be selected.
    pub fn sample(&mut self, logits: &Logits, history: &[u32]) -> Result<u32> {
        match self.mode {
            SamplingMode::Greedy => greedy(logits.as_slice()),
            SamplingMode::PenaltySample(params) => {
                penalty_sample(logits.as_slice(), &params, history, &mut self.rng)
            }
        }
    }
}

/// Arg-max with lowest-index tie-break, skipping `NaN`.
///
/// # Errors
///
/// Returns [`ChainError::Sampling`] for empty or all-`NaN` logits.
pub fn greedy(logits: &[f32]) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in logits.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }
    let (idx, _) = best.ok_or_else(|| {
        ChainError::Sampling(format!("no finite-comparable score among {} logits", logits.len()))
    })?;
    to_token(idx)
}

/// Convert a vocabulary index to a token id.
fn to_token(idx: usize) -> Result<u32> {
    u32::try_from(idx).map_err(|_| ChainError::Sampling(format!("index {idx} exceeds u32")))
}

/// Penalize recent tokens, apply temperature, sample from the top-p nucleus.
fn penalty_sample(
    logits: &[f32],
    params: &PenaltyParams,
    history: &[u32],
    rng: &mut StdRng,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(ChainError::Sampling("empty logits".into()));
    }
    let mut scores = logits.to_vec();

    let window = history
        .get(history.len().saturating_sub(params.repeat_last_n)..)
        .unwrap_or_default();
    let recent: HashSet<u32> = window.iter().copied().collect();
    for token in recent {
        let Some(score) = usize::try_from(token).ok().and_then(|t| scores.get_mut(t)) else {
            continue;
        };
        *score = if *score < 0.0 {
            *score * params.repeat_penalty
        } else {
            *score / params.repeat_penalty
        };
    }

    // Numerically stable softmax; NaN scores get zero mass.
    let max = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<(usize, f32)> = scores
        .iter()
        .enumerate()
        .map(|(idx, &s)| {
            let p = if s.is_nan() {
                0.0
            } else {
                ((s - max) / params.temperature).exp()
            };
            (idx, p)
        })
        .collect();
    let total: f32 = probs.iter().map(|&(_, p)| p).sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(ChainError::Sampling("logits carry no probability mass".into()));
    }

    // Nucleus: most probable first (stable, so ties keep index order),
    // keep tokens until their mass reaches top_p, always at least one.
    probs.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept = 0;
    let mut mass = 0.0;
    for &(_, p) in &probs {
        kept += 1;
        mass += p / total;
        if mass >= params.top_p {
            break;
        }
    }
    probs.truncate(kept);

    let dist = WeightedIndex::new(probs.iter().map(|&(_, p)| p))
        .map_err(|e| ChainError::Sampling(format!("weighted index: {e}")))?;
    let (idx, _) = probs
        .get(dist.sample(rng))
        .copied()
        .ok_or_else(|| ChainError::Sampling("sample outside nucleus".into()))?;
    to_token(idx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
