//! Next-token sampling
//!
//! Applies, in order:
//! - repetition penalty over the current context
//! - temperature
//! - an optional allow-list with per-token weights (speaker constraint)
//! - top-k and nucleus (top-p) filtering
//!
//! The RNG is seeded per request so a key always replays the same way.

use crate::config::SamplingParams;
use crate::model::TokenId;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Deterministic seed derived from the path part of a key
#[must_use]
pub fn seed_for_key(key: &str) -> u64 {
    let path = key.split_once('-').map_or(key, |(_, path)| path);
    let digest = Sha256::digest(path.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Seeded sampler
#[derive(Debug)]
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler seeded from a key
    #[must_use]
    pub fn for_key(params: SamplingParams, key: &str) -> Self {
        Self::with_seed(params, seed_for_key(key))
    }

    /// Create a sampler with an explicit seed
    #[must_use]
    pub fn with_seed(params: SamplingParams, seed: u64) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform draw in `[0, 1)` from the same stream
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Pick the next token
    ///
    /// `allowed`, when present, restricts the choice to its keys and scales
    /// each token's probability by its weight. Returns `None` if no token has
    /// any probability left.
    pub fn sample(
        &mut self,
        logits: &[f32],
        context: &[TokenId],
        allowed: Option<&BTreeMap<TokenId, f32>>,
    ) -> Option<TokenId> {
        let mut scores = logits.to_vec();
        self.apply_repetition_penalty(&mut scores, context);

        if let Some(allowed) = allowed {
            for (idx, score) in scores.iter_mut().enumerate() {
                let known = TokenId::try_from(idx).is_ok_and(|id| allowed.contains_key(&id));
                if !known {
                    *score = f32::NEG_INFINITY;
                }
            }
        }

        if self.params.temperature <= 0.0 {
            return argmax(&scores);
        }

        let mut candidates: Vec<(usize, f32)> = scores
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_finite())
            .map(|(i, s)| (i, *s / self.params.temperature))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        if self.params.top_k > 0 {
            candidates.truncate(self.params.top_k);
        }

        let max = candidates[0].1;
        let mut probs: Vec<(usize, f32)> = candidates
            .into_iter()
            .map(|(i, s)| (i, (s - max).exp()))
            .collect();

        if let Some(allowed) = allowed {
            for (idx, p) in &mut probs {
                let weight = TokenId::try_from(*idx)
                    .ok()
                    .and_then(|id| allowed.get(&id))
                    .copied()
                    .unwrap_or(0.0);
                *p *= weight;
            }
            probs.sort_by(|a, b| b.1.total_cmp(&a.1));
        }

        let total: f32 = probs.iter().map(|(_, p)| p).sum();
        if total.is_nan() || total <= 0.0 {
            return None;
        }

        let mut cumulative = 0.0;
        let mut nucleus = Vec::with_capacity(probs.len());
        for (idx, p) in probs {
            if p <= 0.0 {
                continue;
            }
            let p = p / total;
            nucleus.push((idx, p));
            cumulative += p;
            if cumulative >= self.params.top_p {
                break;
            }
        }

        let dist = WeightedIndex::new(nucleus.iter().map(|(_, p)| *p)).ok()?;
        let (idx, _) = nucleus[dist.sample(&mut self.rng)];
        TokenId::try_from(idx).ok()
    }

    fn apply_repetition_penalty(&self, scores: &mut [f32], context: &[TokenId]) {
        let penalty = self.params.repetition_penalty;
        if (penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        let seen: HashSet<TokenId> = context.iter().copied().collect();
        for token in seen {
            if let Some(score) = scores.get_mut(token as usize) {
                *score = if *score > 0.0 { *score / penalty } else { *score * penalty };
            }
        }
    }
}

fn argmax(scores: &[f32]) -> Option<TokenId> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .and_then(|(i, _)| TokenId::try_from(i).ok())
}
