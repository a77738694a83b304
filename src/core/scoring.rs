use crate::core::filters::{intent_overlap, is_excluded_pair};
use crate::error::MatchingError;
use crate::models::{Participant, ScoringWeights};

/// Pairwise and group compatibility scoring
///
/// Scoring formula (0-1):
/// score = (
///     weighted_cosine(traits) * traits_weight +   # similar personalities = higher
///     jaccard(intent) * intent_weight             # shared relationship intent = higher
/// ) / (traits_weight + intent_weight)
///
/// A pair excluded by a gender-mix preference always scores 0.
#[derive(Debug, Clone)]
pub struct CompatibilityScorer {
    weights: ScoringWeights,
}

impl CompatibilityScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn with_default_weights() -> Self {
        Self {
            weights: ScoringWeights::default(),
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Trait vector dimensionality every participant must match
    pub fn dimensions(&self) -> usize {
        self.weights.dimensions.len()
    }

    pub fn validate(&self, participant: &Participant) -> Result<(), MatchingError> {
        participant
            .trait_vector
            .validate(&participant.user_id, self.dimensions())
    }

    pub fn is_excluded(&self, a: &Participant, b: &Participant) -> bool {
        is_excluded_pair(a, b, self.weights.depends_rule)
    }

    /// Symmetric compatibility of two participants, in [0, 1]
    pub fn pair_score(&self, a: &Participant, b: &Participant) -> Result<f64, MatchingError> {
        self.validate(a)?;
        self.validate(b)?;

        if self.is_excluded(a, b) {
            return Ok(0.0);
        }

        Ok(self.unchecked_score(a, b))
    }

    /// Mean of all pairwise scores; groups with fewer than two members score 0
    pub fn group_score(&self, members: &[&Participant]) -> Result<f64, MatchingError> {
        if members.len() < 2 {
            return Ok(0.0);
        }

        let mut total = 0.0;
        let mut pairs = 0usize;
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                total += self.pair_score(a, b)?;
                pairs += 1;
            }
        }

        Ok(total / pairs as f64)
    }

    /// Score two already-validated, non-excluded participants
    pub(crate) fn unchecked_score(&self, a: &Participant, b: &Participant) -> f64 {
        let traits = weighted_cosine(
            a.trait_vector.values(),
            b.trait_vector.values(),
            &self.weights.dimensions,
        );
        let intent = intent_overlap(a, b);

        let weight_sum = self.weights.traits + self.weights.intent;
        if weight_sum <= 0.0 {
            return 0.0;
        }

        let score = (traits * self.weights.traits + intent * self.weights.intent) / weight_sum;
        score.clamp(0.0, 1.0)
    }
}

impl Default for CompatibilityScorer {
    fn default() -> Self {
        Self::with_default_weights()
    }
}

/// Weighted cosine similarity (0-1 for non-negative vectors)
#[inline]
fn weighted_cosine(a: &[f64], b: &[f64], weights: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for ((x, y), w) in a.iter().zip(b.iter()).zip(weights.iter()) {
        dot += w * (x * y);
        norm_a += w * x * x;
        norm_b += w * y * y;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}
