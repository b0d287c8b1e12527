//! Deterministic candidate scoring and ranking.

use std::cmp::Ordering;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::scenario::ScenarioCandidate;

/// Scores closer than this are considered tied.
pub const TIE_EPSILON: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoringWeights {
    pub acceptance: f64,
    pub value: f64,
    pub speed: f64,
    pub confidence: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { acceptance: 0.4, value: 0.3, speed: 0.2, confidence: 0.1 }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScenarioScorer {
    weights: ScoringWeights,
}

impl ScenarioScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Position of the predicted counter between floor (0) and target (1).
    pub fn normalized_value(counter: Decimal, floor: Decimal, target: Decimal) -> f64 {
        if target <= floor {
            return if counter >= floor { 1.0 } else { 0.0 };
        }
        let ratio = (counter - floor) / (target - floor);
        ratio.to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
    }

    pub fn score(&self, candidate: &ScenarioCandidate, floor: Decimal, target: Decimal) -> f64 {
        let close_days = f64::from(candidate.predicted_close_days.max(1));
        let value = Self::normalized_value(candidate.predicted_counter, floor, target);
        let acceptance = finite_or_zero(candidate.acceptance_likelihood);
        let confidence = finite_or_zero(candidate.confidence);

        100.0
            * (self.weights.acceptance * acceptance
                + self.weights.value * value
                + self.weights.speed * (1.0 / close_days)
                + self.weights.confidence * confidence)
    }

    /// Scores every candidate from scratch and returns them best first.
    ///
    /// Candidates are ordered by score; runs of scores within
    /// [`TIE_EPSILON`] of the run's leader are then reordered by acceptance,
    /// closeness to Balanced, and archetype order.
    pub fn rank(
        &self,
        candidates: Vec<ScenarioCandidate>,
        floor: Decimal,
        target: Decimal,
    ) -> Vec<ScenarioCandidate> {
        let mut scored: Vec<ScenarioCandidate> = candidates
            .into_iter()
            .map(|mut candidate| {
                candidate.score = self.score(&candidate, floor, target);
                candidate
            })
            .collect();

        scored.sort_by(|left, right| {
            right.score.total_cmp(&left.score).then_with(|| tie_break(left, right))
        });

        let mut ranked = Vec::with_capacity(scored.len());
        let mut group: Vec<ScenarioCandidate> = Vec::new();
        for candidate in scored {
            let starts_new_group =
                group.first().is_some_and(|leader| leader.score - candidate.score >= TIE_EPSILON);
            if starts_new_group {
                group.sort_by(tie_break);
                ranked.append(&mut group);
            }
            group.push(candidate);
        }
        group.sort_by(tie_break);
        ranked.append(&mut group);
        ranked
    }
}

fn tie_break(left: &ScenarioCandidate, right: &ScenarioCandidate) -> Ordering {
    right
        .acceptance_likelihood
        .total_cmp(&left.acceptance_likelihood)
        .then_with(|| left.archetype.balance_distance().cmp(&right.archetype.balance_distance()))
        .then_with(|| left.archetype.list_position().cmp(&right.archetype.list_position()))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
