//! Deterministic multi-signal relevance scoring.
//!
//! Every candidate gets a weighted combination of five signals, each
//! normalized to [0, 1] before weighting. The scorer is a pure function of
//! its inputs: same candidate, same query, same clock — same score. The
//! full [`SignalBreakdown`] is kept alongside the combined score so callers
//! can explain *why* a memory ranked where it did.

use serde::Serialize;

use crate::lifecycle::CONFIDENCE_CEILING;

/// Signal weights. They sum to 1.0; the combined score stays in [0, 1].
pub const W_SEMANTIC: f64 = 0.35;
pub const W_ENTITY: f64 = 0.25;
pub const W_RECENCY: f64 = 0.20;
pub const W_CONFIDENCE: f64 = 0.10;
pub const W_LAYER: f64 = 0.10;

/// The five weighted signal contributions behind a combined score.
///
/// Each field is the signal's normalized [0, 1] value already multiplied by
/// its weight, so the five contributions sum exactly to the total score.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SignalBreakdown {
    /// Embedding similarity between query and memory content.
    pub semantic: f64,
    /// Overlap between the query's focus entities and the memory's links.
    pub entity: f64,
    /// Exponential recency, half-life configured per deployment.
    pub recency: f64,
    /// Effective (decayed) confidence, normalized by the ceiling.
    pub confidence: f64,
    /// Fixed layer priority.
    pub layer: f64,
}

impl SignalBreakdown {
    /// Sum of the weighted contributions.
    pub fn total(&self) -> f64 {
        self.semantic + self.entity + self.recency + self.confidence + self.layer
    }
}

/// Exponential recency signal: 1.0 at zero age, halving every
/// `half_life_days`. Negative ages (clock skew) count as fresh.
pub fn recency_signal(age_days: f64, half_life_days: f64) -> f64 {
    if age_days <= 0.0 || half_life_days <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_days / half_life_days)
}

/// Entity-overlap signal: the fraction of focus entities the memory is
/// linked to. With no focus entities the signal is neutral (0), the same
/// treatment zero-vector embeddings get from similarity.
pub fn entity_signal(focus_entities: &[String], linked_entities: &[String]) -> f64 {
    if focus_entities.is_empty() {
        return 0.0;
    }
    let hits = focus_entities
        .iter()
        .filter(|e| linked_entities.contains(e))
        .count();
    hits as f64 / focus_entities.len() as f64
}

/// Normalize an effective confidence into [0, 1].
pub fn confidence_signal(effective_confidence: f64) -> f64 {
    (effective_confidence / CONFIDENCE_CEILING).clamp(0.0, 1.0)
}

/// Combine raw signal inputs into a breakdown and its score.
pub fn score(
    semantic_similarity: f64,
    focus_entities: &[String],
    linked_entities: &[String],
    age_days: f64,
    half_life_days: f64,
    effective_confidence: f64,
    layer_priority: f64,
) -> (f64, SignalBreakdown) {
    let breakdown = SignalBreakdown {
        semantic: W_SEMANTIC * semantic_similarity.clamp(0.0, 1.0),
        entity: W_ENTITY * entity_signal(focus_entities, linked_entities),
        recency: W_RECENCY * recency_signal(age_days, half_life_days),
        confidence: W_CONFIDENCE * confidence_signal(effective_confidence),
        layer: W_LAYER * layer_priority.clamp(0.0, 1.0),
    };
    (breakdown.total(), breakdown)
}
