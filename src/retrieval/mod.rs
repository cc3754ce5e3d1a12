//! Multi-signal memory retrieval.
//!
//! [`Retriever::retrieve`] gathers per-layer KNN candidates, scores each
//! with the deterministic five-signal combination in [`scoring`], applies a
//! stable total ordering, and returns the top k with full signal breakdowns.
//! An empty result is a normal outcome, not an error.

pub mod candidates;
pub mod scoring;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::{LifecycleConfig, RetrievalConfig};
use crate::errors::Result;
use crate::lifecycle;
use crate::memory::types::MemoryRecord;
use crate::procedural::AugmentationHint;
use crate::retrieval::candidates::{LayerCandidate, LayerCounts};
use crate::retrieval::scoring::SignalBreakdown;

/// A query against memory: whose memories, and which entities are in focus.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub user_id: String,
    /// Entity IDs the current conversation is about, from resolution.
    pub focus_entities: Vec<String>,
}

/// One retrieved memory with its combined score and signal breakdown.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f64,
    pub breakdown: SignalBreakdown,
}

/// The ranked result set plus how it was produced.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetrievalResult {
    pub memories: Vec<ScoredMemory>,
    /// Candidates considered before truncation to top k.
    pub candidates_considered: usize,
    /// Candidates each layer contributed after deduplication.
    pub layer_counts: LayerCounts,
    /// Wall-clock time spent gathering and scoring, in milliseconds.
    pub elapsed_ms: u64,
    /// Procedural augmentation hints riding along with the result. Filled
    /// by callers that know the interaction's features; see
    /// [`crate::procedural::match_patterns`].
    pub hints: Vec<AugmentationHint>,
}

pub struct Retriever {
    db: Arc<Mutex<Connection>>,
    config: RetrievalConfig,
    lifecycle: LifecycleConfig,
}

impl Retriever {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        config: RetrievalConfig,
        lifecycle: LifecycleConfig,
    ) -> Self {
        Self {
            db,
            config,
            lifecycle,
        }
    }

    /// Retrieve the top-k memories for a query embedding.
    pub async fn retrieve(
        &self,
        embedding: &[f32],
        context: &QueryContext,
    ) -> Result<RetrievalResult> {
        let started = Instant::now();
        let (gathered, layer_counts) = candidates::gather_candidates(
            Arc::clone(&self.db),
            &self.config,
            embedding,
            &context.user_id,
        )
        .await;

        // A zero-norm query carries no semantic information: that signal
        // goes neutral (0) and the remaining signals decide the ranking.
        let zero_query = embedding.iter().all(|v| *v == 0.0);

        let now = Utc::now();
        let considered = gathered.len();
        let mut scored: Vec<ScoredMemory> = gathered
            .into_iter()
            .map(|mut candidate| {
                if zero_query {
                    candidate.similarity = 0.0;
                }
                self.score_candidate(candidate, context, now)
            })
            .collect();

        sort_ranked(&mut scored);
        scored.truncate(self.config.top_k);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            considered,
            returned = scored.len(),
            focus = context.focus_entities.len(),
            elapsed_ms,
            "retrieval complete"
        );
        Ok(RetrievalResult {
            memories: scored,
            candidates_considered: considered,
            layer_counts,
            elapsed_ms,
            hints: Vec::new(),
        })
    }

    fn score_candidate(
        &self,
        candidate: LayerCandidate,
        context: &QueryContext,
        now: DateTime<Utc>,
    ) -> ScoredMemory {
        let record = candidate.record;
        let created = lifecycle::parse_timestamp(&record.created_at);
        let age_days = (now - created).num_seconds().max(0) as f64 / 86_400.0;

        // Decay is applied lazily: score against the effective confidence,
        // anchored at the last reinforcement if there was one.
        let anchor = record
            .last_reinforced_at
            .as_deref()
            .map(lifecycle::parse_timestamp)
            .unwrap_or(created);
        let effective = lifecycle::effective_confidence(
            &self.lifecycle,
            record.confidence,
            record.layer,
            anchor,
            now,
        );

        let (score, breakdown) = scoring::score(
            candidate.similarity,
            &context.focus_entities,
            &candidate.entity_ids,
            age_days,
            self.config.recency_half_life_days,
            effective,
            record.layer.priority(),
        );
        ScoredMemory {
            record,
            score,
            breakdown,
        }
    }
}

/// Stable total ordering: score desc, then layer priority desc, then
/// recency desc, then id asc. Two runs over the same store produce the
/// same ranking.
fn sort_ranked(scored: &mut [ScoredMemory]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.record
                    .layer
                    .priority()
                    .partial_cmp(&a.record.layer.priority())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}
