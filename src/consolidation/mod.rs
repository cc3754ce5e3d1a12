//! Background consolidation — synthesizing fine-grained memories into
//! durable summaries.
//!
//! [`Consolidator::run_scope`] drives one scope through the state machine
//! in [`scopes`]: claim, gather sources, synthesize (external capability
//! with bounded retries, deterministic extraction as the fallback), persist
//! the summary, mark sources consolidated, and complete or fail the scope.
//! Everything here runs off the interactive path; failures are recorded on
//! the scope and retried at the next trigger evaluation, never surfaced to
//! a conversation.

pub mod scopes;

use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use crate::capability::{
    with_retry, KeyFact, RetryPolicy, SourceMemory, SynthesisOutput, SynthesisProvider,
};
use crate::config::{ConsolidationConfig, LifecycleConfig};
use crate::db::with_conn;
use crate::embedding::{embedding_to_bytes, EmbeddingProvider};
use crate::errors::Result;
use crate::lifecycle;
use crate::memory::store::write_audit_log;
use crate::memory::types::{MemoryLayer, MemoryRecord};
use crate::consolidation::scopes::{ConsolidationScope, ScopeKind, ScopeState};

/// Outcome of driving one scope, reported to the trigger entry point.
#[derive(Debug, Clone)]
pub enum ScopeOutcome {
    /// The scope was not eligible (pending, already claimed, or absent).
    Pending,
    /// A summary was produced and persisted.
    Completed { summary_id: String },
    /// Synthesis and persistence both failed; recorded on the scope.
    Failed { error: String },
}

pub struct Consolidator {
    db: Arc<Mutex<Connection>>,
    synthesis: Option<Arc<dyn SynthesisProvider>>,
    embedder: Arc<dyn EmbeddingProvider + Send + Sync>,
    config: ConsolidationConfig,
    lifecycle: LifecycleConfig,
}

impl Consolidator {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        synthesis: Option<Arc<dyn SynthesisProvider>>,
        embedder: Arc<dyn EmbeddingProvider + Send + Sync>,
        config: ConsolidationConfig,
        lifecycle: LifecycleConfig,
    ) -> Self {
        Self {
            db,
            synthesis,
            embedder,
            config,
            lifecycle,
        }
    }

    /// Re-evaluate trigger thresholds and run every scope that fires.
    /// Returns (scope key, outcome) pairs.
    pub async fn run_pending(&self) -> Result<Vec<(String, ScopeOutcome)>> {
        let config = self.config.clone();
        let triggered = with_conn(Arc::clone(&self.db), move |conn| {
            scopes::evaluate_triggers(conn, &config)
        })
        .await?;

        let mut outcomes = Vec::new();
        for key in triggered {
            let outcome = self.run_scope(&key).await?;
            outcomes.push((key, outcome));
        }
        Ok(outcomes)
    }

    /// Drive one scope through claim → synthesis → summary.
    ///
    /// A scope another worker holds, or one that has not triggered, is a
    /// `Pending` no-op. Once claimed, the job runs to completion or
    /// explicit failure; it is never cancelled mid-synthesis.
    pub async fn run_scope(&self, key: &str) -> Result<ScopeOutcome> {
        let config = self.config.clone();
        let lifecycle_config = self.lifecycle.clone();
        let claim_key = key.to_string();
        let claimed = with_conn(Arc::clone(&self.db), move |conn| {
            if !scopes::claim_scope(conn, &config, &claim_key)? {
                let state = scopes::get_scope(conn, &claim_key)?.map(|s| s.state);
                tracing::debug!(scope = %claim_key, ?state, "scope not claimable");
                return Ok(None);
            }
            let scope = scopes::get_scope(conn, &claim_key)?;
            let Some(scope) = scope else { return Ok(None) };
            // Snapshot decayed confidences, then gather with them applied.
            for source in scopes::gather_sources(conn, &scope)? {
                lifecycle::persist_decay(conn, &lifecycle_config, &source.id)?;
            }
            let sources = scopes::gather_sources(conn, &scope)?;
            Ok(Some((scope, sources)))
        })
        .await?;

        let Some((scope, sources)) = claimed else {
            return Ok(ScopeOutcome::Pending);
        };
        if sources.is_empty() {
            // Sources evaporated between trigger and claim.
            let release_key = key.to_string();
            with_conn(Arc::clone(&self.db), move |conn| {
                scopes::release_scope(conn, &release_key)
            })
            .await?;
            return Ok(ScopeOutcome::Pending);
        }

        tracing::info!(scope = %key, sources = sources.len(), "consolidation claimed");
        let synthesis = self.synthesize(&sources).await;

        // A failed embed is recorded on the scope like any other failure;
        // background work never escalates out of the consolidator.
        let embedding = match self.embedder.embed(&synthesis.narrative) {
            Ok(embedding) => embedding,
            Err(err) => {
                let error = format!("summary embedding: {err}");
                let fail_key = key.to_string();
                let msg = error.clone();
                with_conn(Arc::clone(&self.db), move |conn| {
                    scopes::fail_scope(conn, &fail_key, &msg)
                })
                .await?;
                tracing::warn!(scope = %key, error = %error, "consolidation failed");
                return Ok(ScopeOutcome::Failed { error });
            }
        };

        let persist_key = key.to_string();
        let scope_for_store = scope.clone();
        let stored = with_conn(Arc::clone(&self.db), move |conn| {
            store_summary(conn, &scope_for_store, &sources, &synthesis, &embedding)
        })
        .await;

        match stored {
            Ok(summary_id) => {
                let complete_key = key.to_string();
                let id = summary_id.clone();
                with_conn(Arc::clone(&self.db), move |conn| {
                    scopes::complete_scope(conn, &complete_key, &id)
                })
                .await?;
                tracing::info!(scope = %key, summary = %summary_id, "consolidation completed");
                Ok(ScopeOutcome::Completed { summary_id })
            }
            Err(err) => {
                let error = err.to_string();
                let fail_key = key.to_string();
                let msg = error.clone();
                with_conn(Arc::clone(&self.db), move |conn| {
                    scopes::fail_scope(conn, &fail_key, &msg)
                })
                .await?;
                tracing::warn!(scope = %key, error = %error, "consolidation failed");
                Ok(ScopeOutcome::Failed { error })
            }
        }
    }

    /// Synthesis with bounded retries; deterministic extraction when the
    /// capability is absent or exhausted. Never an error.
    async fn synthesize(&self, sources: &[MemoryRecord]) -> SynthesisOutput {
        let bundle: Vec<SourceMemory> = sources
            .iter()
            .map(|m| SourceMemory {
                id: m.id.clone(),
                content: m.content.clone(),
                confidence: m.confidence,
                created_at: m.created_at.clone(),
            })
            .collect();

        if let Some(provider) = self.synthesis.as_ref() {
            let policy = RetryPolicy::new(
                self.config.synthesis_attempts,
                self.config.synthesis_base_delay_ms,
            );
            match with_retry("synthesis", policy, || provider.synthesize(&bundle)).await {
                Ok(output) if !output.key_facts.is_empty() => return sanitize(output),
                Ok(_) => {
                    tracing::warn!("synthesis returned no key facts, using fallback");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "synthesis exhausted retries, using fallback");
                }
            }
        }
        fallback_summary(sources, self.config.fallback_fact_limit)
    }
}

/// Clamp capability-reported confidences into the storable domain.
fn sanitize(mut output: SynthesisOutput) -> SynthesisOutput {
    for fact in &mut output.key_facts {
        fact.confidence = lifecycle::clamp(fact.confidence);
    }
    output
}

/// Deterministic non-LLM summary: the highest-confidence source contents
/// become the key facts, joined into a flat narrative.
pub fn fallback_summary(sources: &[MemoryRecord], fact_limit: usize) -> SynthesisOutput {
    let mut ranked: Vec<&MemoryRecord> = sources.iter().collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    let key_facts: Vec<KeyFact> = ranked
        .iter()
        .take(fact_limit.max(1))
        .map(|m| KeyFact {
            fact: m.content.clone(),
            confidence: lifecycle::clamp(m.confidence),
        })
        .collect();
    let narrative = key_facts
        .iter()
        .map(|f| f.fact.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    SynthesisOutput {
        key_facts,
        narrative,
    }
}

/// Persist a summary in one transaction: the summary memory row, its key
/// facts, its source back-references, the consolidated flags, the vector,
/// and the audit entry.
fn store_summary(
    conn: &mut Connection,
    scope: &ConsolidationScope,
    sources: &[MemoryRecord],
    synthesis: &SynthesisOutput,
    embedding: &[f32],
) -> Result<String> {
    let now = chrono::Utc::now().to_rfc3339();
    let summary_id = uuid::Uuid::now_v7().to_string();

    // Summary confidence: mean of source confidences; the synthesis is only
    // as trustworthy as what went into it.
    let confidence = lifecycle::clamp(
        sources.iter().map(|m| m.confidence).sum::<f64>() / sources.len() as f64,
    );

    let identity = scopes::scope_identity(&scope.scope_key).to_string();
    let (entity_id, topic) = match scope.kind {
        ScopeKind::Entity => (Some(identity), None),
        ScopeKind::Topic => (None, Some(identity)),
        ScopeKind::Session => (None, None),
    };
    let user_id = sources
        .first()
        .map(|m| m.user_id.clone())
        .unwrap_or_default();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO memories \
         (id, layer, content, entity_id, attribute, value, topic, session_id, user_id, \
          confidence, reinforcement_count, consolidated, created_at, updated_at) \
         VALUES (?1, 'summary', ?2, ?3, NULL, NULL, ?4, NULL, ?5, ?6, 0, 0, ?7, ?7)",
        params![
            summary_id,
            synthesis.narrative,
            entity_id,
            topic,
            user_id,
            confidence,
            now,
        ],
    )?;
    tx.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        params![summary_id, embedding_to_bytes(embedding)],
    )?;

    for fact in &synthesis.key_facts {
        tx.execute(
            "INSERT INTO summary_key_facts (id, summary_id, fact, confidence, reinforcement_count) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                uuid::Uuid::now_v7().to_string(),
                summary_id,
                fact.fact,
                lifecycle::clamp(fact.confidence),
            ],
        )?;
    }
    for source in sources {
        tx.execute(
            "INSERT INTO summary_sources (summary_id, source_id) VALUES (?1, ?2)",
            params![summary_id, source.id],
        )?;
        tx.execute(
            "UPDATE memories SET consolidated = 1, updated_at = ?1 WHERE id = ?2",
            params![now, source.id],
        )?;
    }
    write_audit_log(
        &tx,
        "consolidate",
        &summary_id,
        Some(&serde_json::json!({
            "scope": scope.scope_key,
            "sources": sources.len(),
            "key_facts": synthesis.key_facts.len(),
        })),
    )?;
    tx.commit()?;
    Ok(summary_id)
}
