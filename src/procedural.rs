//! Procedural memory — learned query-augmentation patterns.
//!
//! Every interaction contributes a feature signature (intent, entity
//! types, topics) to a frequency table. Once a signature recurs past the
//! threshold, a [`ProceduralPattern`] is materialized with a hint built
//! from the topics those interactions historically needed, plus a vector
//! of the signature for similarity matching. At query time patterns are
//! offered as augmentation hints, never as authoritative facts.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{LifecycleConfig, ProceduralConfig};
use crate::embedding::{embedding_to_bytes, EmbeddingProvider};
use crate::errors::{EngramError, Result};
use crate::lifecycle;
use crate::memory::store::write_audit_log;
use crate::resolve::types::EntityKind;

/// Features extracted from one interaction.
#[derive(Debug, Clone)]
pub struct InteractionFeatures {
    /// Intent classification, e.g. "billing_inquiry".
    pub intent: String,
    pub entity_types: Vec<EntityKind>,
    pub topics: Vec<String>,
    /// Topics the response actually needed, observed after the fact. These
    /// drive the hint a materialized pattern will carry.
    pub outcome_topics: Vec<String>,
}

impl InteractionFeatures {
    pub fn new(intent: impl Into<String>) -> Result<Self> {
        let intent = intent.into();
        if intent.trim().is_empty() {
            return Err(EngramError::validation("intent", "must not be empty"));
        }
        Ok(Self {
            intent,
            entity_types: Vec::new(),
            topics: Vec::new(),
            outcome_topics: Vec::new(),
        })
    }

    /// Canonical signature string. Entity types and topics are sorted and
    /// deduplicated, so feature order never changes the signature.
    pub fn signature(&self) -> String {
        let mut types: Vec<&str> = self.entity_types.iter().map(|t| t.as_str()).collect();
        types.sort_unstable();
        types.dedup();
        let mut topics: Vec<&str> = self.topics.iter().map(|t| t.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();
        format!(
            "{}|{}|{}",
            self.intent.to_lowercase(),
            types.join(","),
            topics.join(",")
        )
    }
}

/// Signature rendered as whitespace-separated tokens for embedding.
fn signature_tokens(signature: &str) -> String {
    signature.replace(['|', ','], " ")
}

/// A learned "queries like this also need X" rule.
#[derive(Debug, Clone, Serialize)]
pub struct ProceduralPattern {
    pub id: String,
    pub signature: String,
    pub hint: String,
    pub confidence: f64,
    pub observed_count: u32,
}

/// A matched pattern offered to the retriever.
#[derive(Debug, Clone, Serialize)]
pub struct AugmentationHint {
    pub hint: String,
    pub confidence: f64,
    pub signature: String,
    /// 1.0 for an exact signature match, cosine similarity otherwise.
    pub similarity: f64,
}

/// Record one interaction's features: bump the signature's frequency row
/// (reinforcement-shaped strength), fold in outcome topics, and materialize
/// or refresh the pattern once the count crosses the threshold.
pub fn observe_interaction(
    conn: &mut Connection,
    lifecycle_config: &LifecycleConfig,
    config: &ProceduralConfig,
    embedder: &dyn EmbeddingProvider,
    features: &InteractionFeatures,
) -> Result<Option<ProceduralPattern>> {
    let signature = features.signature();
    let now = chrono::Utc::now().to_rfc3339();

    let existing: Option<(u32, f64, String)> = conn
        .query_row(
            "SELECT observed_count, strength, outcome_topics \
             FROM procedural_signatures WHERE signature = ?1",
            params![signature],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (observed_count, strength, mut histogram) = match existing {
        Some((count, strength, topics_json)) => {
            let histogram: BTreeMap<String, u32> =
                serde_json::from_str(&topics_json).unwrap_or_default();
            (count + 1, strength, histogram)
        }
        None => (1, 0.0, BTreeMap::new()),
    };
    // Same diminishing-returns shape as fact reinforcement.
    let strength = lifecycle::reinforce(strength, lifecycle_config.reinforcement_gain);
    for topic in &features.outcome_topics {
        *histogram.entry(topic.clone()).or_insert(0) += 1;
    }
    let histogram_json = serde_json::to_string(&histogram)
        .map_err(|e| EngramError::Task(format!("outcome histogram: {e}")))?;

    let mut types: Vec<&str> = features.entity_types.iter().map(|t| t.as_str()).collect();
    types.sort_unstable();
    types.dedup();
    let mut topics: Vec<&str> = features.topics.iter().map(|t| t.as_str()).collect();
    topics.sort_unstable();
    topics.dedup();

    conn.execute(
        "INSERT INTO procedural_signatures \
         (signature, intent, entity_types, topics, observed_count, strength, outcome_topics, \
          first_seen, last_seen) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
         ON CONFLICT(signature) DO UPDATE SET \
             observed_count = ?5, strength = ?6, outcome_topics = ?7, last_seen = ?8",
        params![
            signature,
            features.intent.to_lowercase(),
            types.join(","),
            topics.join(","),
            observed_count,
            strength,
            histogram_json,
            now,
        ],
    )?;

    if observed_count < config.pattern_threshold {
        return Ok(None);
    }
    materialize_pattern(conn, embedder, &signature, observed_count, strength, &histogram)
        .map(Some)
}

/// Create or refresh the pattern row for a signature that crossed the
/// threshold. The signature embedding is inserted once; it is a pure
/// function of the signature string and never changes.
fn materialize_pattern(
    conn: &mut Connection,
    embedder: &dyn EmbeddingProvider,
    signature: &str,
    observed_count: u32,
    strength: f64,
    histogram: &BTreeMap<String, u32>,
) -> Result<ProceduralPattern> {
    let hint = hint_from_histogram(histogram);
    let now = chrono::Utc::now().to_rfc3339();

    let existing_id: Option<String> = conn
        .query_row(
            "SELECT id FROM procedural_patterns WHERE signature = ?1",
            params![signature],
            |row| row.get(0),
        )
        .optional()?;

    let id = match existing_id {
        Some(id) => {
            conn.execute(
                "UPDATE procedural_patterns \
                 SET hint = ?1, confidence = ?2, observed_count = ?3, updated_at = ?4 \
                 WHERE id = ?5",
                params![hint, strength, observed_count, now, id],
            )?;
            id
        }
        None => {
            let id = uuid::Uuid::now_v7().to_string();
            let embedding = embedder
                .embed(&signature_tokens(signature))
                .map_err(|e| EngramError::Task(format!("signature embedding: {e}")))?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO procedural_patterns \
                 (id, signature, hint, confidence, observed_count, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, signature, hint, strength, observed_count, now],
            )?;
            tx.execute(
                "INSERT INTO patterns_vec (id, embedding) VALUES (?1, ?2)",
                params![id, embedding_to_bytes(&embedding)],
            )?;
            write_audit_log(
                &tx,
                "pattern",
                &id,
                Some(&serde_json::json!({"signature": signature})),
            )?;
            tx.commit()?;
            tracing::info!(signature, "procedural pattern materialized");
            id
        }
    };

    Ok(ProceduralPattern {
        id,
        signature: signature.to_string(),
        hint,
        confidence: strength,
        observed_count,
    })
}

/// Hint text from the outcome-topic histogram: the most frequent topics,
/// most common first, ties broken alphabetically.
fn hint_from_histogram(histogram: &BTreeMap<String, u32>) -> String {
    let mut ranked: Vec<(&String, &u32)> = histogram.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top: Vec<&str> = ranked.iter().take(3).map(|(t, _)| t.as_str()).collect();
    if top.is_empty() {
        "queries with this shape recur frequently".to_string()
    } else {
        format!("queries like this historically also need: {}", top.join(", "))
    }
}

/// Match stored patterns against an interaction, exact signature first,
/// then embedding similarity above the floor. At most `max_hints` results,
/// strongest first.
pub fn match_patterns(
    conn: &Connection,
    config: &ProceduralConfig,
    embedder: &dyn EmbeddingProvider,
    features: &InteractionFeatures,
) -> Result<Vec<AugmentationHint>> {
    let signature = features.signature();
    let mut hints = Vec::new();

    let exact: Option<(String, f64)> = conn
        .query_row(
            "SELECT hint, confidence FROM procedural_patterns WHERE signature = ?1",
            params![signature],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((hint, confidence)) = exact {
        hints.push(AugmentationHint {
            hint,
            confidence,
            signature: signature.clone(),
            similarity: 1.0,
        });
    }

    if hints.len() < config.max_hints {
        let query_embedding = embedder
            .embed(&signature_tokens(&signature))
            .map_err(|e| EngramError::Task(format!("signature embedding: {e}")))?;
        let embedding_bytes = embedding_to_bytes(&query_embedding);
        let mut stmt = conn.prepare(
            "SELECT id, distance FROM patterns_vec \
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?;
        let neighbors: Vec<(String, f64)> = stmt
            .query_map(params![embedding_bytes, (config.max_hints * 4) as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (id, distance) in neighbors {
            if hints.len() >= config.max_hints {
                break;
            }
            let similarity = crate::retrieval::candidates::l2_distance_to_similarity(distance);
            if similarity < config.match_floor {
                continue;
            }
            let row: Option<(String, String, f64)> = conn
                .query_row(
                    "SELECT signature, hint, confidence FROM procedural_patterns WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((pattern_signature, hint, confidence)) = row else {
                continue;
            };
            if pattern_signature == signature {
                // Already covered by the exact match.
                continue;
            }
            hints.push(AugmentationHint {
                hint,
                confidence,
                signature: pattern_signature,
                similarity,
            });
        }
    }

    hints.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    hints.truncate(config.max_hints);
    Ok(hints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embedding::hashed::HashedEmbeddingProvider;

    fn features(intent: &str, topics: &[&str], outcomes: &[&str]) -> InteractionFeatures {
        let mut f = InteractionFeatures::new(intent).unwrap();
        f.entity_types = vec![EntityKind::Customer];
        f.topics = topics.iter().map(|t| t.to_string()).collect();
        f.outcome_topics = outcomes.iter().map(|t| t.to_string()).collect();
        f
    }

    fn setup() -> (Connection, HashedEmbeddingProvider, LifecycleConfig, ProceduralConfig) {
        (
            db::open_memory_database().unwrap(),
            HashedEmbeddingProvider::new(),
            LifecycleConfig::default(),
            ProceduralConfig::default(),
        )
    }

    #[test]
    fn signature_is_order_invariant() {
        let mut a = InteractionFeatures::new("billing").unwrap();
        a.entity_types = vec![EntityKind::Customer, EntityKind::Invoice];
        a.topics = vec!["terms".into(), "pricing".into()];
        let mut b = InteractionFeatures::new("Billing").unwrap();
        b.entity_types = vec![EntityKind::Invoice, EntityKind::Customer];
        b.topics = vec!["pricing".into(), "terms".into()];
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn pattern_materializes_at_threshold() {
        let (mut conn, embedder, lifecycle_config, config) = setup();
        let f = features("billing", &["terms"], &["payment_history"]);

        for i in 1..config.pattern_threshold {
            let result =
                observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &f).unwrap();
            assert!(result.is_none(), "materialized too early at {i}");
        }
        let pattern = observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &f)
            .unwrap()
            .unwrap();
        assert_eq!(pattern.observed_count, config.pattern_threshold);
        assert!(pattern.hint.contains("payment_history"));
        assert!(pattern.confidence > 0.0 && pattern.confidence <= 0.95);
    }

    #[test]
    fn strength_has_diminishing_returns() {
        let (mut conn, embedder, lifecycle_config, config) = setup();
        let f = features("billing", &["terms"], &[]);

        let mut strengths = Vec::new();
        for _ in 0..6 {
            observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &f).unwrap();
            let strength: f64 = conn
                .query_row(
                    "SELECT strength FROM procedural_signatures WHERE signature = ?1",
                    params![f.signature()],
                    |row| row.get(0),
                )
                .unwrap();
            strengths.push(strength);
        }
        for pair in strengths.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!(pair[1] <= 0.95);
        }
        let first_gain = strengths[1] - strengths[0];
        let last_gain = strengths[5] - strengths[4];
        assert!(first_gain > last_gain);
    }

    #[test]
    fn exact_match_returns_hint_with_full_similarity() {
        let (mut conn, embedder, lifecycle_config, config) = setup();
        let f = features("billing", &["terms"], &["payment_history"]);
        for _ in 0..config.pattern_threshold {
            observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &f).unwrap();
        }

        let hints = match_patterns(&conn, &config, &embedder, &f).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].similarity, 1.0);
        assert!(hints[0].hint.contains("payment_history"));
    }

    #[test]
    fn similar_signature_matches_by_embedding() {
        let (mut conn, embedder, lifecycle_config, config) = setup();
        let learned = features("billing", &["terms", "pricing", "invoices"], &["payment_history"]);
        for _ in 0..config.pattern_threshold {
            observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &learned)
                .unwrap();
        }

        // Same intent and most topics; different enough to miss exact match.
        let query = features("billing", &["terms", "pricing"], &[]);
        assert_ne!(query.signature(), learned.signature());
        let hints = match_patterns(&conn, &config, &embedder, &query).unwrap();
        assert_eq!(hints.len(), 1);
        assert!(hints[0].similarity >= config.match_floor);
        assert!(hints[0].similarity < 1.0);
    }

    #[test]
    fn unrelated_signature_matches_nothing() {
        let (mut conn, embedder, lifecycle_config, config) = setup();
        let learned = features("billing", &["terms"], &["payment_history"]);
        for _ in 0..config.pattern_threshold {
            observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &learned)
                .unwrap();
        }

        let mut query = InteractionFeatures::new("shipping_status").unwrap();
        query.entity_types = vec![EntityKind::Order];
        query.topics = vec!["logistics".into()];
        let hints = match_patterns(&conn, &config, &embedder, &query).unwrap();
        assert!(hints.is_empty());
    }

    #[test]
    fn outcome_histogram_accumulates_across_observations() {
        let (mut conn, embedder, lifecycle_config, config) = setup();
        let mut f = features("billing", &["terms"], &["payment_history"]);
        for _ in 0..config.pattern_threshold {
            observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &f).unwrap();
        }
        // Later interactions keep needing a second topic more often.
        f.outcome_topics = vec!["credit_limit".into(), "credit_limit".into()];
        let pattern = observe_interaction(&mut conn, &lifecycle_config, &config, &embedder, &f)
            .unwrap()
            .unwrap();
        assert!(pattern.hint.contains("payment_history"));
        assert!(pattern.hint.contains("credit_limit"));
    }

    #[test]
    fn empty_intent_rejected() {
        assert!(InteractionFeatures::new("  ").is_err());
    }
}
