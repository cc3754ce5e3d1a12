//! Conflict detection and contradiction resolution.
//!
//! [`assess_fact`] compares a newly observed entity/attribute fact against
//! the current stored fact and, when one is available, an authoritative
//! external record. Each comparison lands in one of four classes:
//! agreement, contradiction, staleness, or unverifiable. Contradictions go
//! through a fixed escalation ladder — more recent source, higher existing
//! confidence, authority value, else ambiguous-retain-both — and the
//! outcome always reports both values and their sources. Stored facts are
//! never silently overwritten: a losing fact is superseded, which keeps it
//! in place but deprioritized.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::LifecycleConfig;
use crate::errors::{EngramError, Result};
use crate::lifecycle;
use crate::memory::store::{
    current_fact, record_observation, set_superseded, write_audit_log, Observation,
};
use crate::memory::types::{MemoryLayer, MemoryRecord};

/// A fact asserted in the current conversation, pending validation.
#[derive(Debug, Clone)]
pub struct ObservedFact {
    pub entity_id: String,
    pub attribute: String,
    pub value: String,
    /// Full sentence the fact was extracted from.
    pub content: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub topic: Option<String>,
    /// Initial confidence before any reinforcement-on-create.
    pub confidence: f64,
    /// When the underlying statement was made. Usually "now", but a
    /// conversation can relay old information.
    pub observed_at: DateTime<Utc>,
}

impl ObservedFact {
    pub fn new(
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        let attribute = attribute.into();
        let value: String = value.into();
        if attribute.trim().is_empty() {
            return Err(EngramError::validation("attribute", "must not be empty"));
        }
        if value.trim().is_empty() {
            return Err(EngramError::validation("value", "must not be empty"));
        }
        let content = format!("{attribute}: {value}");
        Ok(Self {
            entity_id: entity_id.into(),
            attribute,
            value,
            content,
            user_id: user_id.into(),
            session_id: None,
            topic: None,
            confidence: 0.5,
            observed_at: Utc::now(),
        })
    }
}

/// A record from the authoritative transactional source.
#[derive(Debug, Clone)]
pub struct AuthorityRecord {
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Where a fact value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    Memory,
    Conversation,
    Authority,
}

/// One side of a comparison, kept in every report so callers can display
/// or act on the disagreement.
#[derive(Debug, Clone, Serialize)]
pub struct FactSnapshot {
    pub value: String,
    pub source: FactSource,
    pub confidence: f64,
    pub as_of: String,
}

/// Which rung of the escalation ladder decided a contradiction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    MoreRecent,
    HigherConfidence,
    Authority,
    Ambiguous,
}

/// Outcome of assessing one observed fact. All variants are domain
/// outcomes, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictOutcome {
    /// Observed value matches the stored fact; the fact was reinforced.
    Agreement { memory_id: String, confidence: f64 },
    /// Values differ; the escalation ladder picked a side (or none).
    Contradiction {
        existing: FactSnapshot,
        observed: FactSnapshot,
        decided_by: DecidedBy,
        /// The fact now considered current. None when ambiguous — both
        /// remain retrievable pending disambiguation.
        accepted_memory_id: Option<String>,
        superseded_memory_id: Option<String>,
    },
    /// The stored fact is older than the authority, which agrees with the
    /// observation. The stale fact is superseded, not deleted.
    Stale {
        superseded_memory_id: String,
        accepted_memory_id: String,
    },
    /// No stored fact and no authority to check against; recorded with a
    /// noted confidence penalty.
    Unverifiable { memory_id: String, confidence: f64 },
}

/// Confidence penalty applied to facts stored without any corroboration.
const UNVERIFIABLE_PENALTY: f64 = 0.8;

/// Assess an observed fact against memory and (optionally) authority, and
/// apply the outcome: reinforce, record, or supersede as the class demands.
pub fn assess_fact(
    conn: &mut Connection,
    config: &LifecycleConfig,
    observed: &ObservedFact,
    authority: Option<&AuthorityRecord>,
    embedding: &[f32],
) -> Result<ConflictOutcome> {
    let existing = current_fact(conn, &observed.entity_id, &observed.attribute)?;

    match existing {
        Some(existing) => assess_against_memory(conn, config, observed, &existing, authority, embedding),
        None => assess_without_memory(conn, config, observed, authority, embedding),
    }
}

fn assess_against_memory(
    conn: &mut Connection,
    config: &LifecycleConfig,
    observed: &ObservedFact,
    existing: &MemoryRecord,
    authority: Option<&AuthorityRecord>,
    embedding: &[f32],
) -> Result<ConflictOutcome> {
    if values_agree(existing.value.as_deref().unwrap_or(""), &observed.value) {
        let confidence = lifecycle::reinforce_memory(conn, &existing.id, config.reinforcement_gain)?;
        return Ok(ConflictOutcome::Agreement {
            memory_id: existing.id.clone(),
            confidence,
        });
    }

    let existing_at = lifecycle::parse_timestamp(
        existing
            .last_reinforced_at
            .as_deref()
            .unwrap_or(&existing.created_at),
    );

    // Staleness: the authority already moved on to the observed value and
    // did so after the memory was last confirmed.
    if let Some(authority) = authority {
        if values_agree(&authority.value, &observed.value) && authority.updated_at > existing_at {
            let accepted = store_accepted_fact(conn, config, observed, embedding)?;
            set_superseded(conn, &existing.id, &accepted.id)?;
            log_conflict(conn, &existing.id, "stale", existing, observed)?;
            return Ok(ConflictOutcome::Stale {
                superseded_memory_id: existing.id.clone(),
                accepted_memory_id: accepted.id,
            });
        }
    }

    // Contradiction: walk the escalation ladder.
    let existing_effective = effective_of(config, existing);
    let existing_snapshot = snapshot_memory(existing, existing_effective);
    let observed_snapshot = snapshot_observed(observed);

    let decision = decide(
        observed.observed_at,
        existing_at,
        observed.confidence,
        existing_effective,
        authority,
        &observed.value,
        existing.value.as_deref().unwrap_or(""),
    );

    log_conflict(conn, &existing.id, "contradiction", existing, observed)?;
    match decision {
        Decision::ObservedWins(decided_by) => {
            let accepted = store_accepted_fact(conn, config, observed, embedding)?;
            set_superseded(conn, &existing.id, &accepted.id)?;
            Ok(ConflictOutcome::Contradiction {
                existing: existing_snapshot,
                observed: observed_snapshot,
                decided_by,
                accepted_memory_id: Some(accepted.id),
                superseded_memory_id: Some(existing.id.clone()),
            })
        }
        Decision::ExistingWins(decided_by) => Ok(ConflictOutcome::Contradiction {
            existing: existing_snapshot,
            observed: observed_snapshot,
            decided_by,
            accepted_memory_id: Some(existing.id.clone()),
            superseded_memory_id: None,
        }),
        Decision::Ambiguous => {
            // Retain both pending disambiguation: the observed value is
            // stored as an episodic record so it stays retrievable without
            // displacing the current semantic fact.
            let mut retained = observed.clone();
            retained.content = format!(
                "disputed {}: {} (stored: {})",
                observed.attribute,
                observed.value,
                existing.value.as_deref().unwrap_or("")
            );
            let mut obs = observation_from(&retained);
            obs.layer = MemoryLayer::Episodic;
            record_observation(conn, &obs, embedding)?;
            tracing::info!(
                entity = %observed.entity_id,
                attribute = %observed.attribute,
                "ambiguous contradiction, retaining both values"
            );
            Ok(ConflictOutcome::Contradiction {
                existing: existing_snapshot,
                observed: observed_snapshot,
                decided_by: DecidedBy::Ambiguous,
                accepted_memory_id: None,
                superseded_memory_id: None,
            })
        }
    }
}

fn assess_without_memory(
    conn: &mut Connection,
    config: &LifecycleConfig,
    observed: &ObservedFact,
    authority: Option<&AuthorityRecord>,
    embedding: &[f32],
) -> Result<ConflictOutcome> {
    match authority {
        Some(authority) if values_agree(&authority.value, &observed.value) => {
            // Corroborated on arrival: store with reinforcement-on-create.
            let record = store_accepted_fact(conn, config, observed, embedding)?;
            Ok(ConflictOutcome::Agreement {
                memory_id: record.id.clone(),
                confidence: record.confidence,
            })
        }
        Some(authority) => {
            // The observation disagrees with authority and nothing is in
            // memory yet: the authority's value wins, stored as the fact.
            let mut corrected = observed.clone();
            corrected.value = authority.value.clone();
            corrected.content = format!("{}: {}", observed.attribute, authority.value);
            let record = store_accepted_fact(conn, config, &corrected, embedding)?;
            Ok(ConflictOutcome::Contradiction {
                existing: FactSnapshot {
                    value: authority.value.clone(),
                    source: FactSource::Authority,
                    confidence: lifecycle::CONFIDENCE_CEILING,
                    as_of: authority.updated_at.to_rfc3339(),
                },
                observed: snapshot_observed(observed),
                decided_by: DecidedBy::Authority,
                accepted_memory_id: Some(record.id),
                superseded_memory_id: None,
            })
        }
        None => {
            let mut penalized = observed.clone();
            penalized.confidence = lifecycle::clamp(observed.confidence * UNVERIFIABLE_PENALTY);
            let record = store_plain_fact(conn, &penalized, embedding)?;
            Ok(ConflictOutcome::Unverifiable {
                memory_id: record.id.clone(),
                confidence: record.confidence,
            })
        }
    }
}

enum Decision {
    ObservedWins(DecidedBy),
    ExistingWins(DecidedBy),
    Ambiguous,
}

/// The four-level escalation ladder. Each level must be strictly decisive
/// to stop the walk; ties fall through to the next level.
#[allow(clippy::too_many_arguments)]
fn decide(
    observed_at: DateTime<Utc>,
    existing_at: DateTime<Utc>,
    observed_confidence: f64,
    existing_confidence: f64,
    authority: Option<&AuthorityRecord>,
    observed_value: &str,
    existing_value: &str,
) -> Decision {
    // Level 1: more recent source.
    if observed_at > existing_at {
        return Decision::ObservedWins(DecidedBy::MoreRecent);
    }
    if existing_at > observed_at {
        return Decision::ExistingWins(DecidedBy::MoreRecent);
    }

    // Level 2: higher existing confidence.
    if existing_confidence > observed_confidence {
        return Decision::ExistingWins(DecidedBy::HigherConfidence);
    }
    if observed_confidence > existing_confidence {
        return Decision::ObservedWins(DecidedBy::HigherConfidence);
    }

    // Level 3: the authority's value picks its side, if it matches one.
    if let Some(authority) = authority {
        if values_agree(&authority.value, observed_value) {
            return Decision::ObservedWins(DecidedBy::Authority);
        }
        if values_agree(&authority.value, existing_value) {
            return Decision::ExistingWins(DecidedBy::Authority);
        }
    }

    // Level 4: retain both.
    Decision::Ambiguous
}

/// Value comparison: case-insensitive with surrounding whitespace ignored.
fn values_agree(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn effective_of(config: &LifecycleConfig, record: &MemoryRecord) -> f64 {
    let anchor = lifecycle::parse_timestamp(
        record
            .last_reinforced_at
            .as_deref()
            .unwrap_or(&record.created_at),
    );
    lifecycle::effective_confidence(config, record.confidence, record.layer, anchor, Utc::now())
}

fn snapshot_memory(record: &MemoryRecord, effective_confidence: f64) -> FactSnapshot {
    FactSnapshot {
        value: record.value.clone().unwrap_or_default(),
        source: FactSource::Memory,
        confidence: effective_confidence,
        as_of: record.created_at.clone(),
    }
}

fn snapshot_observed(observed: &ObservedFact) -> FactSnapshot {
    FactSnapshot {
        value: observed.value.clone(),
        source: FactSource::Conversation,
        confidence: observed.confidence,
        as_of: observed.observed_at.to_rfc3339(),
    }
}

/// Store an accepted value as a fresh semantic fact with
/// reinforcement-on-create confidence: the winning value starts from its
/// observed confidence plus one reinforcement, never inheriting the loser's.
fn store_accepted_fact(
    conn: &mut Connection,
    config: &LifecycleConfig,
    observed: &ObservedFact,
    embedding: &[f32],
) -> Result<MemoryRecord> {
    let mut fact = observation_from(observed);
    fact.confidence = lifecycle::reinforce(observed.confidence, config.reinforcement_gain);
    record_observation(conn, &fact, embedding)
}

fn store_plain_fact(
    conn: &mut Connection,
    observed: &ObservedFact,
    embedding: &[f32],
) -> Result<MemoryRecord> {
    record_observation(conn, &observation_from(observed), embedding)
}

fn observation_from(observed: &ObservedFact) -> Observation {
    let mut obs = Observation::new(
        MemoryLayer::Semantic,
        observed.content.clone(),
        observed.user_id.clone(),
    );
    obs.entity_id = Some(observed.entity_id.clone());
    obs.attribute = Some(observed.attribute.clone());
    obs.value = Some(observed.value.clone());
    obs.topic = observed.topic.clone();
    obs.session_id = observed.session_id.clone();
    obs.confidence = observed.confidence;
    obs
}

fn log_conflict(
    conn: &Connection,
    memory_id: &str,
    class: &str,
    existing: &MemoryRecord,
    observed: &ObservedFact,
) -> Result<()> {
    write_audit_log(
        conn,
        "conflict",
        memory_id,
        Some(&serde_json::json!({
            "class": class,
            "attribute": observed.attribute,
            "existing_value": existing.value,
            "observed_value": observed.value,
        })),
    )
}
