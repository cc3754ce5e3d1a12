//! Confidence lifecycle — reinforcement and decay.
//!
//! Confidence lives in the closed domain [0.0, 0.95]. The 0.95 ceiling is a
//! hard epistemic limit: the system never claims certainty about a
//! remembered fact. Only two operations move confidence after creation:
//!
//! - [`reinforce`]: each independent reconfirmation adds a fraction of the
//!   remaining headroom below the ceiling, so gains diminish as confidence
//!   climbs.
//! - [`decay`]: `c * exp(-λ · age_days)`, evaluated lazily at read time with
//!   a per-layer λ. No background job walks every record.
//!
//! Persisted writes go through [`reinforce_memory`], a compare-and-set loop
//! that tolerates concurrent reinforcement from overlapping conversations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::LifecycleConfig;
use crate::errors::{EngramError, Result};
use crate::memory::store::write_audit_log;
use crate::memory::types::MemoryLayer;

/// Hard upper bound on any stored confidence.
pub const CONFIDENCE_CEILING: f64 = 0.95;

/// CAS attempts before giving up on a contended record.
const CAS_MAX_ATTEMPTS: u32 = 5;

/// Clamp a raw value into the confidence domain. NaN collapses to 0.
pub fn clamp(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, CONFIDENCE_CEILING)
}

/// One reconfirmation's worth of confidence gain, with diminishing returns.
///
/// Monotone non-decreasing, and strictly below the ceiling for any input
/// below it: `c + gain * (ceiling - c)`.
pub fn reinforce(confidence: f64, gain: f64) -> f64 {
    let c = clamp(confidence);
    clamp(c + gain.clamp(0.0, 1.0) * (CONFIDENCE_CEILING - c))
}

/// Time-based exponential decay: `c * exp(-λ · age_days)`.
///
/// Monotone non-increasing in age; zero age is the identity.
pub fn decay(confidence: f64, age_days: f64, lambda_per_day: f64) -> f64 {
    let c = clamp(confidence);
    if age_days <= 0.0 || lambda_per_day <= 0.0 {
        return c;
    }
    clamp(c * (-lambda_per_day * age_days).exp())
}

/// Per-layer decay constant from config.
pub fn lambda_for_layer(config: &LifecycleConfig, layer: MemoryLayer) -> f64 {
    match layer {
        MemoryLayer::Episodic => config.episodic_decay_lambda,
        MemoryLayer::Semantic => config.semantic_decay_lambda,
        MemoryLayer::Summary => config.summary_decay_lambda,
    }
}

/// Effective confidence of a stored record as of `now`, decayed from the
/// later of creation and last reinforcement. Pure; touches no storage.
pub fn effective_confidence(
    config: &LifecycleConfig,
    stored_confidence: f64,
    layer: MemoryLayer,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let age_days = (now - anchor).num_seconds().max(0) as f64 / 86_400.0;
    decay(stored_confidence, age_days, lambda_for_layer(config, layer))
}

/// Apply one reinforcement to a persisted memory.
///
/// Read-modify-write under compare-and-set: the UPDATE only lands if the
/// confidence is still what we read, so concurrent reinforcements from
/// overlapping conversations each take effect instead of losing updates.
pub fn reinforce_memory(conn: &Connection, memory_id: &str, gain: f64) -> Result<f64> {
    for _ in 0..CAS_MAX_ATTEMPTS {
        let current: Option<f64> = conn
            .query_row(
                "SELECT confidence FROM memories WHERE id = ?1",
                params![memory_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(EngramError::validation(
                "memory_id",
                format!("not found: {memory_id}"),
            ));
        };

        let next = reinforce(current, gain);
        let now = chrono::Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE memories SET confidence = ?1, reinforcement_count = reinforcement_count + 1, \
             last_reinforced_at = ?2, updated_at = ?2 \
             WHERE id = ?3 AND confidence = ?4",
            params![next, now, memory_id, current],
        )?;
        if updated == 1 {
            write_audit_log(
                conn,
                "reinforce",
                memory_id,
                Some(&serde_json::json!({"from": current, "to": next})),
            )?;
            return Ok(next);
        }
        // Someone else moved the confidence between read and write; retry.
    }
    Err(EngramError::Task(format!(
        "confidence update contention on {memory_id}"
    )))
}

/// Persist the decayed confidence for a record, CAS-guarded like
/// reinforcement. Used when a caller wants the lazy decay made durable
/// (e.g. before consolidation snapshots source confidences).
pub fn persist_decay(
    conn: &Connection,
    config: &LifecycleConfig,
    memory_id: &str,
) -> Result<f64> {
    for _ in 0..CAS_MAX_ATTEMPTS {
        let row: Option<(f64, String, Option<String>, String)> = conn
            .query_row(
                "SELECT confidence, layer, last_reinforced_at, created_at \
                 FROM memories WHERE id = ?1",
                params![memory_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((current, layer_str, last_reinforced, created_at)) = row else {
            return Err(EngramError::validation(
                "memory_id",
                format!("not found: {memory_id}"),
            ));
        };

        let layer: MemoryLayer = layer_str.parse().unwrap_or(MemoryLayer::Episodic);
        let anchor = parse_timestamp(last_reinforced.as_deref().unwrap_or(&created_at));
        let next = effective_confidence(config, current, layer, anchor, Utc::now());
        if (next - current).abs() < 1e-12 {
            return Ok(current);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE memories SET confidence = ?1, updated_at = ?2 WHERE id = ?3 AND confidence = ?4",
            params![next, now, memory_id, current],
        )?;
        if updated == 1 {
            write_audit_log(
                conn,
                "decay",
                memory_id,
                Some(&serde_json::json!({"from": current, "to": next})),
            )?;
            return Ok(next);
        }
    }
    Err(EngramError::Task(format!(
        "confidence update contention on {memory_id}"
    )))
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::{record_observation, Observation};

    #[test]
    fn clamp_bounds_and_nan() {
        assert_eq!(clamp(-0.5), 0.0);
        assert_eq!(clamp(0.5), 0.5);
        assert_eq!(clamp(1.2), CONFIDENCE_CEILING);
        assert_eq!(clamp(f64::NAN), 0.0);
    }

    #[test]
    fn reinforcement_has_diminishing_returns() {
        let low_gain = reinforce(0.2, 0.25) - 0.2;
        let high_gain = reinforce(0.9, 0.25) - 0.9;
        assert!(low_gain > high_gain);
        assert!(high_gain > 0.0);
    }

    #[test]
    fn reinforcement_never_exceeds_ceiling() {
        let mut c = 0.1;
        for _ in 0..1000 {
            c = reinforce(c, 0.25);
            assert!(c <= CONFIDENCE_CEILING);
        }
        assert!((c - CONFIDENCE_CEILING).abs() < 1e-6);
    }

    #[test]
    fn decay_is_monotone_in_age() {
        let fresh = decay(0.8, 1.0, 0.05);
        let stale = decay(0.8, 30.0, 0.05);
        assert!(fresh < 0.8);
        assert!(stale < fresh);
        assert!(stale >= 0.0);
    }

    #[test]
    fn zero_age_is_identity() {
        assert_eq!(decay(0.8, 0.0, 0.05), 0.8);
        assert_eq!(decay(0.8, -1.0, 0.05), 0.8);
    }

    #[test]
    fn any_sequence_stays_in_domain() {
        // Interleave reinforcement and decay arbitrarily; confidence must
        // never leave [0, 0.95].
        let mut c = 0.5;
        for i in 0..200 {
            c = if i % 3 == 0 {
                reinforce(c, 0.4)
            } else {
                decay(c, (i % 17) as f64, 0.05)
            };
            assert!((0.0..=CONFIDENCE_CEILING).contains(&c), "escaped domain: {c}");
        }
    }

    #[test]
    fn episodic_decays_faster_than_semantic() {
        let config = LifecycleConfig::default();
        let episodic = decay(0.8, 10.0, lambda_for_layer(&config, MemoryLayer::Episodic));
        let semantic = decay(0.8, 10.0, lambda_for_layer(&config, MemoryLayer::Semantic));
        assert!(episodic < semantic);
    }

    #[test]
    fn reinforce_memory_persists_and_counts() {
        let mut conn = db::open_memory_database().unwrap();
        let mut obs = Observation::new(MemoryLayer::Semantic, "Acme pays NET30", "alice");
        obs.confidence = 0.5;
        let record = record_observation(&mut conn, &obs, &vec![0.0f32; 384]).unwrap();

        let next = reinforce_memory(&conn, &record.id, 0.25).unwrap();
        assert!(next > 0.5);

        let (stored, count): (f64, u32) = conn
            .query_row(
                "SELECT confidence, reinforcement_count FROM memories WHERE id = ?1",
                params![record.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!((stored - next).abs() < 1e-9);
        assert_eq!(count, 1);
    }

    #[test]
    fn reinforce_missing_memory_fails() {
        let conn = db::open_memory_database().unwrap();
        assert!(reinforce_memory(&conn, "ghost", 0.25).is_err());
    }

    #[test]
    fn persist_decay_lowers_old_confidence() {
        let mut conn = db::open_memory_database().unwrap();
        let mut obs = Observation::new(MemoryLayer::Episodic, "old event", "alice");
        obs.confidence = 0.8;
        let record = record_observation(&mut conn, &obs, &vec![0.0f32; 384]).unwrap();

        // Backdate creation by 30 days
        let old = (Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        conn.execute(
            "UPDATE memories SET created_at = ?1 WHERE id = ?2",
            params![old, record.id],
        )
        .unwrap();

        let config = LifecycleConfig::default();
        let decayed = persist_decay(&conn, &config, &record.id).unwrap();
        assert!(decayed < 0.8);
        assert!(decayed > 0.0);
    }
}
