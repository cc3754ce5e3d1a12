//! Consolidation scope state machine and trigger evaluation.
//!
//! One row per scope in `consolidation_scopes`, moving through
//! pending → triggered → in_progress → completed | failed. The in_progress
//! claim is taken by a conditional UPDATE keyed on the current state, so
//! two concurrent workers can never both hold the same scope. A claim
//! older than the timeout is treated as crashed and may be retaken.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::ConsolidationConfig;
use crate::errors::Result;
use crate::memory::store::{memory_from_row, MEMORY_SELECT};
use crate::memory::types::MemoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Entity,
    Topic,
    Session,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Topic => "topic",
            Self::Session => "session",
        }
    }
}

impl std::str::FromStr for ScopeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "entity" => Ok(Self::Entity),
            "topic" => Ok(Self::Topic),
            "session" => Ok(Self::Session),
            _ => Err(format!("unknown scope kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Pending,
    Triggered,
    InProgress,
    Completed,
    Failed,
}

impl ScopeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Triggered => "triggered",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ScopeState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "triggered" => Ok(Self::Triggered),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown scope state: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidationScope {
    pub scope_key: String,
    pub kind: ScopeKind,
    pub state: ScopeState,
    pub source_count: usize,
    pub claimed_at: Option<String>,
    pub summary_id: Option<String>,
    pub last_error: Option<String>,
}

/// Scope keys are "kind:identity", e.g. "entity:<uuid>" or "topic:pricing".
pub fn scope_key(kind: ScopeKind, identity: &str) -> String {
    format!("{}:{}", kind.as_str(), identity)
}

/// The identity part of a scope key.
pub fn scope_identity(key: &str) -> &str {
    key.split_once(':').map(|(_, id)| id).unwrap_or(key)
}

pub fn get_scope(conn: &Connection, key: &str) -> Result<Option<ConsolidationScope>> {
    let scope = conn
        .query_row(
            "SELECT scope_key, kind, state, source_count, claimed_at, summary_id, last_error \
             FROM consolidation_scopes WHERE scope_key = ?1",
            params![key],
            scope_from_row,
        )
        .optional()?;
    Ok(scope)
}

fn scope_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConsolidationScope> {
    let kind_str: String = row.get(1)?;
    let state_str: String = row.get(2)?;
    let source_count: i64 = row.get(3)?;
    Ok(ConsolidationScope {
        scope_key: row.get(0)?,
        kind: kind_str.parse().unwrap_or(ScopeKind::Entity),
        state: state_str.parse().unwrap_or(ScopeState::Pending),
        source_count: source_count.max(0) as usize,
        claimed_at: row.get(4)?,
        summary_id: row.get(5)?,
        last_error: row.get(6)?,
    })
}

/// Re-evaluate all trigger policies and move qualifying scopes to
/// `triggered`. Returns the keys that are now eligible for synthesis.
///
/// A scope already in_progress is left alone; completed and failed scopes
/// re-trigger once enough new unconsolidated memories accumulate.
pub fn evaluate_triggers(conn: &Connection, config: &ConsolidationConfig) -> Result<Vec<String>> {
    let mut triggered = Vec::new();

    // Entity scopes: enough unconsolidated memories about one entity.
    let mut stmt = conn.prepare(
        "SELECT entity_id, COUNT(*) FROM memories \
         WHERE entity_id IS NOT NULL AND consolidated = 0 AND superseded_by IS NULL \
           AND layer IN ('episodic','semantic') \
         GROUP BY entity_id HAVING COUNT(*) >= ?1",
    )?;
    let entity_rows = stmt
        .query_map(params![config.entity_threshold as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (entity_id, count) in entity_rows {
        let key = scope_key(ScopeKind::Entity, &entity_id);
        if mark_triggered(conn, &key, ScopeKind::Entity, count as usize)? {
            triggered.push(key);
        }
    }

    // Session-window scopes: enough distinct completed sessions per user.
    // A session counts as completed once a newer session exists for the
    // same user.
    let mut stmt = conn.prepare(
        "SELECT user_id, COUNT(DISTINCT session_id) - 1 AS done FROM memories \
         WHERE session_id IS NOT NULL AND consolidated = 0 AND superseded_by IS NULL \
         GROUP BY user_id HAVING done >= ?1",
    )?;
    let session_rows = stmt
        .query_map(params![config.session_threshold as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (user_id, count) in session_rows {
        let key = scope_key(ScopeKind::Session, &user_id);
        if mark_triggered(conn, &key, ScopeKind::Session, count as usize)? {
            triggered.push(key);
        }
    }

    // Topic scopes: a topic recurring across distinct entities.
    let mut stmt = conn.prepare(
        "SELECT topic, COUNT(DISTINCT entity_id) FROM memories \
         WHERE topic IS NOT NULL AND entity_id IS NOT NULL \
           AND consolidated = 0 AND superseded_by IS NULL \
         GROUP BY topic HAVING COUNT(DISTINCT entity_id) >= ?1",
    )?;
    let topic_rows = stmt
        .query_map(params![config.topic_threshold as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (topic, count) in topic_rows {
        let key = scope_key(ScopeKind::Topic, &topic);
        if mark_triggered(conn, &key, ScopeKind::Topic, count as usize)? {
            triggered.push(key);
        }
    }

    Ok(triggered)
}

/// Upsert a scope into `triggered` unless a synthesis job holds it.
fn mark_triggered(
    conn: &Connection,
    key: &str,
    kind: ScopeKind,
    source_count: usize,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let rows = conn.execute(
        "INSERT INTO consolidation_scopes (scope_key, kind, state, source_count, updated_at) \
         VALUES (?1, ?2, 'triggered', ?3, ?4) \
         ON CONFLICT(scope_key) DO UPDATE SET \
             state = 'triggered', source_count = excluded.source_count, \
             updated_at = excluded.updated_at \
         WHERE consolidation_scopes.state NOT IN ('triggered','in_progress')",
        params![key, kind.as_str(), source_count as i64, now],
    )?;
    Ok(rows > 0)
}

/// Take the exclusive synthesis claim on a scope.
///
/// Succeeds only when the scope is `triggered`, or `in_progress` with a
/// claim older than `claim_timeout_minutes` (a crashed worker). The
/// conditional UPDATE is the mutual exclusion: exactly one of any number
/// of concurrent claimants sees a changed row.
pub fn claim_scope(conn: &Connection, config: &ConsolidationConfig, key: &str) -> Result<bool> {
    let now = Utc::now();
    let stale_cutoff = (now - Duration::minutes(config.claim_timeout_minutes)).to_rfc3339();
    let rows = conn.execute(
        "UPDATE consolidation_scopes \
         SET state = 'in_progress', claimed_at = ?1, updated_at = ?1, last_error = NULL \
         WHERE scope_key = ?2 \
           AND (state = 'triggered' \
                OR (state = 'in_progress' AND claimed_at < ?3))",
        params![now.to_rfc3339(), key, stale_cutoff],
    )?;
    Ok(rows == 1)
}

pub fn complete_scope(conn: &Connection, key: &str, summary_id: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE consolidation_scopes \
         SET state = 'completed', summary_id = ?1, claimed_at = NULL, updated_at = ?2 \
         WHERE scope_key = ?3 AND state = 'in_progress'",
        params![summary_id, now, key],
    )?;
    Ok(())
}

pub fn fail_scope(conn: &Connection, key: &str, error: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE consolidation_scopes \
         SET state = 'failed', last_error = ?1, claimed_at = NULL, updated_at = ?2 \
         WHERE scope_key = ?3 AND state = 'in_progress'",
        params![error, now, key],
    )?;
    Ok(())
}

/// Release a claim without producing a summary, returning the scope to
/// `pending`. Used when the source set evaporated between trigger and claim.
pub fn release_scope(conn: &Connection, key: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE consolidation_scopes \
         SET state = 'pending', claimed_at = NULL, updated_at = ?1 \
         WHERE scope_key = ?2 AND state = 'in_progress'",
        params![now, key],
    )?;
    Ok(())
}

/// The unconsolidated source memories a scope covers, oldest first.
pub fn gather_sources(conn: &Connection, scope: &ConsolidationScope) -> Result<Vec<MemoryRecord>> {
    let identity = scope_identity(&scope.scope_key);
    let sql = match scope.kind {
        ScopeKind::Entity => format!(
            "{MEMORY_SELECT} WHERE entity_id = ?1 AND consolidated = 0 \
             AND superseded_by IS NULL AND layer IN ('episodic','semantic') \
             ORDER BY created_at ASC"
        ),
        ScopeKind::Topic => format!(
            "{MEMORY_SELECT} WHERE topic = ?1 AND consolidated = 0 \
             AND superseded_by IS NULL AND layer IN ('episodic','semantic') \
             ORDER BY created_at ASC"
        ),
        ScopeKind::Session => format!(
            "{MEMORY_SELECT} WHERE user_id = ?1 AND session_id IS NOT NULL \
             AND consolidated = 0 AND superseded_by IS NULL \
             AND layer IN ('episodic','semantic') \
             AND session_id != (SELECT session_id FROM memories \
                                WHERE user_id = ?1 AND session_id IS NOT NULL \
                                ORDER BY created_at DESC LIMIT 1) \
             ORDER BY created_at ASC"
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let sources = stmt
        .query_map(params![identity], memory_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::{record_observation, Observation};
    use crate::memory::types::MemoryLayer;
    use crate::resolve::store::create_entity;
    use crate::resolve::types::EntityKind;

    fn embedding() -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[0] = 1.0;
        v
    }

    fn add_memories(conn: &mut Connection, entity_id: &str, n: usize) {
        for i in 0..n {
            let mut obs = Observation::new(MemoryLayer::Episodic, format!("event {i}"), "alice");
            obs.entity_id = Some(entity_id.to_string());
            record_observation(conn, &obs, &embedding()).unwrap();
        }
    }

    #[test]
    fn scope_enums_round_trip() {
        for kind in [ScopeKind::Entity, ScopeKind::Topic, ScopeKind::Session] {
            assert_eq!(kind.as_str().parse::<ScopeKind>().unwrap(), kind);
        }
        for state in [
            ScopeState::Pending,
            ScopeState::Triggered,
            ScopeState::InProgress,
            ScopeState::Completed,
            ScopeState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ScopeState>().unwrap(), state);
        }
    }

    #[test]
    fn entity_scope_triggers_at_threshold() {
        let mut conn = db::open_memory_database().unwrap();
        let entity = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let config = ConsolidationConfig::default();

        add_memories(&mut conn, &entity.id, config.entity_threshold - 1);
        assert!(evaluate_triggers(&conn, &config).unwrap().is_empty());

        add_memories(&mut conn, &entity.id, 1);
        let triggered = evaluate_triggers(&conn, &config).unwrap();
        assert_eq!(triggered, vec![scope_key(ScopeKind::Entity, &entity.id)]);

        let scope = get_scope(&conn, &triggered[0]).unwrap().unwrap();
        assert_eq!(scope.state, ScopeState::Triggered);
        assert_eq!(scope.source_count, config.entity_threshold);
    }

    #[test]
    fn in_progress_scope_is_not_retriggered() {
        let mut conn = db::open_memory_database().unwrap();
        let entity = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let config = ConsolidationConfig::default();
        add_memories(&mut conn, &entity.id, config.entity_threshold);

        let key = evaluate_triggers(&conn, &config).unwrap().remove(0);
        assert!(claim_scope(&conn, &config, &key).unwrap());

        // Second evaluation sees the claim and leaves the scope alone.
        assert!(evaluate_triggers(&conn, &config).unwrap().is_empty());
        let scope = get_scope(&conn, &key).unwrap().unwrap();
        assert_eq!(scope.state, ScopeState::InProgress);
    }

    #[test]
    fn claim_is_exclusive() {
        let mut conn = db::open_memory_database().unwrap();
        let entity = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let config = ConsolidationConfig::default();
        add_memories(&mut conn, &entity.id, config.entity_threshold);
        let key = evaluate_triggers(&conn, &config).unwrap().remove(0);

        assert!(claim_scope(&conn, &config, &key).unwrap());
        // Second claim attempt observes in_progress and no-ops.
        assert!(!claim_scope(&conn, &config, &key).unwrap());
    }

    #[test]
    fn stale_claim_is_reclaimable() {
        let mut conn = db::open_memory_database().unwrap();
        let entity = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let config = ConsolidationConfig::default();
        add_memories(&mut conn, &entity.id, config.entity_threshold);
        let key = evaluate_triggers(&conn, &config).unwrap().remove(0);
        assert!(claim_scope(&conn, &config, &key).unwrap());

        // Backdate the claim past the timeout.
        let stale = (Utc::now() - Duration::minutes(config.claim_timeout_minutes + 1)).to_rfc3339();
        conn.execute(
            "UPDATE consolidation_scopes SET claimed_at = ?1 WHERE scope_key = ?2",
            params![stale, key],
        )
        .unwrap();

        assert!(claim_scope(&conn, &config, &key).unwrap());
    }

    #[test]
    fn completed_scope_retriggernable_with_new_sources() {
        let mut conn = db::open_memory_database().unwrap();
        let entity = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let config = ConsolidationConfig::default();
        add_memories(&mut conn, &entity.id, config.entity_threshold);
        let key = evaluate_triggers(&conn, &config).unwrap().remove(0);
        claim_scope(&conn, &config, &key).unwrap();
        complete_scope(&conn, &key, "summary-1").unwrap();

        // Sources still unconsolidated in this test, so it re-triggers.
        let triggered = evaluate_triggers(&conn, &config).unwrap();
        assert_eq!(triggered, vec![key]);
    }

    #[test]
    fn topic_scope_requires_distinct_entities() {
        let mut conn = db::open_memory_database().unwrap();
        let config = ConsolidationConfig::default();
        let a = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let b = create_entity(&mut conn, "Globex Inc", EntityKind::Customer).unwrap();
        let c = create_entity(&mut conn, "Initech", EntityKind::Customer).unwrap();

        for entity in [&a, &b] {
            let mut obs = Observation::new(MemoryLayer::Episodic, "pricing question", "alice");
            obs.entity_id = Some(entity.id.clone());
            obs.topic = Some("pricing".into());
            record_observation(&mut conn, &obs, &embedding()).unwrap();
        }
        assert!(evaluate_triggers(&conn, &config).unwrap().is_empty());

        let mut obs = Observation::new(MemoryLayer::Episodic, "pricing question", "alice");
        obs.entity_id = Some(c.id.clone());
        obs.topic = Some("pricing".into());
        record_observation(&mut conn, &obs, &embedding()).unwrap();

        let triggered = evaluate_triggers(&conn, &config).unwrap();
        assert_eq!(triggered, vec![scope_key(ScopeKind::Topic, "pricing")]);
    }

    #[test]
    fn session_scope_excludes_latest_session() {
        let mut conn = db::open_memory_database().unwrap();
        let config = ConsolidationConfig::default();

        // session_threshold completed sessions plus one in flight.
        for s in 0..=config.session_threshold {
            let mut obs = Observation::new(MemoryLayer::Episodic, format!("turn in s{s}"), "alice");
            obs.session_id = Some(format!("s{s}"));
            record_observation(&mut conn, &obs, &embedding()).unwrap();
        }

        let triggered = evaluate_triggers(&conn, &config).unwrap();
        assert_eq!(triggered, vec![scope_key(ScopeKind::Session, "alice")]);

        let scope = get_scope(&conn, &triggered[0]).unwrap().unwrap();
        let sources = gather_sources(&conn, &scope).unwrap();
        // The newest session's memories are not gathered.
        assert_eq!(sources.len(), config.session_threshold);
        let latest = format!("s{}", config.session_threshold);
        assert!(sources
            .iter()
            .all(|m| m.session_id.as_deref() != Some(latest.as_str())));
    }

    #[test]
    fn gather_sources_skips_consolidated_and_superseded() {
        let mut conn = db::open_memory_database().unwrap();
        let entity = create_entity(&mut conn, "Acme Corp", EntityKind::Customer).unwrap();
        let config = ConsolidationConfig::default();
        add_memories(&mut conn, &entity.id, config.entity_threshold);

        // Consolidate one, supersede another.
        let ids: Vec<String> = conn
            .prepare("SELECT id FROM memories ORDER BY id LIMIT 2")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        conn.execute(
            "UPDATE memories SET consolidated = 1 WHERE id = ?1",
            params![ids[0]],
        )
        .unwrap();
        conn.execute(
            "UPDATE memories SET superseded_by = 'x' WHERE id = ?1",
            params![ids[1]],
        )
        .unwrap();

        let key = scope_key(ScopeKind::Entity, &entity.id);
        mark_triggered(&conn, &key, ScopeKind::Entity, 8).unwrap();
        let scope = get_scope(&conn, &key).unwrap().unwrap();
        let sources = gather_sources(&conn, &scope).unwrap();
        assert_eq!(sources.len(), config.entity_threshold - 2);
    }
}
