//! SQL DDL for all Engram tables.
//!
//! Defines the entity/alias tables, the layered `memories` table with its
//! `memories_vec` (vec0) index, summary detail tables, the consolidation
//! scope state machine, procedural pattern tables, and the audit log. All
//! DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for Engram's core tables.
const SCHEMA_SQL: &str = r#"
-- Canonical entities. Never deleted, only superseded by newer facts about them.
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    canonical_name TEXT NOT NULL COLLATE NOCASE UNIQUE,
    entity_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(canonical_name);

-- Alternate string forms for an entity. user_id '' means globally shared.
-- The UNIQUE key makes alias learning an insert-or-no-op.
CREATE TABLE IF NOT EXISTS entity_aliases (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    alias TEXT NOT NULL COLLATE NOCASE,
    origin TEXT NOT NULL CHECK(origin IN ('seeded','learned')),
    user_id TEXT NOT NULL DEFAULT '',
    use_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(entity_id, alias, user_id)
);

CREATE INDEX IF NOT EXISTS idx_aliases_alias ON entity_aliases(alias);
CREATE INDEX IF NOT EXISTS idx_aliases_entity ON entity_aliases(entity_id);

-- Layered memory storage. layer 'semantic' rows may carry a structured
-- entity/attribute/value triple used by conflict detection.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    layer TEXT NOT NULL CHECK(layer IN ('episodic','semantic','summary')),
    content TEXT NOT NULL,
    entity_id TEXT REFERENCES entities(id),
    attribute TEXT,
    value TEXT,
    topic TEXT,
    session_id TEXT,
    user_id TEXT NOT NULL DEFAULT '',
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 0.95),
    reinforcement_count INTEGER NOT NULL DEFAULT 0,
    consolidated INTEGER NOT NULL DEFAULT 0,
    superseded_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_reinforced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_layer ON memories(layer);
CREATE INDEX IF NOT EXISTS idx_memories_entity ON memories(entity_id);
CREATE INDEX IF NOT EXISTS idx_memories_topic ON memories(topic);
CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(user_id, session_id);
CREATE INDEX IF NOT EXISTS idx_memories_attr ON memories(entity_id, attribute);
CREATE INDEX IF NOT EXISTS idx_memories_superseded ON memories(superseded_by);
CREATE INDEX IF NOT EXISTS idx_memories_consolidated ON memories(consolidated);

-- Secondary entity mentions per memory, for entity-overlap scoring.
CREATE TABLE IF NOT EXISTS memory_entities (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL REFERENCES entities(id),
    PRIMARY KEY (memory_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);

-- Structured key facts extracted during consolidation, one set per summary.
CREATE TABLE IF NOT EXISTS summary_key_facts (
    id TEXT PRIMARY KEY,
    summary_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    fact TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 0.95),
    reinforcement_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_key_facts_summary ON summary_key_facts(summary_id);

-- Back-references from a summary to the memories it synthesized.
-- Immutable after creation; sources are never deleted by consolidation.
CREATE TABLE IF NOT EXISTS summary_sources (
    summary_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    source_id TEXT NOT NULL REFERENCES memories(id),
    PRIMARY KEY (summary_id, source_id)
);

-- Consolidation state machine, one row per scope. The claim is taken by a
-- conditional UPDATE on state, which is what makes it exclusive.
CREATE TABLE IF NOT EXISTS consolidation_scopes (
    scope_key TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK(kind IN ('entity','topic','session')),
    state TEXT NOT NULL DEFAULT 'pending'
        CHECK(state IN ('pending','triggered','in_progress','completed','failed')),
    source_count INTEGER NOT NULL DEFAULT 0,
    claimed_at TEXT,
    summary_id TEXT,
    last_error TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scopes_state ON consolidation_scopes(state);

-- Frequency table for interaction feature signatures.
CREATE TABLE IF NOT EXISTS procedural_signatures (
    signature TEXT PRIMARY KEY,
    intent TEXT NOT NULL,
    entity_types TEXT NOT NULL,
    topics TEXT NOT NULL,
    observed_count INTEGER NOT NULL DEFAULT 0,
    strength REAL NOT NULL DEFAULT 0.0 CHECK(strength >= 0.0 AND strength <= 0.95),
    outcome_topics TEXT NOT NULL DEFAULT '{}',
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

-- Learned "queries like this also need X" rules.
CREATE TABLE IF NOT EXISTS procedural_patterns (
    id TEXT PRIMARY KEY,
    signature TEXT NOT NULL UNIQUE REFERENCES procedural_signatures(signature),
    hint TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 0.95),
    observed_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN
        ('create','reinforce','decay','supersede','conflict','consolidate','alias','pattern')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual tables must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS patterns_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "entities",
            "entity_aliases",
            "memories",
            "memory_entities",
            "summary_key_facts",
            "summary_sources",
            "consolidation_scopes",
            "procedural_signatures",
            "procedural_patterns",
            "memory_log",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        // Virtual tables respond to vec_version()
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn confidence_ceiling_enforced_by_check() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO memories (id, layer, content, confidence, created_at, updated_at) \
             VALUES ('x', 'semantic', 'too sure', 0.99, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
