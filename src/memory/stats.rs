use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::errors::Result;

/// Snapshot of the memory store, surfaced through the CLI.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_memories: u64,
    pub active_memories: u64,
    pub superseded_memories: u64,
    pub by_layer: HashMap<String, u64>,
    pub entities: u64,
    pub aliases: u64,
    pub patterns: u64,
    pub scopes_by_state: HashMap<String, u64>,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute memory store statistics.
///
/// `db_path` is used for file size; pass None for in-memory databases.
pub fn memory_stats(conn: &Connection, db_path: Option<&Path>) -> Result<StatsResponse> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
    let active: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE superseded_by IS NULL",
        [],
        |row| row.get(0),
    )?;

    let mut by_layer: HashMap<String, u64> = HashMap::new();
    for layer in ["episodic", "semantic", "summary"] {
        by_layer.insert(layer.to_string(), 0);
    }
    let mut stmt = conn.prepare("SELECT layer, COUNT(*) FROM memories GROUP BY layer")?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (layer, count) in rows {
        by_layer.insert(layer, count as u64);
    }

    let entities: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
    let aliases: i64 =
        conn.query_row("SELECT COUNT(*) FROM entity_aliases", [], |row| row.get(0))?;
    let patterns: i64 =
        conn.query_row("SELECT COUNT(*) FROM procedural_patterns", [], |row| row.get(0))?;

    let mut scopes_by_state: HashMap<String, u64> = HashMap::new();
    let mut stmt =
        conn.prepare("SELECT state, COUNT(*) FROM consolidation_scopes GROUP BY state")?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (state, count) in rows {
        scopes_by_state.insert(state, count as u64);
    }

    let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_memories: total as u64,
        active_memories: active as u64,
        superseded_memories: (total - active) as u64,
        by_layer,
        entities: entities as u64,
        aliases: aliases as u64,
        patterns: patterns as u64,
        scopes_by_state,
        db_size_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

/// Recent audit-log entries, newest first.
pub fn recent_operations(conn: &Connection, limit: usize) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT operation, memory_id, created_at FROM memory_log \
         ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::{record_observation, set_superseded, Observation};
    use crate::memory::types::MemoryLayer;

    fn embedding() -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[0] = 1.0;
        v
    }

    #[test]
    fn empty_store_stats() {
        let conn = db::open_memory_database().unwrap();
        let stats = memory_stats(&conn, None).unwrap();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.by_layer["semantic"], 0);
        assert!(stats.oldest_memory.is_none());
    }

    #[test]
    fn counts_reflect_store_contents() {
        let mut conn = db::open_memory_database().unwrap();
        let a = record_observation(
            &mut conn,
            &Observation::new(MemoryLayer::Semantic, "fact one", "alice"),
            &embedding(),
        )
        .unwrap();
        let b = record_observation(
            &mut conn,
            &Observation::new(MemoryLayer::Semantic, "fact two", "alice"),
            &embedding(),
        )
        .unwrap();
        record_observation(
            &mut conn,
            &Observation::new(MemoryLayer::Episodic, "event", "alice"),
            &embedding(),
        )
        .unwrap();
        set_superseded(&conn, &a.id, &b.id).unwrap();

        let stats = memory_stats(&conn, None).unwrap();
        assert_eq!(stats.total_memories, 3);
        assert_eq!(stats.active_memories, 2);
        assert_eq!(stats.superseded_memories, 1);
        assert_eq!(stats.by_layer["semantic"], 2);
        assert_eq!(stats.by_layer["episodic"], 1);
        assert!(stats.oldest_memory.is_some());
    }

    #[test]
    fn recent_operations_newest_first() {
        let mut conn = db::open_memory_database().unwrap();
        record_observation(
            &mut conn,
            &Observation::new(MemoryLayer::Episodic, "event", "alice"),
            &embedding(),
        )
        .unwrap();

        let ops = recent_operations(&conn, 10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, "create");
    }
}
