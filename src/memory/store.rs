//! Observation write path — storage, entity links, supersession, audit log.
//!
//! [`record_observation`] is the single entry point for new memories. It runs
//! inside a transaction: insert into the memories table, link mentioned
//! entities, insert the embedding vector, and write an audit entry.

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::embedding::embedding_to_bytes;
use crate::errors::{EngramError, Result};
use crate::lifecycle;
use crate::memory::types::{MemoryLayer, MemoryRecord};

/// Everything needed to record one new memory.
#[derive(Debug, Clone)]
pub struct Observation {
    pub layer: MemoryLayer,
    pub content: String,
    pub entity_id: Option<String>,
    pub attribute: Option<String>,
    pub value: Option<String>,
    pub topic: Option<String>,
    pub session_id: Option<String>,
    pub user_id: String,
    /// Initial confidence; clamped to the [0, 0.95] domain on write.
    pub confidence: f64,
    /// Secondary entities mentioned alongside the primary one.
    pub mentioned_entities: Vec<String>,
}

impl Observation {
    pub fn new(layer: MemoryLayer, content: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            layer,
            content: content.into(),
            entity_id: None,
            attribute: None,
            value: None,
            topic: None,
            session_id: None,
            user_id: user_id.into(),
            confidence: 0.5,
            mentioned_entities: Vec::new(),
        }
    }
}

/// Record a new memory with its embedding. Returns the stored record.
pub fn record_observation(
    conn: &mut Connection,
    observation: &Observation,
    embedding: &[f32],
) -> Result<MemoryRecord> {
    if observation.content.trim().is_empty() {
        return Err(EngramError::validation("content", "must not be empty"));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let id = uuid::Uuid::now_v7().to_string();
    let confidence = lifecycle::clamp(observation.confidence);

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO memories \
         (id, layer, content, entity_id, attribute, value, topic, session_id, user_id, \
          confidence, reinforcement_count, consolidated, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, ?11, ?11)",
        params![
            id,
            observation.layer.as_str(),
            observation.content,
            observation.entity_id,
            observation.attribute,
            observation.value,
            observation.topic,
            observation.session_id,
            observation.user_id,
            confidence,
            now,
        ],
    )?;

    // Entity links for overlap scoring: primary entity plus any secondaries.
    let mut linked: Vec<&str> = Vec::new();
    if let Some(primary) = observation.entity_id.as_deref() {
        linked.push(primary);
    }
    for secondary in &observation.mentioned_entities {
        linked.push(secondary.as_str());
    }
    for entity_id in linked {
        tx.execute(
            "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id) VALUES (?1, ?2)",
            params![id, entity_id],
        )?;
    }

    tx.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;

    write_audit_log(
        &tx,
        "create",
        &id,
        Some(&serde_json::json!({"layer": observation.layer.as_str()})),
    )?;
    tx.commit()?;

    fetch_memory(conn, &id)?.ok_or_else(|| {
        EngramError::Task(format!("memory {id} vanished after insert"))
    })
}

/// Fetch a single memory by ID.
pub fn fetch_memory(conn: &Connection, memory_id: &str) -> Result<Option<MemoryRecord>> {
    let record = conn
        .query_row(
            &format!("{MEMORY_SELECT} WHERE id = ?1"),
            params![memory_id],
            memory_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Entities linked to a memory (primary plus secondaries), for overlap scoring.
pub fn linked_entities(conn: &Connection, memory_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT entity_id FROM memory_entities WHERE memory_id = ?1 ORDER BY entity_id")?;
    let ids = stmt
        .query_map(params![memory_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Mark an old memory as superseded by a new one. The old record stays in
/// place — superseded memories are deprioritized, never deleted.
pub fn set_superseded(conn: &Connection, old_id: &str, new_id: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let rows = conn.execute(
        "UPDATE memories SET superseded_by = ?1, updated_at = ?2 WHERE id = ?3",
        params![new_id, now, old_id],
    )?;
    if rows == 0 {
        return Err(EngramError::validation(
            "supersedes",
            format!("target not found: {old_id}"),
        ));
    }
    write_audit_log(
        conn,
        "supersede",
        old_id,
        Some(&serde_json::json!({"superseded_by": new_id})),
    )?;
    Ok(())
}

/// The current, non-superseded semantic fact for an entity/attribute pair.
pub fn current_fact(
    conn: &Connection,
    entity_id: &str,
    attribute: &str,
) -> Result<Option<MemoryRecord>> {
    let record = conn
        .query_row(
            &format!(
                "{MEMORY_SELECT} \
                 WHERE layer = 'semantic' AND entity_id = ?1 AND attribute = ?2 \
                   AND superseded_by IS NULL \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![entity_id, attribute],
            memory_from_row,
        )
        .optional()?;
    Ok(record)
}

pub(crate) const MEMORY_SELECT: &str =
    "SELECT id, layer, content, entity_id, attribute, value, topic, session_id, user_id, \
     confidence, reinforcement_count, consolidated, superseded_by, created_at, updated_at, \
     last_reinforced_at FROM memories";

pub(crate) fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let layer_str: String = row.get(1)?;
    let consolidated: i64 = row.get(11)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        layer: layer_str.parse().unwrap_or(MemoryLayer::Episodic),
        content: row.get(2)?,
        entity_id: row.get(3)?,
        attribute: row.get(4)?,
        value: row.get(5)?,
        topic: row.get(6)?,
        session_id: row.get(7)?,
        user_id: row.get(8)?,
        confidence: row.get(9)?,
        reinforcement_count: row.get(10)?,
        consolidated: consolidated != 0,
        superseded_by: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        last_reinforced_at: row.get(15)?,
    })
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}
