//! Entity and alias persistence.
//!
//! All operations return domain value types, never raw rows. Alias learning
//! is an insert-or-no-op on the (entity, alias, user) key, which is what
//! makes re-resolving the same mention idempotent.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::memory::store::write_audit_log;
use crate::resolve::types::{AliasOrigin, CanonicalEntity, EntityAlias, EntityKind, ResolutionCandidate};

/// Create a canonical entity. Seeds the entity's own name as its first
/// alias, so every entity always has at least one.
pub fn create_entity(
    conn: &mut Connection,
    name: &str,
    entity_type: EntityKind,
) -> Result<CanonicalEntity> {
    let now = chrono::Utc::now().to_rfc3339();
    let id = uuid::Uuid::now_v7().to_string();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO entities (id, canonical_name, entity_type, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, name, entity_type.as_str(), now],
    )?;
    tx.execute(
        "INSERT INTO entity_aliases (id, entity_id, alias, origin, user_id, use_count, created_at) \
         VALUES (?1, ?2, ?3, 'seeded', '', 0, ?4)",
        params![uuid::Uuid::now_v7().to_string(), id, name, now],
    )?;
    write_audit_log(
        &tx,
        "create",
        &id,
        Some(&serde_json::json!({"kind": "entity", "name": name})),
    )?;
    tx.commit()?;

    Ok(CanonicalEntity {
        id,
        canonical_name: name.to_string(),
        entity_type,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Case-insensitive lookup by canonical name.
pub fn find_entity_by_name(conn: &Connection, name: &str) -> Result<Option<CanonicalEntity>> {
    let entity = conn
        .query_row(
            "SELECT id, canonical_name, entity_type, created_at, updated_at \
             FROM entities WHERE canonical_name = ?1 COLLATE NOCASE",
            params![name],
            entity_from_row,
        )
        .optional()?;
    Ok(entity)
}

pub fn get_entity(conn: &Connection, entity_id: &str) -> Result<Option<CanonicalEntity>> {
    let entity = conn
        .query_row(
            "SELECT id, canonical_name, entity_type, created_at, updated_at \
             FROM entities WHERE id = ?1",
            params![entity_id],
            entity_from_row,
        )
        .optional()?;
    Ok(entity)
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalEntity> {
    let type_str: String = row.get(2)?;
    Ok(CanonicalEntity {
        id: row.get(0)?,
        canonical_name: row.get(1)?,
        entity_type: type_str.parse().unwrap_or(EntityKind::Other),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Find the best alias match for a mention, preferring aliases scoped to the
/// current user over globally shared ones, then higher use counts.
pub fn find_alias(conn: &Connection, text: &str, user_id: &str) -> Result<Option<EntityAlias>> {
    let alias = conn
        .query_row(
            "SELECT id, entity_id, alias, origin, user_id, use_count, created_at \
             FROM entity_aliases \
             WHERE alias = ?1 COLLATE NOCASE AND (user_id = ?2 OR user_id = '') \
             ORDER BY (user_id = ?2) DESC, use_count DESC, created_at ASC \
             LIMIT 1",
            params![text, user_id],
            alias_from_row,
        )
        .optional()?;
    Ok(alias)
}

fn alias_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityAlias> {
    let origin_str: String = row.get(3)?;
    Ok(EntityAlias {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        alias: row.get(2)?,
        origin: origin_str.parse().unwrap_or(AliasOrigin::Learned),
        user_id: row.get(4)?,
        use_count: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Bump an alias's use count after a successful hit.
pub fn record_alias_use(conn: &Connection, alias_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE entity_aliases SET use_count = use_count + 1 WHERE id = ?1",
        params![alias_id],
    )?;
    Ok(())
}

/// Learn a new alias for an entity. Idempotent: inserting the same
/// (entity, alias, user) again is a no-op, not an error.
///
/// Returns `true` when a new alias row was actually created.
pub fn learn_alias(
    conn: &Connection,
    entity_id: &str,
    alias: &str,
    user_id: &str,
    origin: AliasOrigin,
) -> Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO entity_aliases \
         (id, entity_id, alias, origin, user_id, use_count, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            uuid::Uuid::now_v7().to_string(),
            entity_id,
            alias,
            origin.as_str(),
            user_id,
            now
        ],
    )?;
    if inserted > 0 {
        write_audit_log(
            conn,
            "alias",
            entity_id,
            Some(&serde_json::json!({"alias": alias, "origin": origin.as_str()})),
        )?;
    }
    Ok(inserted > 0)
}

/// Names and aliases scored by trigram similarity against a mention.
///
/// Scans canonical names and aliases, keeps the best similarity per entity,
/// and returns candidates at or above `threshold` sorted by similarity
/// descending (name ascending as the deterministic tie-break).
pub fn fuzzy_candidates(
    conn: &Connection,
    text: &str,
    threshold: f64,
) -> Result<Vec<ResolutionCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.canonical_name, a.alias \
         FROM entities e JOIN entity_aliases a ON a.entity_id = e.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut best: std::collections::HashMap<String, ResolutionCandidate> =
        std::collections::HashMap::new();
    for (entity_id, canonical_name, alias) in rows {
        let similarity = trigram_similarity(text, &alias);
        if similarity < threshold {
            continue;
        }
        let entry = best
            .entry(entity_id.clone())
            .or_insert_with(|| ResolutionCandidate {
                entity_id,
                name: canonical_name.clone(),
                similarity,
            });
        if similarity > entry.similarity {
            entry.similarity = similarity;
        }
    }

    let mut candidates: Vec<ResolutionCandidate> = best.into_values().collect();
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(candidates)
}

/// Dice coefficient over padded character trigrams, case-folded.
///
/// Returns a value in [0, 1]; 1.0 only for equal strings (after folding).
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    (2.0 * shared as f64) / (ta.len() + tb.len()) as f64
}

fn trigrams(s: &str) -> std::collections::HashSet<String> {
    let folded = s.to_lowercase();
    let padded: Vec<char> = format!("  {folded} ").chars().collect();
    padded
        .windows(3)
        .map(|w| w.iter().collect::<String>())
        .collect()
}
