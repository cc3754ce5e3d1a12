//! Per-layer candidate gathering.
//!
//! Each memory layer is queried independently by vector KNN, concurrently
//! and under a per-layer timeout. A slow layer contributes nothing rather
//! than stalling the whole retrieval. Results are deduplicated on the
//! (layer, id) pair, first occurrence kept.

use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::db::with_conn;
use crate::embedding::embedding_to_bytes;
use crate::errors::Result;
use crate::memory::store::{linked_entities, memory_from_row, MEMORY_SELECT};
use crate::memory::types::{MemoryLayer, MemoryRecord};

/// One candidate from a layer query, with its raw semantic similarity and
/// the entities it is linked to.
#[derive(Debug, Clone)]
pub struct LayerCandidate {
    pub record: MemoryRecord,
    pub similarity: f64,
    pub entity_ids: Vec<String>,
}

/// How many candidates each layer contributed, after deduplication.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LayerCounts {
    pub episodic: usize,
    pub semantic: usize,
    pub summary: usize,
}

impl LayerCounts {
    fn bump(&mut self, layer: MemoryLayer) {
        match layer {
            MemoryLayer::Episodic => self.episodic += 1,
            MemoryLayer::Semantic => self.semantic += 1,
            MemoryLayer::Summary => self.summary += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.episodic + self.semantic + self.summary
    }
}

/// KNN over the vector table, filtered down to one layer and user.
///
/// The vector table is not layer-aware, so we over-fetch and filter.
/// Superseded memories never surface as candidates.
pub fn layer_candidates(
    conn: &Connection,
    layer: MemoryLayer,
    user_id: &str,
    embedding: &[f32],
    limit: usize,
) -> Result<Vec<LayerCandidate>> {
    let embedding_bytes = embedding_to_bytes(embedding);
    let mut knn = conn.prepare(
        "SELECT id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    // Over-fetch so layer/user filtering still fills the quota.
    let neighbors: Vec<(String, f64)> = knn
        .query_map(params![embedding_bytes, (limit * 4) as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut candidates = Vec::new();
    for (id, distance) in neighbors {
        if candidates.len() >= limit {
            break;
        }
        let record: Option<MemoryRecord> = conn
            .query_row(
                &format!(
                    "{MEMORY_SELECT} WHERE id = ?1 AND layer = ?2 AND user_id = ?3 \
                     AND superseded_by IS NULL"
                ),
                params![id, layer.as_str(), user_id],
                memory_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(record) = record else { continue };
        let entity_ids = linked_entities(conn, &record.id)?;
        candidates.push(LayerCandidate {
            record,
            similarity: l2_distance_to_similarity(distance),
            entity_ids,
        });
    }
    Ok(candidates)
}

/// Convert an L2 distance between unit vectors into cosine similarity,
/// clamped to [0, 1]: for normalized embeddings, d² = 2(1 − cos).
pub fn l2_distance_to_similarity(distance: f64) -> f64 {
    (1.0 - (distance * distance) / 2.0).clamp(0.0, 1.0)
}

/// Gather candidates from all three layers concurrently.
///
/// Each layer query runs under `layer_timeout_ms`; a layer that times out
/// or fails is logged and skipped. The combined list is deduplicated on
/// (layer, id), keeping the first occurrence; the returned counts say how
/// many candidates each layer contributed after deduplication.
pub async fn gather_candidates(
    db: Arc<Mutex<Connection>>,
    config: &RetrievalConfig,
    embedding: &[f32],
    user_id: &str,
) -> (Vec<LayerCandidate>, LayerCounts) {
    let layers = [
        (MemoryLayer::Semantic, config.semantic_candidates),
        (MemoryLayer::Summary, config.summary_candidates),
        (MemoryLayer::Episodic, config.episodic_candidates),
    ];
    let timeout = Duration::from_millis(config.layer_timeout_ms);

    let mut tasks = Vec::new();
    for (layer, limit) in layers {
        let db = Arc::clone(&db);
        let embedding = embedding.to_vec();
        let user_id = user_id.to_string();
        tasks.push(async move {
            let result = tokio::time::timeout(
                timeout,
                with_conn(db, move |conn| {
                    layer_candidates(conn, layer, &user_id, &embedding, limit)
                }),
            )
            .await;
            (layer, result)
        });
    }
    let (semantic, summary, episodic) =
        tokio::join!(tasks.remove(0), tasks.remove(0), tasks.remove(0));

    let mut seen: HashSet<(MemoryLayer, String)> = HashSet::new();
    let mut combined = Vec::new();
    let mut counts = LayerCounts::default();
    for (layer, outcome) in [semantic, summary, episodic] {
        match outcome {
            Ok(Ok(candidates)) => {
                for candidate in candidates {
                    let key = (candidate.record.layer, candidate.record.id.clone());
                    if seen.insert(key) {
                        counts.bump(candidate.record.layer);
                        combined.push(candidate);
                    }
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(layer = %layer, error = %err, "layer query failed, skipping");
            }
            Err(_) => {
                tracing::warn!(layer = %layer, timeout_ms = config.layer_timeout_ms, "layer query timed out, skipping");
            }
        }
    }
    (combined, counts)
}
