#![allow(dead_code)]

use engram::db;
use engram::memory::store::{record_observation, Observation};
use engram::memory::types::{MemoryLayer, MemoryRecord};
use engram::resolve::store::create_entity;
use engram::resolve::types::{CanonicalEntity, EntityKind};
use rusqlite::Connection;

/// Open a fresh in-memory database with the schema applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

/// Deterministic 384-dim embedding with a spike at position `seed`.
/// Different seeds give orthogonal vectors.
pub fn test_embedding(seed: u8) -> Vec<f32> {
    let mut v = vec![0.0f32; 384];
    v[seed as usize % 384] = 1.0;
    v
}

/// An embedding close to `base`: small perturbation, re-normalized.
pub fn similar_embedding(base: &[f32]) -> Vec<f32> {
    let mut v = base.to_vec();
    for i in 0..5 {
        v[(i * 37) % 384] += 0.05;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

pub fn make_entity(conn: &mut Connection, name: &str) -> CanonicalEntity {
    create_entity(conn, name, EntityKind::Customer).unwrap()
}

/// Insert a memory with sensible defaults; override via the returned record.
pub fn insert_memory(
    conn: &mut Connection,
    layer: MemoryLayer,
    content: &str,
    entity_id: Option<&str>,
    confidence: f64,
    embedding: &[f32],
) -> MemoryRecord {
    let mut obs = Observation::new(layer, content, "alice");
    obs.entity_id = entity_id.map(str::to_string);
    obs.confidence = confidence;
    record_observation(conn, &obs, embedding).unwrap()
}

/// Insert a semantic entity/attribute/value fact.
pub fn insert_fact(
    conn: &mut Connection,
    entity_id: &str,
    attribute: &str,
    value: &str,
    confidence: f64,
    embedding: &[f32],
) -> MemoryRecord {
    let mut obs = Observation::new(
        MemoryLayer::Semantic,
        format!("{attribute}: {value}"),
        "alice",
    );
    obs.entity_id = Some(entity_id.to_string());
    obs.attribute = Some(attribute.to_string());
    obs.value = Some(value.to_string());
    obs.confidence = confidence;
    record_observation(conn, &obs, embedding).unwrap()
}
