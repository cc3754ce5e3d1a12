//! Core memory type definitions.
//!
//! Defines [`MemoryLayer`] (the closed set of memory stores) and
//! [`MemoryRecord`] (a full row from the `memories` table). Scoring and
//! deduplication operate on the layer tag, never on store-specific shape.

use serde::{Deserialize, Serialize};

/// The three memory layers candidates are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLayer {
    /// Raw conversational events — fast decay, lowest retrieval priority.
    Episodic,
    /// Distilled facts (entity/attribute/value) — slow decay, highest priority.
    Semantic,
    /// Consolidated syntheses of many lower-level memories.
    Summary,
}

impl MemoryLayer {
    pub const ALL: [MemoryLayer; 3] = [Self::Episodic, Self::Semantic, Self::Summary];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Summary => "summary",
        }
    }

    /// Fixed retrieval preference: explicit facts outrank summaries, which
    /// outrank raw events, all else being equal.
    pub fn priority(&self) -> f64 {
        match self {
            Self::Semantic => 1.0,
            Self::Summary => 0.7,
            Self::Episodic => 0.4,
        }
    }
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "summary" => Ok(Self::Summary),
            _ => Err(format!("unknown memory layer: {s}")),
        }
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub layer: MemoryLayer,
    /// The full text content of the memory.
    pub content: String,
    /// Primary entity this memory is about, if any.
    pub entity_id: Option<String>,
    /// Attribute name for structured semantic facts (e.g. "payment_terms").
    pub attribute: Option<String>,
    /// Attribute value for structured semantic facts (e.g. "NET30").
    pub value: Option<String>,
    pub topic: Option<String>,
    pub session_id: Option<String>,
    pub user_id: String,
    /// Stored confidence in [0.0, 0.95]; decay is applied lazily at read time.
    pub confidence: f64,
    /// Times this fact has been independently reconfirmed.
    pub reinforcement_count: u32,
    /// Whether a consolidation pass has already covered this memory.
    pub consolidated: bool,
    /// If this memory was replaced, the ID of the replacement.
    pub superseded_by: Option<String>,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last-modification timestamp.
    pub updated_at: String,
    /// ISO 8601 timestamp of the last reinforcement, if any.
    pub last_reinforced_at: Option<String>,
}
