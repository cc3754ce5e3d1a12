//! Mention and context model.
//!
//! Defines [`EntityMention`] (an immutable text span under resolution),
//! [`ConversationContext`], [`CanonicalEntity`] and its aliases, and the
//! [`ResolutionResult`] returned by the resolver. Ambiguity and unknown
//! entities are first-class variants, not errors.

use serde::{Deserialize, Serialize};

use crate::errors::{EngramError, Result};

/// Broad category for a canonical entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Order,
    Invoice,
    Person,
    Organization,
    Other,
}

impl EntityKind {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Order => "order",
            Self::Invoice => "invoice",
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "order" => Ok(Self::Order),
            "invoice" => Ok(Self::Invoice),
            "person" => Ok(Self::Person),
            "organization" => Ok(Self::Organization),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown entity kind: {s}")),
        }
    }
}

/// A text span in conversation referring to some real-world entity.
///
/// Immutable after creation; the resolver consumes it read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMention {
    /// The raw mention text, e.g. "Acme" or "they".
    pub text: String,
    /// Surrounding text window the mention appeared in.
    pub context_window: String,
    /// Type hint inferred upstream (NER tag, slot type), if any.
    pub kind_hint: Option<EntityKind>,
}

impl EntityMention {
    /// Build a validated mention. Empty or whitespace-only text is rejected
    /// up front — resolution never retries malformed input.
    pub fn new(
        text: impl Into<String>,
        context_window: impl Into<String>,
        kind_hint: Option<EntityKind>,
    ) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(EngramError::validation("mention", "must not be empty"));
        }
        Ok(Self {
            text,
            context_window: context_window.into(),
            kind_hint,
        })
    }

    /// Whether this mention looks anaphoric and should go through
    /// coreference rather than name matching.
    pub fn is_anaphoric(&self) -> bool {
        const PRONOUNS: &[&str] = &[
            "he", "she", "they", "it", "him", "her", "them", "his", "hers", "their", "its",
            "this", "that", "these", "those",
        ];
        let lowered = self.text.to_lowercase();
        PRONOUNS.contains(&lowered.as_str())
    }
}

/// Recent conversation state handed to resolution and retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    pub session_id: String,
    /// Most recent turns, oldest first.
    pub recent_turns: Vec<String>,
}

/// The single authoritative identity a mention resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub canonical_name: String,
    pub entity_type: EntityKind,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last-modification timestamp.
    pub updated_at: String,
}

/// Where an alias came from; learned aliases rank below seeded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasOrigin {
    /// Created by the system, including the entity's own canonical name.
    Seeded,
    /// Learned from a confirmed fuzzy or coreference match.
    Learned,
}

impl AliasOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seeded => "seeded",
            Self::Learned => "learned",
        }
    }
}

impl std::str::FromStr for AliasOrigin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "seeded" => Ok(Self::Seeded),
            "learned" => Ok(Self::Learned),
            _ => Err(format!("unknown alias origin: {s}")),
        }
    }
}

/// An alternate string known to refer to a canonical entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAlias {
    pub id: String,
    pub entity_id: String,
    pub alias: String,
    pub origin: AliasOrigin,
    /// Empty string means globally shared; otherwise scoped to one user.
    pub user_id: String,
    pub use_count: u32,
    pub created_at: String,
}

/// Which pipeline stage produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Exact,
    Alias,
    Fuzzy,
    Coreference,
    ExternalLookup,
}

/// One plausible match surfaced when fuzzy resolution is too close to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionCandidate {
    pub entity_id: String,
    pub name: String,
    pub similarity: f64,
}

/// Outcome of resolving one mention.
///
/// `Ambiguous` and `Unknown` are expected outcomes the caller must handle —
/// typically by asking the user to disambiguate, or by treating the mention
/// as a brand-new entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionResult {
    Resolved {
        entity: CanonicalEntity,
        confidence: f64,
        method: ResolutionMethod,
    },
    /// Multiple plausible matches within the ambiguity margin; the full
    /// candidate set is surfaced for a disambiguation prompt.
    Ambiguous { candidates: Vec<ResolutionCandidate> },
    /// No match anywhere, including the external directory.
    Unknown,
}

impl ResolutionResult {
    pub fn entity(&self) -> Option<&CanonicalEntity> {
        match self {
            Self::Resolved { entity, .. } => Some(entity),
            _ => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Self::Resolved { confidence, .. } => Some(*confidence),
            _ => None,
        }
    }
}
