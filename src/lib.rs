//! Long-term memory engine for conversational agents.
//!
//! Engram remembers facts about entities (customers, orders, invoices)
//! across sessions, reconciles them against an authoritative source, and
//! surfaces the most relevant prior knowledge for a new query. Four
//! subsystems carry the weight:
//!
//! - **Entity resolution** ([`resolve`]) — a staged pipeline (exact →
//!   alias → fuzzy → coreference → directory) mapping free-text mentions
//!   to canonical identities, with ambiguity as a first-class outcome.
//! - **Retrieval** ([`retrieval`]) — concurrent per-layer vector search
//!   over episodic, semantic, and summary memories, ranked by a
//!   deterministic five-signal score.
//! - **Conflict & lifecycle** ([`conflict`], [`lifecycle`]) — observed
//!   facts checked against memory and authority; confidence moves only by
//!   reinforcement and lazy read-time decay, bounded by a 0.95 ceiling.
//! - **Consolidation & procedural memory** ([`consolidation`],
//!   [`procedural`]) — background synthesis of fine-grained memories into
//!   durable summaries, and frequency-learned query-augmentation patterns.
//!
//! Storage is SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//! for vector search. External capabilities (coreference, synthesis,
//! directory lookup) are trait objects in [`capability`], wrapped with
//! bounded retries.

pub mod capability;
pub mod config;
pub mod conflict;
pub mod consolidation;
pub mod db;
pub mod embedding;
pub mod errors;
pub mod lifecycle;
pub mod memory;
pub mod procedural;
pub mod resolve;
pub mod retrieval;
