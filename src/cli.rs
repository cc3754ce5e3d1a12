//! CLI command implementations.
//!
//! Each command opens the configured database, runs one engine operation,
//! and prints the outcome as pretty JSON on stdout. Logging goes to stderr.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use engram::config::EngramConfig;
use engram::conflict::{assess_fact, AuthorityRecord, ObservedFact};
use engram::consolidation::{Consolidator, ScopeOutcome};
use engram::db;
use engram::embedding::{hashed::HashedEmbeddingProvider, EmbeddingProvider};
use engram::memory::stats::memory_stats;
use engram::memory::store::{record_observation, Observation};
use engram::memory::types::MemoryLayer;
use engram::procedural::{match_patterns, observe_interaction, InteractionFeatures};
use engram::resolve::store::create_entity;
use engram::resolve::types::{ConversationContext, EntityKind, EntityMention, ResolutionResult};
use engram::resolve::Resolver;
use engram::retrieval::{QueryContext, Retriever};

fn open(config: &EngramConfig) -> Result<Connection> {
    db::open_database(config.resolved_db_path())
}

fn shared(config: &EngramConfig) -> Result<Arc<Mutex<Connection>>> {
    Ok(Arc::new(Mutex::new(open(config)?)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolve a mention against the canonical entity table.
pub async fn resolve(config: &EngramConfig, mention: &str, user: Option<&str>) -> Result<()> {
    let db = shared(config)?;
    let mention = EntityMention::new(mention, "", None).context("invalid mention")?;
    let context = ConversationContext {
        user_id: user.unwrap_or(&config.storage.default_user).to_string(),
        session_id: String::new(),
        recent_turns: Vec::new(),
    };
    // No coreference or directory capability is wired into the CLI; the
    // local stages are the whole pipeline here.
    let resolver = Resolver::new(db, None, None, config.resolution.clone());
    let result = resolver.resolve(&mention, &context).await?;
    print_json(&result)
}

/// Record a new memory, resolving (or creating) its primary entity.
#[allow(clippy::too_many_arguments)]
pub fn remember(
    config: &EngramConfig,
    content: &str,
    layer: MemoryLayer,
    entity: Option<&str>,
    attribute: Option<&str>,
    value: Option<&str>,
    topic: Option<&str>,
    session: Option<&str>,
    confidence: f64,
    user: Option<&str>,
) -> Result<()> {
    let mut conn = open(config)?;
    let user_id = user.unwrap_or(&config.storage.default_user).to_string();

    let entity_id = match entity {
        Some(name) => Some(resolve_or_create_entity(&mut conn, config, name, &user_id)?),
        None => None,
    };

    let embedder = HashedEmbeddingProvider::new();
    let embedding = embedder.embed(content)?;

    let mut observation = Observation::new(layer, content, user_id);
    observation.entity_id = entity_id;
    observation.attribute = attribute.map(str::to_string);
    observation.value = value.map(str::to_string);
    observation.topic = topic.map(str::to_string);
    observation.session_id = session.map(str::to_string);
    observation.confidence = confidence;

    let record = record_observation(&mut conn, &observation, &embedding)?;
    print_json(&record)
}

/// Recall the top-k memories for a query.
pub async fn recall(
    config: &EngramConfig,
    query: &str,
    entities: &[String],
    user: Option<&str>,
) -> Result<()> {
    let db = shared(config)?;
    let user_id = user.unwrap_or(&config.storage.default_user).to_string();
    let embedder = HashedEmbeddingProvider::new();

    // Resolve entity mentions into focus entity ids; unresolved mentions
    // simply contribute no entity signal.
    let mut focus_entities = Vec::new();
    {
        let resolver = Resolver::new(Arc::clone(&db), None, None, config.resolution.clone());
        let context = ConversationContext {
            user_id: user_id.clone(),
            session_id: String::new(),
            recent_turns: Vec::new(),
        };
        for name in entities {
            let mention = EntityMention::new(name.as_str(), "", None)?;
            if let ResolutionResult::Resolved { entity, .. } =
                resolver.resolve(&mention, &context).await?
            {
                focus_entities.push(entity.id);
            } else {
                tracing::warn!(mention = %name, "focus entity did not resolve");
            }
        }
    }

    let retriever = Retriever::new(
        Arc::clone(&db),
        config.retrieval.clone(),
        config.lifecycle.clone(),
    );
    let query_embedding = embedder.embed(query)?;
    let mut result = retriever
        .retrieve(
            &query_embedding,
            &QueryContext {
                user_id,
                focus_entities,
            },
        )
        .await?;

    // Procedural hints ride along in the retrieval metadata.
    let features = {
        let mut f = InteractionFeatures::new("recall")?;
        f.topics = query.split_whitespace().take(4).map(str::to_string).collect();
        f
    };
    result.hints = {
        let conn = db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        match_patterns(&conn, &config.procedural, &embedder, &features)?
    };

    print_json(&result)
}

/// Check an asserted fact against memory (and optionally an authority
/// value), applying the outcome.
pub fn assert_fact(
    config: &EngramConfig,
    entity: &str,
    attribute: &str,
    value: &str,
    authority_value: Option<&str>,
    user: Option<&str>,
) -> Result<()> {
    let mut conn = open(config)?;
    let user_id = user.unwrap_or(&config.storage.default_user).to_string();
    let entity_id = resolve_or_create_entity(&mut conn, config, entity, &user_id)?;

    let observed = ObservedFact::new(entity_id, attribute, value, user_id)?;
    let authority = authority_value.map(|v| AuthorityRecord {
        value: v.to_string(),
        updated_at: chrono::Utc::now(),
    });

    let embedder = HashedEmbeddingProvider::new();
    let embedding = embedder.embed(&observed.content)?;
    let outcome = assess_fact(
        &mut conn,
        &config.lifecycle,
        &observed,
        authority.as_ref(),
        &embedding,
    )?;
    print_json(&outcome)
}

/// Record an interaction's feature signature for pattern learning.
pub fn observe(
    config: &EngramConfig,
    intent: &str,
    topics: &[String],
    outcomes: &[String],
) -> Result<()> {
    let mut conn = open(config)?;
    let embedder = HashedEmbeddingProvider::new();

    let mut features = InteractionFeatures::new(intent)?;
    features.topics = topics.to_vec();
    features.outcome_topics = outcomes.to_vec();

    let pattern = observe_interaction(
        &mut conn,
        &config.lifecycle,
        &config.procedural,
        &embedder,
        &features,
    )?;
    match pattern {
        Some(pattern) => print_json(&pattern),
        None => {
            println!("observed (no pattern materialized yet)");
            Ok(())
        }
    }
}

/// Evaluate consolidation triggers and run every scope that fires.
pub async fn consolidate(config: &EngramConfig) -> Result<()> {
    let db = shared(config)?;
    let consolidator = Consolidator::new(
        db,
        None, // no synthesis capability wired into the CLI; fallback applies
        Arc::new(HashedEmbeddingProvider::new()),
        config.consolidation.clone(),
        config.lifecycle.clone(),
    );
    let outcomes = consolidator.run_pending().await?;
    if outcomes.is_empty() {
        println!("no scopes triggered");
        return Ok(());
    }
    for (key, outcome) in outcomes {
        match outcome {
            ScopeOutcome::Completed { summary_id } => {
                println!("{key}: completed (summary {summary_id})")
            }
            ScopeOutcome::Failed { error } => println!("{key}: failed ({error})"),
            ScopeOutcome::Pending => println!("{key}: pending"),
        }
    }
    Ok(())
}

/// Print store statistics.
pub fn stats(config: &EngramConfig) -> Result<()> {
    let conn = open(config)?;
    let stats = memory_stats(&conn, Some(&config.resolved_db_path()))?;
    print_json(&stats)
}

/// Resolve an entity name through the local stages, creating it when
/// unknown. Ambiguity is an error at the CLI: the caller must give an
/// exact name.
fn resolve_or_create_entity(
    conn: &mut Connection,
    config: &EngramConfig,
    name: &str,
    user_id: &str,
) -> Result<String> {
    let resolved = engram::resolve::resolve_by_name(
        conn,
        &config.resolution,
        name,
        user_id,
        false,
    )?;
    match resolved {
        Some(ResolutionResult::Resolved { entity, .. }) => Ok(entity.id),
        Some(ResolutionResult::Ambiguous { candidates }) => {
            let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
            anyhow::bail!("ambiguous entity '{name}': could be any of {names:?}")
        }
        _ => {
            let entity = create_entity(conn, name, EntityKind::Other)?;
            tracing::info!(name, "created new entity");
            Ok(entity.id)
        }
    }
}
