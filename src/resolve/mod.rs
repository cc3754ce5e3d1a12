//! Hybrid entity resolution.
//!
//! [`Resolver::resolve`] runs a strict, ordered pipeline: exact canonical
//! name match, alias lookup, fuzzy trigram similarity, coreference (for
//! anaphoric mentions, via an external capability), and finally an
//! authoritative directory lookup with lazy entity creation. Later stages
//! run only when earlier ones are inconclusive; the first confident stage
//! wins. A fuzzy field that is too close to call produces an explicit
//! `Ambiguous` result rather than auto-picking the top match.

pub mod store;
pub mod types;

use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use crate::capability::{with_retry, CoreferenceProvider, DirectoryProvider, RetryPolicy};
use crate::config::ResolutionConfig;
use crate::db::with_conn;
use crate::errors::Result;
use crate::resolve::types::{
    AliasOrigin, ConversationContext, EntityKind, EntityMention, ResolutionMethod,
    ResolutionResult,
};

/// Confidence assigned to an external directory hit. Authoritative, but the
/// match still went through a name string, so it stays below exact.
const EXTERNAL_LOOKUP_CONFIDENCE: f64 = 0.9;

/// Scale applied to a coreference-derived confidence so it can never tie an
/// exact match on the literal name.
const COREFERENCE_SCALE: f64 = 0.9;

pub struct Resolver {
    db: Arc<Mutex<Connection>>,
    coreference: Option<Arc<dyn CoreferenceProvider>>,
    directory: Option<Arc<dyn DirectoryProvider>>,
    config: ResolutionConfig,
}

impl Resolver {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        coreference: Option<Arc<dyn CoreferenceProvider>>,
        directory: Option<Arc<dyn DirectoryProvider>>,
        config: ResolutionConfig,
    ) -> Self {
        Self {
            db,
            coreference,
            directory,
            config,
        }
    }

    /// Resolve one mention against the canonical entity table.
    ///
    /// `Ambiguous` and `Unknown` are normal outcomes; `Err` means storage or
    /// task failure only.
    pub async fn resolve(
        &self,
        mention: &EntityMention,
        context: &ConversationContext,
    ) -> Result<ResolutionResult> {
        // Stages 1-3 are local and synchronous.
        let text = mention.text.clone();
        let user_id = context.user_id.clone();
        let config = self.config.clone();
        let by_name = with_conn(Arc::clone(&self.db), move |conn| {
            resolve_by_name(conn, &config, &text, &user_id, true)
        })
        .await?;

        if let Some(result) = by_name {
            tracing::debug!(mention = %mention.text, "resolved locally");
            return Ok(result);
        }

        // Stage 4: coreference, only for anaphoric mentions.
        if mention.is_anaphoric() {
            if let Some(result) = self.resolve_by_coreference(mention, context).await? {
                return Ok(result);
            }
            // A bare pronoun has no business hitting the directory.
            return Ok(ResolutionResult::Unknown);
        }

        // Stage 5: authoritative directory, materializing on a hit.
        self.resolve_by_directory(mention, context).await
    }

    async fn resolve_by_coreference(
        &self,
        mention: &EntityMention,
        context: &ConversationContext,
    ) -> Result<Option<ResolutionResult>> {
        let Some(provider) = self.coreference.as_ref() else {
            return Ok(None);
        };

        let turns: Vec<String> = context
            .recent_turns
            .iter()
            .rev()
            .take(self.config.coreference_context_turns)
            .rev()
            .cloned()
            .collect();
        let policy = RetryPolicy::new(self.config.retry_attempts, self.config.retry_base_delay_ms);

        let referent = match with_retry("coreference", policy, || {
            provider.resolve_referent(&mention.text, &turns)
        })
        .await
        {
            Ok(referent) => referent,
            Err(err) => {
                // Degrade: skip the stage rather than failing resolution.
                tracing::warn!(mention = %mention.text, error = %err, "coreference unavailable, skipping stage");
                return Ok(None);
            }
        };

        let Some(referent) = referent else {
            return Ok(None);
        };

        // Re-run the local stages on the referent name. Alias learning for
        // the referent string happens inside; the pronoun itself is never
        // learned as an alias.
        let user_id = context.user_id.clone();
        let config = self.config.clone();
        let referent_clone = referent.clone();
        let inner = with_conn(Arc::clone(&self.db), move |conn| {
            resolve_by_name(conn, &config, &referent_clone, &user_id, true)
        })
        .await?;

        match inner {
            Some(ResolutionResult::Resolved {
                entity, confidence, ..
            }) => {
                tracing::debug!(mention = %mention.text, referent = %referent, "coreference resolved");
                Ok(Some(ResolutionResult::Resolved {
                    entity,
                    confidence: confidence * COREFERENCE_SCALE,
                    method: ResolutionMethod::Coreference,
                }))
            }
            Some(ambiguous @ ResolutionResult::Ambiguous { .. }) => Ok(Some(ambiguous)),
            _ => Ok(None),
        }
    }

    async fn resolve_by_directory(
        &self,
        mention: &EntityMention,
        _context: &ConversationContext,
    ) -> Result<ResolutionResult> {
        let Some(provider) = self.directory.as_ref() else {
            return Ok(ResolutionResult::Unknown);
        };

        let policy = RetryPolicy::new(self.config.retry_attempts, self.config.retry_base_delay_ms);
        let entry = match with_retry("directory", policy, || provider.lookup(&mention.text)).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(mention = %mention.text, error = %err, "directory unavailable, treating as unknown");
                return Ok(ResolutionResult::Unknown);
            }
        };

        let Some(entry) = entry else {
            // Unknown entity is a normal, expected outcome.
            return Ok(ResolutionResult::Unknown);
        };

        let kind = entry
            .entity_type
            .parse::<EntityKind>()
            .unwrap_or(mention.kind_hint.unwrap_or(EntityKind::Other));
        let name = entry.name.clone();
        let entity = with_conn(Arc::clone(&self.db), move |conn| {
            // Another request may have materialized the same entity between
            // our miss and this write; reuse it if so.
            if let Some(existing) = store::find_entity_by_name(conn, &name)? {
                return Ok(existing);
            }
            store::create_entity(conn, &name, kind)
        })
        .await?;

        tracing::info!(mention = %mention.text, entity = %entity.canonical_name, "materialized entity from directory");
        Ok(ResolutionResult::Resolved {
            entity,
            confidence: EXTERNAL_LOOKUP_CONFIDENCE,
            method: ResolutionMethod::ExternalLookup,
        })
    }
}

/// Stages 1-3: exact, alias, fuzzy. Returns `None` when inconclusive.
///
/// `learn` controls the single write this read path may perform: recording
/// the mention as a new alias after a confirmed fuzzy match.
pub fn resolve_by_name(
    conn: &mut Connection,
    config: &ResolutionConfig,
    text: &str,
    user_id: &str,
    learn: bool,
) -> Result<Option<ResolutionResult>> {
    // Stage 1: exact canonical-name match.
    if let Some(entity) = store::find_entity_by_name(conn, text)? {
        return Ok(Some(ResolutionResult::Resolved {
            entity,
            confidence: 1.0,
            method: ResolutionMethod::Exact,
        }));
    }

    // Stage 2: alias lookup, user-scoped aliases first.
    if let Some(alias) = store::find_alias(conn, text, user_id)? {
        if let Some(entity) = store::get_entity(conn, &alias.entity_id)? {
            store::record_alias_use(conn, &alias.id)?;
            return Ok(Some(ResolutionResult::Resolved {
                entity,
                confidence: alias_confidence(alias.origin, alias.use_count),
                method: ResolutionMethod::Alias,
            }));
        }
    }

    // Stage 3: fuzzy trigram match with an ambiguity margin.
    let candidates = store::fuzzy_candidates(conn, text, config.fuzzy_threshold)?;
    if candidates.is_empty() {
        return Ok(None);
    }
    if candidates.len() > 1
        && candidates[0].similarity - candidates[1].similarity <= config.ambiguity_margin
    {
        // Too close to call: surface the whole near-tied set for the
        // caller's disambiguation prompt.
        let cutoff = candidates[0].similarity - config.ambiguity_margin;
        let near: Vec<_> = candidates
            .into_iter()
            .take_while(|c| c.similarity >= cutoff)
            .collect();
        return Ok(Some(ResolutionResult::Ambiguous { candidates: near }));
    }

    let winner = &candidates[0];
    let Some(entity) = store::get_entity(conn, &winner.entity_id)? else {
        return Ok(None);
    };
    if learn {
        store::learn_alias(conn, &entity.id, text, user_id, AliasOrigin::Learned)?;
    }
    Ok(Some(ResolutionResult::Resolved {
        entity,
        confidence: fuzzy_confidence(winner.similarity),
        method: ResolutionMethod::Fuzzy,
    }))
}

/// Alias confidence: origin base plus a small use-count bonus, capped well
/// below exact-match confidence.
fn alias_confidence(origin: AliasOrigin, use_count: u32) -> f64 {
    let base = match origin {
        AliasOrigin::Seeded => 0.85,
        AliasOrigin::Learned => 0.75,
    };
    (base + 0.01 * use_count.min(10) as f64).min(0.95)
}

/// Fuzzy confidence: the similarity itself, capped below alias confidence
/// territory so method ordering stays meaningful.
fn fuzzy_confidence(similarity: f64) -> f64 {
    similarity.clamp(0.0, 0.9)
}
