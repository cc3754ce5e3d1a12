//! Procedural pattern learning: signatures accumulate, patterns
//! materialize at the threshold, and hints surface on later queries.

mod helpers;

use engram::config::{LifecycleConfig, ProceduralConfig};
use engram::embedding::hashed::HashedEmbeddingProvider;
use engram::procedural::{match_patterns, observe_interaction, InteractionFeatures};
use engram::resolve::types::EntityKind;
use rusqlite::Connection;

fn billing_features() -> InteractionFeatures {
    let mut features = InteractionFeatures::new("billing_inquiry").unwrap();
    features.entity_types = vec![EntityKind::Customer, EntityKind::Invoice];
    features.topics = vec!["billing".into(), "invoices".into()];
    features.outcome_topics = vec!["payment_terms".into(), "billing".into()];
    features
}

fn observe_n(conn: &mut Connection, features: &InteractionFeatures, n: usize) {
    let embedder = HashedEmbeddingProvider::new();
    for _ in 0..n {
        observe_interaction(
            conn,
            &LifecycleConfig::default(),
            &ProceduralConfig::default(),
            &embedder,
            features,
        )
        .unwrap();
    }
}

#[test]
fn pattern_materializes_at_threshold() {
    let mut conn = helpers::test_db();
    let features = billing_features();
    let threshold = ProceduralConfig::default().pattern_threshold as usize;

    observe_n(&mut conn, &features, threshold - 1);
    let patterns: i64 = conn
        .query_row("SELECT COUNT(*) FROM procedural_patterns", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(patterns, 0);

    let embedder = HashedEmbeddingProvider::new();
    let pattern = observe_interaction(
        &mut conn,
        &LifecycleConfig::default(),
        &ProceduralConfig::default(),
        &embedder,
        &features,
    )
    .unwrap()
    .expect("threshold observation must materialize a pattern");
    assert_eq!(pattern.signature, features.signature());
    assert_eq!(pattern.observed_count as usize, threshold);
    assert!(pattern.hint.contains("payment_terms"));
}

#[test]
fn exact_signature_match_gets_full_similarity() {
    let mut conn = helpers::test_db();
    let features = billing_features();
    observe_n(
        &mut conn,
        &features,
        ProceduralConfig::default().pattern_threshold as usize,
    );

    let embedder = HashedEmbeddingProvider::new();
    let hints = match_patterns(
        &conn,
        &ProceduralConfig::default(),
        &embedder,
        &features,
    )
    .unwrap();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].similarity, 1.0);
}

#[test]
fn similar_interaction_matches_by_embedding() {
    let mut conn = helpers::test_db();
    observe_n(
        &mut conn,
        &billing_features(),
        ProceduralConfig::default().pattern_threshold as usize,
    );

    // Same intent, overlapping but not identical topics.
    let mut near = InteractionFeatures::new("billing_inquiry").unwrap();
    near.entity_types = vec![EntityKind::Customer];
    near.topics = vec!["billing".into()];

    let embedder = HashedEmbeddingProvider::new();
    let hints = match_patterns(&conn, &ProceduralConfig::default(), &embedder, &near).unwrap();
    assert_eq!(hints.len(), 1);
    assert!(hints[0].similarity >= ProceduralConfig::default().match_floor);
    assert!(hints[0].similarity < 1.0);
}

#[test]
fn unrelated_interaction_matches_nothing() {
    let mut conn = helpers::test_db();
    observe_n(
        &mut conn,
        &billing_features(),
        ProceduralConfig::default().pattern_threshold as usize,
    );

    let mut unrelated = InteractionFeatures::new("shipping_status").unwrap();
    unrelated.entity_types = vec![EntityKind::Order];
    unrelated.topics = vec!["logistics".into(), "delivery".into()];

    let embedder = HashedEmbeddingProvider::new();
    let hints =
        match_patterns(&conn, &ProceduralConfig::default(), &embedder, &unrelated).unwrap();
    assert!(hints.is_empty());
}

#[test]
fn signature_is_order_invariant() {
    let mut a = InteractionFeatures::new("billing_inquiry").unwrap();
    a.entity_types = vec![EntityKind::Invoice, EntityKind::Customer];
    a.topics = vec!["invoices".into(), "billing".into()];
    let mut b = InteractionFeatures::new("Billing_Inquiry").unwrap();
    b.entity_types = vec![EntityKind::Customer, EntityKind::Invoice];
    b.topics = vec!["billing".into(), "invoices".into()];
    assert_eq!(a.signature(), b.signature());
}
