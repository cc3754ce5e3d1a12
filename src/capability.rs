//! External capability contracts.
//!
//! Coreference, synthesis, and directory lookup are network-backed in real
//! deployments and must be assumed fallible. Each is a small async trait;
//! callers wrap invocations in [`with_retry`], which applies a bounded
//! attempt count with exponential backoff and reports exhaustion as
//! [`EngramError::CapabilityExhausted`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::errors::EngramError;

/// Resolves an anaphoric mention ("they", "that company") to an entity name
/// using recent conversation context. `None` means the capability could not
/// identify a referent — a valid outcome, distinct from a transport failure.
#[async_trait]
pub trait CoreferenceProvider: Send + Sync {
    async fn resolve_referent(
        &self,
        mention: &str,
        recent_turns: &[String],
    ) -> anyhow::Result<Option<String>>;
}

/// One source memory handed to synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct SourceMemory {
    pub id: String,
    pub content: String,
    pub confidence: f64,
    pub created_at: String,
}

/// Structured output of a synthesis request.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisOutput {
    /// Key facts distilled from the sources, each with its own confidence.
    pub key_facts: Vec<KeyFact>,
    /// Free-text narrative summary.
    pub narrative: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFact {
    pub fact: String,
    pub confidence: f64,
}

/// Synthesizes many fine-grained memories into one durable summary.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn synthesize(&self, sources: &[SourceMemory]) -> anyhow::Result<SynthesisOutput>;
}

/// A record from the authoritative external directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub entity_type: String,
}

/// Last-resort lookup against an authoritative directory (e.g. the
/// transactional database's customer table). `None` means unknown entity.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    async fn lookup(&self, name: &str) -> anyhow::Result<Option<DirectoryEntry>>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Delay before the given retry (attempt is 1-based; no delay before the first).
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run a fallible async operation under a retry policy.
///
/// The operation is re-invoked on `Err` up to `max_attempts` times, sleeping
/// `base_delay * 2^(attempt-1)` between tries. The last error is wrapped in
/// [`EngramError::CapabilityExhausted`] with the capability's name.
pub async fn with_retry<T, F, Fut>(
    capability: &'static str,
    policy: RetryPolicy,
    op: F,
) -> Result<T, EngramError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(capability, attempt, error = %err, "capability attempt failed");
                last_err = Some(err);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }
    Err(EngramError::CapabilityExhausted {
        capability,
        attempts: policy.max_attempts,
        source: last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 1);
        let result = with_retry("test", policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 1);
        let result = with_retry("test", policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("transient")
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_capability_and_attempts() {
        let policy = RetryPolicy::new(2, 1);
        let err = with_retry("coreference", policy, || async {
            Err::<(), _>(anyhow::anyhow!("down"))
        })
        .await
        .unwrap_err();

        match err {
            EngramError::CapabilityExhausted {
                capability,
                attempts,
                ..
            } => {
                assert_eq!(capability, "coreference");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(4, 100);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
