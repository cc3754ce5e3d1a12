use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngramConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub resolution: ResolutionConfig,
    pub retrieval: RetrievalConfig,
    pub lifecycle: LifecycleConfig,
    pub consolidation: ConsolidationConfig,
    pub procedural: ProceduralConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub default_user: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Minimum trigram similarity for a fuzzy match to count at all.
    pub fuzzy_threshold: f64,
    /// Two fuzzy candidates within this margin of each other are too close
    /// to call — the result is flagged ambiguous instead of auto-resolved.
    pub ambiguity_margin: f64,
    /// How many recent turns of context to hand to coreference.
    pub coreference_context_turns: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub episodic_candidates: usize,
    pub semantic_candidates: usize,
    pub summary_candidates: usize,
    /// Per-layer query timeout; a layer that misses it contributes nothing.
    pub layer_timeout_ms: u64,
    pub recency_half_life_days: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Fraction of remaining headroom gained per reinforcement.
    pub reinforcement_gain: f64,
    /// Per-layer decay constants, in fraction-per-day.
    pub episodic_decay_lambda: f64,
    pub semantic_decay_lambda: f64,
    pub summary_decay_lambda: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Unconsolidated memories an entity accumulates before its scope fires.
    pub entity_threshold: usize,
    /// Distinct completed sessions before a session-window scope fires.
    pub session_threshold: usize,
    /// Distinct entities sharing a topic before the topic scope fires.
    pub topic_threshold: usize,
    pub synthesis_attempts: u32,
    pub synthesis_base_delay_ms: u64,
    /// Minutes after which a stuck in-progress claim may be retaken.
    pub claim_timeout_minutes: i64,
    /// Key facts kept by the deterministic fallback summary.
    pub fallback_fact_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProceduralConfig {
    /// Observations of a signature before a pattern is materialized.
    pub pattern_threshold: u32,
    /// Minimum cosine similarity for an embedding-based pattern match.
    pub match_floor: f64,
    pub max_hints: usize,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            resolution: ResolutionConfig::default(),
            retrieval: RetrievalConfig::default(),
            lifecycle: LifecycleConfig::default(),
            consolidation: ConsolidationConfig::default(),
            procedural: ProceduralConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_engram_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            default_user: "default".into(),
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.45,
            ambiguity_margin: 0.05,
            coreference_context_turns: 6,
            retry_attempts: 2,
            retry_base_delay_ms: 200,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            episodic_candidates: 30,
            semantic_candidates: 30,
            summary_candidates: 15,
            layer_timeout_ms: 250,
            recency_half_life_days: 30.0,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reinforcement_gain: 0.25,
            episodic_decay_lambda: 0.05,
            semantic_decay_lambda: 0.005,
            summary_decay_lambda: 0.01,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            entity_threshold: 10,
            session_threshold: 5,
            topic_threshold: 3,
            synthesis_attempts: 3,
            synthesis_base_delay_ms: 250,
            claim_timeout_minutes: 10,
            fallback_fact_limit: 5,
        }
    }
}

impl Default for ProceduralConfig {
    fn default() -> Self {
        Self {
            pattern_threshold: 3,
            match_floor: 0.6,
            max_hints: 3,
        }
    }
}

/// Returns `~/.engram/`
pub fn default_engram_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".engram")
}

/// Returns the default config file path: `~/.engram/config.toml`
pub fn default_config_path() -> PathBuf {
    default_engram_dir().join("config.toml")
}

impl EngramConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EngramConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (ENGRAM_DB, ENGRAM_USER, ENGRAM_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENGRAM_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_USER") {
            self.storage.default_user = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngramConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.storage.default_user, "default");
        assert_eq!(config.consolidation.entity_threshold, 10);
        assert!(config.resolution.ambiguity_margin < config.resolution.fuzzy_threshold);
        assert!(config.storage.db_path.ends_with("memory.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"
default_user = "alice"

[retrieval]
top_k = 12

[consolidation]
entity_threshold = 4
"#;
        let config: EngramConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.storage.default_user, "alice");
        assert_eq!(config.retrieval.top_k, 12);
        assert_eq!(config.consolidation.entity_threshold, 4);
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.layer_timeout_ms, 250);
        assert_eq!(config.procedural.pattern_threshold, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngramConfig::default();
        std::env::set_var("ENGRAM_DB", "/tmp/override.db");
        std::env::set_var("ENGRAM_USER", "env-user");
        std::env::set_var("ENGRAM_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.storage.default_user, "env-user");
        assert_eq!(config.server.log_level, "trace");

        std::env::remove_var("ENGRAM_DB");
        std::env::remove_var("ENGRAM_USER");
        std::env::remove_var("ENGRAM_LOG_LEVEL");
    }
}
