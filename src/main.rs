mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use engram::config::EngramConfig;
use engram::memory::types::MemoryLayer;

#[derive(Parser)]
#[command(name = "engram", version, about = "Long-term memory engine for conversational agents")]
struct Cli {
    /// Path to a config file (defaults to ~/.engram/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a mention to a canonical entity
    Resolve {
        mention: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Record a new memory
    Remember {
        content: String,
        #[arg(long, default_value = "episodic")]
        layer: String,
        /// Primary entity name (created if unknown)
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        attribute: Option<String>,
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 0.5)]
        confidence: f64,
        #[arg(long)]
        user: Option<String>,
    },
    /// Retrieve the most relevant memories for a query
    Recall {
        query: String,
        /// Entity names in focus, repeatable
        #[arg(long = "entity")]
        entities: Vec<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// Assert a fact and reconcile it against stored memory
    Assert {
        entity: String,
        attribute: String,
        value: String,
        /// Value reported by the authoritative source, if known
        #[arg(long)]
        authority: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// Record an interaction signature for pattern learning
    Observe {
        intent: String,
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// Topic the response turned out to need, repeatable
        #[arg(long = "needed")]
        outcomes: Vec<String>,
    },
    /// Evaluate consolidation triggers and synthesize summaries
    Consolidate,
    /// Show memory store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => EngramConfig::load_from(path)?,
        None => EngramConfig::load()?,
    };

    // Log to stderr so stdout stays clean for JSON output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Resolve { mention, user } => {
            cli::resolve(&config, &mention, user.as_deref()).await?;
        }
        Command::Remember {
            content,
            layer,
            entity,
            attribute,
            value,
            topic,
            session,
            confidence,
            user,
        } => {
            let layer: MemoryLayer = layer
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            cli::remember(
                &config,
                &content,
                layer,
                entity.as_deref(),
                attribute.as_deref(),
                value.as_deref(),
                topic.as_deref(),
                session.as_deref(),
                confidence,
                user.as_deref(),
            )?;
        }
        Command::Recall {
            query,
            entities,
            user,
        } => {
            cli::recall(&config, &query, &entities, user.as_deref()).await?;
        }
        Command::Assert {
            entity,
            attribute,
            value,
            authority,
            user,
        } => {
            cli::assert_fact(
                &config,
                &entity,
                &attribute,
                &value,
                authority.as_deref(),
                user.as_deref(),
            )?;
        }
        Command::Observe {
            intent,
            topics,
            outcomes,
        } => {
            cli::observe(&config, &intent, &topics, &outcomes)?;
        }
        Command::Consolidate => {
            cli::consolidate(&config).await?;
        }
        Command::Stats => {
            cli::stats(&config)?;
        }
    }

    Ok(())
}
