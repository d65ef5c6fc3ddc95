/*
newscope - summarization CLI
Loads the LLM configuration, restores persisted spend and runs one command against the provider set.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{init_db_pool, Config};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newscope::article::Article;
use newscope::llm::summarizer::Summarizer;
use newscope::storage::UsageStore;

#[derive(Parser, Debug)]
#[command(name = "newscope", about = "Multi-provider LLM summarization for Newscope")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize a JSON array of {title, source, full_text} records
    Summarize {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        /// Write augmented records here instead of stdout
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Summarize a single text
    Text { text: String },
    /// Probe every provider
    Health,
    /// Print provider stats and budget state
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = load_config(args.config).await?;

    let mut summarizer = Summarizer::new(&config.llm).context("failed to build summarizer")?;
    if let Some(db) = &config.database {
        match open_store(&db.path).await {
            Ok(store) => {
                if let Err(e) = store.restore_ledger(summarizer.ledger()).await {
                    warn!("failed to restore budget ledger: {:#}", e);
                }
                summarizer = summarizer.with_store(store);
            }
            Err(e) => warn!(db_path = %db.path, "usage ledger disabled: {:#}", e),
        }
    }

    match args.command {
        Command::Summarize { input, output } => {
            let data = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("Failed to read articles: {}", input.display()))?;
            let articles: Vec<Article> = serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse articles: {}", input.display()))?;

            let summarized = summarizer.summarize_many(articles).await;
            let json = serde_json::to_string_pretty(&summarized)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("Failed to write output: {}", path.display()))?;
                    info!(path = %path.display(), articles = summarized.len(), "summaries written");
                }
                None => println!("{}", json),
            }
        }
        Command::Text { text } => {
            let result = summarizer.summarize_text(&text).await;
            println!("{}", result.content());
            info!(
                provider = result.provider.as_deref().unwrap_or_default(),
                cost = result.cost,
                latency_ms = result.latency_ms,
                fallback = result.fallback,
                "done"
            );
        }
        Command::Health => {
            for (name, healthy) in summarizer.health_check_all().await {
                println!("{:<20} {}", name, if healthy { "ok" } else { "unreachable" });
            }
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&summarizer.stats())?);
        }
    }

    Ok(())
}

/// config.default.toml, overridden by --config or ./config.toml when present.
async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            anyhow::bail!("Config file not found: {}", p.display());
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override_file = ?override_path, providers = config.llm.providers.len(), "configuration loaded");
    Ok(config)
}

async fn open_store(path: &str) -> Result<UsageStore> {
    // Log the absolute DB path before connecting
    let db_path_abs = match tokio::fs::canonicalize(path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let pool = init_db_pool(&db_path_abs).await?;
    UsageStore::new(pool).await
}
