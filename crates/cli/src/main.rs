use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use minirag_core::{BpeEstimator, Fingerprint, TextSplitter, TokenizerKind};
use minirag_rag::{
    open_session, AppConfig, ChunkEmbedBuilder, DocumentCache, EmbeddingClient, LlmProvider,
    QuotaLimits, SqliteDocumentStore, StoreSummary, UsageReport,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG: &str = "minirag.toml";

#[derive(Parser, Debug)]
#[command(name = "minirag", version = VERSION, about = "Cached document question answering")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long = "index-dir", global = true)]
    index_dir: Option<PathBuf>,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the content fingerprint of a file.
    Fingerprint { input: PathBuf },
    /// Process a document into the cache (no-op when already cached).
    Ingest { inputs: Vec<PathBuf> },
    /// Load a document and answer one or more questions against it.
    Ask {
        input: PathBuf,
        #[arg(short, long = "question", required = true)]
        questions: Vec<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Count tokens with a BPE tokenizer (cl100k, o200k) instead of words.
        #[arg(long)]
        tokenizer: Option<String>,
    },
    /// Show the configured quota limits. Usage is counted per running
    /// service, so a one-shot command has none to report.
    Quota,
    /// List cached documents and index artifacts.
    Inspect,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("MINIRAG_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = AppConfig::load_from(&config_path)?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(dir) = &cli.index_dir {
        config.index_dir = dir.clone();
    }

    match cli.command {
        Commands::Fingerprint { input } => {
            let fingerprint = Fingerprint::of_path(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            if cli.json {
                println!("{}", json!({ "input": input, "fingerprint": fingerprint }));
            } else {
                println!("{fingerprint}  {}", input.display());
            }
        }
        Commands::Ingest { inputs } => {
            if inputs.is_empty() {
                return Err(anyhow!("no input files supplied"));
            }
            let cache = DocumentCache::new(open_store(&config)?);
            let builder = ChunkEmbedBuilder::new(
                TextSplitter::with_sizes(config.chunk_size, config.chunk_overlap),
                EmbeddingClient::from_env()?,
            );
            for input in inputs {
                let raw = read_input(&input)?;
                let processed = cache.process(&raw, &builder)?;
                if let Some(warning) = &processed.cache_warning {
                    eprintln!("warning: {warning}");
                }
                if cli.json {
                    println!(
                        "{}",
                        json!({
                            "input": input,
                            "fingerprint": processed.fingerprint,
                            "chunks": processed.chunks.len(),
                            "cached": processed.was_cached,
                        })
                    );
                } else {
                    println!(
                        "{} {} ({} chunks, {})",
                        processed.fingerprint,
                        input.display(),
                        processed.chunks.len(),
                        if processed.was_cached { "cached" } else { "processed" }
                    );
                }
            }
        }
        Commands::Ask {
            input,
            questions,
            provider,
            model,
            tokenizer,
        } => {
            if let Some(name) = provider {
                config.provider = LlmProvider::from_name(&name)
                    .ok_or_else(|| anyhow!("unknown provider {name}"))?;
                config.model = config.provider.default_model().to_string();
            }
            if let Some(model) = model {
                config.model = model;
            }
            let mut session = open_session(&config)?;
            if let Some(name) = tokenizer {
                let kind = TokenizerKind::from_name(&name)
                    .ok_or_else(|| anyhow!("unknown tokenizer {name}"))?;
                session = session.with_estimator(Box::new(BpeEstimator::new(&kind)?));
            }
            let upload = session.upload(&read_input(&input)?)?;
            info!(fingerprint = %upload.fingerprint, cached = upload.was_cached, "document loaded");
            if let Some(warning) = &upload.cache_warning {
                eprintln!("warning: {warning}");
            }
            for question in questions {
                let outcome = session.ask(&question)?;
                if cli.json {
                    println!(
                        "{}",
                        json!({
                            "question": question,
                            "answer": outcome.answer,
                            "estimated_tokens": outcome.estimated_tokens,
                            "usage": outcome.usage,
                        })
                    );
                } else {
                    println!("Q: {question}\nA: {}\n", outcome.answer);
                    print_usage(&outcome.usage);
                    println!();
                }
            }
        }
        Commands::Quota => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config.quota)?);
            } else {
                print_quota(&config.quota);
            }
        }
        Commands::Inspect => {
            let summary = open_store(&config)?.inspect()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_inspection(&summary);
            }
        }
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<SqliteDocumentStore> {
    SqliteDocumentStore::open(&config.db_path, &config.index_dir)
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_usage(report: &UsageReport) {
    println!("=== API usage ===");
    println!("{report}");
}

fn print_quota(limits: &QuotaLimits) {
    println!("=== Quota limits ===");
    println!("Requests per minute: {}", limits.requests_per_minute);
    println!("Tokens per minute: {}", limits.tokens_per_minute);
    println!("Requests per day: {}", limits.requests_per_day);
    println!("Tokens per day: {}", limits.tokens_per_day);
}

fn print_inspection(summary: &StoreSummary) {
    println!("Total documents: {}", summary.documents.len());
    for (idx, doc) in summary.documents.iter().enumerate() {
        println!("\n--- Document {} ---", idx + 1);
        println!("Fingerprint: {}", doc.fingerprint);
        println!("Created at: {}", doc.created_at);
        println!("Chunks: {}", doc.chunk_count);
        println!("Preview: {}", doc.preview);
        if !doc.has_index {
            println!("(index artifact missing; will be rebuilt on next upload)");
        }
    }
    println!("\nIndex artifacts ({}):", summary.index_artifacts.len());
    for name in &summary.index_artifacts {
        println!("  - {name}");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ask_collects_repeated_questions() {
        let cli = Cli::try_parse_from([
            "minirag", "ask", "report.pdf", "-q", "Revenue?", "-q", "Head count?", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Ask { questions, .. } => assert_eq!(questions.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn quota_replaces_the_usage_command() {
        let cli = Cli::try_parse_from(["minirag", "quota", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Quota));
        assert!(Cli::try_parse_from(["minirag", "usage"]).is_err());
    }

    #[test]
    fn ask_requires_a_question() {
        assert!(Cli::try_parse_from(["minirag", "ask", "report.pdf"]).is_err());
    }
}
