use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use ragsweep_core::{
    normalize_whitespace, ChunkParams, ChunkRouter, ChunkStats, ConfigState, ConfigTester,
    Document, DocumentMetadata, EmbedderCatalog, GoldQuery, MemoryStore, QdrantStore, RunLog,
    StrategyKind, SweepConfig, SweepReport, VectorStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "ragsweep", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Memory,
    Qdrant,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate every configuration of a sweep and report the Pareto frontier.
    Sweep {
        /// Folder with .txt/.md documents, searched recursively.
        #[arg(long)]
        docs: PathBuf,
        /// JSON array of gold queries.
        #[arg(long)]
        gold: PathBuf,
        /// Sweep configuration (JSON).
        #[arg(long)]
        config: PathBuf,
        /// Where to write the run log.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Vector store backing the per-configuration collections.
        #[arg(long, value_enum, default_value = "memory")]
        store: StoreKind,
        /// Qdrant base URL
        #[arg(long, env = "RAGSWEEP_QDRANT_URL", default_value = "http://localhost:6333")]
        qdrant_url: String,
        /// Qdrant request timeout in seconds.
        #[arg(long, env = "RAGSWEEP_QDRANT_TIMEOUT_SECS", default_value = "30")]
        qdrant_timeout_secs: u64,
        /// Chunk cache file, loaded when present and rewritten after the sweep.
        #[arg(long, env = "RAGSWEEP_CHUNK_CACHE")]
        chunk_cache: Option<PathBuf>,
    },
    /// Preview how one strategy chunks a document.
    Chunk {
        #[arg(long)]
        doc: PathBuf,
        #[arg(long)]
        strategy: String,
        #[arg(long, default_value = "256")]
        chunk_size: usize,
        #[arg(long, default_value = "0")]
        overlap: usize,
        #[arg(long, default_value = "256")]
        max_tokens: usize,
    },
    /// Validate a sweep configuration and print its grid.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "ragsweep boot"
    );

    match cli.command {
        Command::Sweep {
            docs,
            gold,
            config,
            log,
            store,
            qdrant_url,
            qdrant_timeout_secs,
            chunk_cache,
        } => {
            let started_at = Utc::now();
            let config = SweepConfig::from_json_file(&config)
                .with_context(|| format!("loading sweep config {}", config.display()))?;
            let documents = load_documents(&docs)?;
            let queries = load_gold(&gold)?;
            if documents.is_empty() {
                anyhow::bail!("no .txt or .md documents under {}", docs.display());
            }
            info!(documents = documents.len(), queries = queries.len(), "corpus loaded");

            let store: Arc<dyn VectorStore> = match store {
                StoreKind::Memory => Arc::new(MemoryStore::new()),
                StoreKind::Qdrant => Arc::new(QdrantStore::new(
                    &qdrant_url,
                    Duration::from_secs(qdrant_timeout_secs),
                )?),
            };
            let catalog = EmbedderCatalog::from_specs(&config.models)?;

            let mut tester = ConfigTester::new(config, store, catalog)?;
            if let Some(path) = chunk_cache.as_deref().filter(|path| path.exists()) {
                match ChunkRouter::load(path) {
                    Ok(router) => {
                        info!(path = %path.display(), entries = router.len(), "chunk cache loaded");
                        tester = tester.with_router(Arc::new(router));
                    }
                    Err(error) => {
                        warn!(path = %path.display(), error = %error, "ignoring unreadable chunk cache")
                    }
                }
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight configurations");
                    on_signal.cancel();
                }
            });

            let report = tester.run(&documents, &queries, cancel).await?;
            print_report(&report);

            if let Some(path) = chunk_cache {
                tester.router().save(&path)?;
            }
            if let Some(path) = log {
                RunLog::from_report(&report, started_at).write(&path)?;
                println!("run log written to {}", path.display());
            }
        }
        Command::Chunk {
            doc,
            strategy,
            chunk_size,
            overlap,
            max_tokens,
        } => {
            let document = read_document(&doc, doc.parent().unwrap_or(Path::new("")))?;
            let kind = StrategyKind::from_name(&strategy)?;
            let params = kind.normalize(ChunkParams {
                chunk_size,
                overlap,
                max_tokens,
            });
            let chunks = kind.chunk(&document, &params)?;

            for chunk in &chunks {
                println!(
                    "[{}] tokens={}..{} ({}) id={}",
                    chunk.sequence,
                    chunk.start_token,
                    chunk.end_token,
                    chunk.token_len(),
                    &chunk.chunk_id[..12]
                );
                println!("  {}", chunk.text);
            }
            let stats = ChunkStats::from_chunks(&chunks);
            println!(
                "{} {}: chunks={} mean_tokens={:.1}",
                kind, params, stats.chunks, stats.mean_tokens_per_chunk
            );
        }
        Command::Validate { config } => {
            let config = SweepConfig::from_json_file(&config)
                .with_context(|| format!("loading sweep config {}", config.display()))?;
            let grid = config.space.enumerate()?;
            for configuration in &grid {
                println!("{}  {}", configuration.collection_name(), configuration);
            }
            println!(
                "{} configurations, top_k={}, primary metric {}",
                grid.len(),
                config.retrieval_top_k,
                config.primary_metric
            );
        }
    }

    Ok(())
}

fn load_documents(root: &Path) -> anyhow::Result<Vec<Document>> {
    let mut documents = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let supported = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| matches!(extension.to_ascii_lowercase().as_str(), "txt" | "md"));
        if !entry.file_type().is_file() || !supported {
            continue;
        }
        match read_document(path, root) {
            Ok(document) => documents.push(document),
            Err(error) => warn!(path = %path.display(), error = %error, "skipped document"),
        }
    }
    Ok(documents)
}

fn read_document(path: &Path, root: &Path) -> anyhow::Result<Document> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let id = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    let format = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    Ok(Document::new(
        id,
        normalize_whitespace(&text),
        DocumentMetadata {
            origin: path.display().to_string(),
            format,
            extracted_at: Utc::now(),
        },
    ))
}

fn load_gold(path: &Path) -> anyhow::Result<Vec<GoldQuery>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading gold queries {}", path.display()))?;
    let mut queries: Vec<GoldQuery> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing gold queries {}", path.display()))?;
    for (index, query) in queries.iter_mut().enumerate() {
        if query.id.is_empty() {
            query.id = format!("q{}", index + 1);
        }
    }
    Ok(queries)
}

fn print_report(report: &SweepReport) {
    for outcome in &report.outcomes {
        match (&outcome.state, &outcome.result) {
            (ConfigState::Evaluated, Some(result)) => println!(
                "evaluated  {}  recall@{}={:.3} mrr={:.3} f1={:.3} em={:.3} cost/10k={:.4} latency_ms={:.1}{}",
                outcome.configuration,
                result.metrics.top_k,
                result.metrics.recall_at_k,
                result.metrics.mrr,
                result.metrics.f1,
                result.metrics.exact_match,
                result.cost_per_10k_docs,
                result.latency_ms,
                if outcome.within_constraints { "" } else { "  (violates constraints)" }
            ),
            (ConfigState::Failed { stage, reason }, _) => {
                println!("failed     {}  stage={} reason={}", outcome.configuration, stage, reason)
            }
            (state, _) => println!("{:<10} {}", format!("{state:?}").to_lowercase(), outcome.configuration),
        }
    }

    if report.frontier.is_empty() {
        println!("frontier: no configuration met the constraints");
    } else {
        println!("frontier:");
        for member in &report.frontier {
            println!("  {}", member.configuration);
        }
    }
    if let Some(pick) = &report.recommended {
        println!("recommended: {}", pick.configuration);
    }
    if report.cancelled {
        println!("sweep was cancelled before every configuration started");
    }
}
