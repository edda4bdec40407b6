//! Thematic analysis binary entry point.
//!
//! Runs the extraction pipeline over a JSON file of sources and prints the
//! resulting themes.
//!
//! # Examples
//!
//! Analyse abstracts with local embeddings and the keyword coder:
//! ```bash
//! themes --input sources.json --purpose qualitative-analysis
//! ```
//!
//! Override the theme range and keep the result:
//! ```bash
//! themes --input sources.json --set min_themes=4 --set max_themes=12 --db-path runs.db
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use theme_engine::{
    config::{ConfigOverrides, ResearchPurpose},
    embedding::{fastembed::FastEmbedProvider, openai::OpenAIEmbedding, EmbeddingProvider},
    extraction::{keyword::KeywordCodeExtractor, llm::LlmCodeOracle, CodeExtractionOracle},
    models::{ExtractionResult, RunStatus},
    pipeline::{ChannelProgressSink, EngineSettings, ProgressEvent, ThemeExtractionEngine},
    provider::{json::JsonFileContentProvider, ContentProvider},
    storage::{sqlite::SqliteResultStore, ResultStore, RunSummary},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Embedding provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbeddingProviderType {
    /// FastEmbed local embedding provider (default, no API required)
    FastEmbed,
    /// OpenAI cloud-based embedding provider (requires OPENAI_API_KEY)
    OpenAI,
}

/// Code extraction oracle type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OracleType {
    /// Deterministic key-term coder (default, no API required)
    Keyword,
    /// Chat completions model (requires OPENAI_API_KEY)
    Llm,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// Purpose-adaptive thematic analysis over a corpus of sources
#[derive(Parser, Debug)]
#[command(
    name = "themes",
    version,
    about = "Extract validated themes from a corpus of sources",
    long_about = "Runs a six-stage reflexive thematic analysis over a JSON file of sources: \
familiarization, initial coding, theme generation, review, refinement and provenance assembly.

EXAMPLES:
  Qualitative analysis with local models:
    themes --input sources.json --purpose qualitative-analysis

  Survey construction with a tighter range:
    themes --input sources.json --purpose survey-construction --set max_themes=10

  LLM coding and OpenAI embeddings with a local fallback:
    OPENAI_API_KEY=sk-... themes --input sources.json --oracle llm \\
      --embedding-provider openai --fallback-provider fast-embed

  List stored runs:
    themes --db-path runs.db --list-runs"
)]
struct ThemesArgs {
    /// Input JSON file containing the sources
    #[arg(short, long, value_name = "FILE", required_unless_present = "list_runs")]
    input: Option<PathBuf>,

    /// Research purpose (snake_case or kebab-case)
    #[arg(short, long, value_name = "PURPOSE", default_value = "qualitative_analysis")]
    purpose: ResearchPurpose,

    /// Only analyse these source ids (repeatable)
    #[arg(long = "source", value_name = "ID")]
    sources: Vec<String>,

    /// Configuration override as key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// JSON file with configuration overrides; --set entries win
    #[arg(long, value_name = "FILE")]
    overrides: Option<PathBuf>,

    /// Embedding provider to use
    #[arg(long, value_enum, default_value = "fast-embed")]
    embedding_provider: EmbeddingProviderType,

    /// Specific embedding model name (provider-dependent, optional)
    #[arg(long, value_name = "MODEL")]
    embedding_model: Option<String>,

    /// Provider to switch to if the primary one keeps failing
    #[arg(long, value_enum)]
    fallback_provider: Option<EmbeddingProviderType>,

    /// Code extraction oracle
    #[arg(long, value_enum, default_value = "keyword")]
    oracle: OracleType,

    /// Chat model for the LLM oracle
    #[arg(long, value_name = "MODEL")]
    llm_model: Option<String>,

    /// Oracle calls in flight at once
    #[arg(long, value_name = "N", default_value = "4")]
    concurrency: usize,

    /// Oracle calls per second (0 = unlimited)
    #[arg(long, value_name = "N", default_value = "0")]
    oracle_rps: u32,

    /// Texts per embedding request
    #[arg(long, value_name = "N", default_value = "32")]
    batch_size: usize,

    /// SQLite database for storing results
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// List runs stored in --db-path and exit
    #[arg(long, requires = "db_path")]
    list_runs: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// FastEmbed model cache directory
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,
}

/// Initialize logging subsystem with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

fn openai_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY environment variable must be set for OpenAI-backed components")
}

/// Create an embedding provider of the given type
fn create_embedding_provider(
    kind: EmbeddingProviderType,
    model: Option<String>,
    cache_dir: Option<PathBuf>,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match kind {
        EmbeddingProviderType::FastEmbed => {
            info!("Initializing FastEmbed provider");
            let cache_dir = cache_dir.or_else(|| dirs::cache_dir().map(|p| p.join("fastembed")));
            debug!("Using cache directory: {:?}", cache_dir);

            let provider = match &model {
                Some(name) => FastEmbedProvider::from_model_name(name, cache_dir),
                None => FastEmbedProvider::new(None, cache_dir),
            }
            .context("Failed to initialize FastEmbed provider")?;

            info!(
                "FastEmbed provider initialized: model={}, dimension={}",
                provider.model_name(),
                provider.dimension()
            );
            Ok(Arc::new(provider))
        }
        EmbeddingProviderType::OpenAI => {
            info!("Initializing OpenAI embedding provider");
            let provider = OpenAIEmbedding::new(openai_key()?, model)
                .context("Failed to initialize OpenAI embedding provider")?;

            info!(
                "OpenAI provider initialized: model={}, dimension={}",
                provider.model_name(),
                provider.dimension()
            );
            Ok(Arc::new(provider))
        }
    }
}

fn create_oracle(args: &ThemesArgs) -> Result<Arc<dyn CodeExtractionOracle>> {
    match args.oracle {
        OracleType::Keyword => Ok(Arc::new(KeywordCodeExtractor::new())),
        OracleType::Llm => {
            let oracle = LlmCodeOracle::new(&openai_key()?, args.llm_model.clone())
                .context("Failed to initialize LLM oracle")?;
            info!("LLM oracle initialized: model={}", oracle.model());
            Ok(Arc::new(oracle))
        }
    }
}

/// Merge the overrides file and the --set pairs
fn load_overrides(args: &ThemesArgs) -> Result<ConfigOverrides> {
    let mut overrides = match &args.overrides {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read overrides file: {:?}", path))?;
            ConfigOverrides::from_json(&json)
                .with_context(|| format!("Invalid overrides file: {:?}", path))?
        }
        None => ConfigOverrides::default(),
    };

    for pair in &args.set {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("Override must be KEY=VALUE, got '{}'", pair);
        };
        overrides
            .set(key, value)
            .with_context(|| format!("Invalid override '{}'", pair))?;
    }
    Ok(overrides)
}

async fn open_store(path: &Path) -> Result<Arc<SqliteResultStore>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
            info!("Created database directory: {:?}", parent);
        }
    }
    let store = SqliteResultStore::new(path)
        .await
        .with_context(|| format!("Failed to open result store at {:?}", path))?;
    Ok(Arc::new(store))
}

/// Create a progress bar tracking overall run percentage
fn create_progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );
    Ok(pb)
}

/// Feed progress events into the bar until the channel closes
fn spawn_progress(
    mut rx: mpsc::Receiver<ProgressEvent>,
    pb: Option<ProgressBar>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &pb {
                Some(pb) => {
                    pb.set_position(event.percentage.round() as u64);
                    pb.set_message(format!(
                        "[{}/{}] {}",
                        event.stage_number, event.total_stages, event.description
                    ));
                }
                None => debug!(percentage = event.percentage as f64, "{}", event.description),
            }
        }
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
    })
}

fn format_themes_table(result: &ExtractionResult) -> String {
    if result.themes.is_empty() {
        return "No themes found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("Theme").add_attribute(Attribute::Bold),
        Cell::new("Keywords").add_attribute(Attribute::Bold),
        Cell::new("Codes").add_attribute(Attribute::Bold),
        Cell::new("Sources").add_attribute(Attribute::Bold),
        Cell::new("Coherence").add_attribute(Attribute::Bold),
    ]);

    for (idx, theme) in result.themes.iter().enumerate() {
        let color = if theme.low_confidence {
            Color::Yellow
        } else if theme.coherence_score >= 0.6 {
            Color::Green
        } else {
            Color::White
        };
        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(&theme.label),
            Cell::new(theme.keywords.join(", ")),
            Cell::new(theme.size()),
            Cell::new(theme.source_ids.len()),
            Cell::new(format!("{:.3}", theme.coherence_score)).fg(color),
        ]);
    }

    table.to_string()
}

fn format_runs_table(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "No stored runs.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").add_attribute(Attribute::Bold),
        Cell::new("Purpose").add_attribute(Attribute::Bold),
        Cell::new("Themes").add_attribute(Attribute::Bold),
        Cell::new("Quality").add_attribute(Attribute::Bold),
        Cell::new("Saturated").add_attribute(Attribute::Bold),
        Cell::new("Finished").add_attribute(Attribute::Bold),
    ]);
    for run in runs {
        let status = if run.complete {
            Cell::new(&run.run_id)
        } else {
            Cell::new(&run.run_id).fg(Color::Red)
        };
        table.add_row(vec![
            status,
            Cell::new(&run.purpose),
            Cell::new(run.theme_count),
            Cell::new(format!("{:.3}", run.quality_score)),
            Cell::new(if run.saturation_reached { "yes" } else { "no" }),
            Cell::new(run.finished_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    table.to_string()
}

fn print_summary(result: &ExtractionResult, elapsed: std::time::Duration) {
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Thematic Analysis Summary         ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Purpose:    {:>26} ║", result.purpose.as_str());
    println!("║ Themes:               {:>16} ║", result.theme_count());
    println!("║ Quality score:        {:>16.3} ║", result.quality_score);
    println!("║ Saturation reached:   {:>16} ║", result.saturation_reached);
    println!("║ Iterations:           {:>16} ║", result.iterations);
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ThemesArgs::parse();

    init_logging(&args.log_level).context("Failed to initialize logging")?;
    debug!("CLI arguments: {:?}", args);

    if args.list_runs {
        let Some(db_path) = &args.db_path else {
            anyhow::bail!("--list-runs requires --db-path");
        };
        let store = open_store(db_path).await?;
        let runs = store.list_runs().await.context("Failed to list stored runs")?;
        match args.format {
            OutputFormat::Table => println!("{}", format_runs_table(&runs)),
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&runs).context("Failed to serialize runs to JSON")?
            ),
        }
        return Ok(());
    }

    let Some(input) = args.input.clone() else {
        anyhow::bail!("--input is required");
    };
    if !input.exists() {
        error!("Input file does not exist: {:?}", input);
        anyhow::bail!("Input file not found: {:?}", input);
    }
    info!("Starting thematic analysis: purpose={}, input={:?}", args.purpose, input);
    let start_time = Instant::now();

    let overrides = load_overrides(&args)?;
    if !overrides.is_empty() {
        debug!("Configuration overrides: {:?}", overrides);
    }

    let embedder = create_embedding_provider(
        args.embedding_provider,
        args.embedding_model.clone(),
        args.cache_dir.clone(),
    )
        .context("Failed to create embedding provider")?;
    let oracle = create_oracle(&args).context("Failed to create code extraction oracle")?;

    let mut settings = EngineSettings::default();
    settings.oracle.max_concurrency = args.concurrency.max(1);
    settings.oracle.requests_per_second = args.oracle_rps;
    settings.embedding.batch_size = args.batch_size.max(1);

    let mut engine = ThemeExtractionEngine::new(embedder, oracle, settings);
    if let Some(kind) = args.fallback_provider {
        if kind == args.embedding_provider {
            warn!("Fallback provider is the same as the primary provider; ignoring");
        } else {
            // The fallback always runs its provider's default model
            let fallback = create_embedding_provider(kind, None, args.cache_dir.clone())
                .context("Failed to create fallback embedding provider")?;
            engine = engine.with_fallback(fallback);
        }
    }
    if let Some(db_path) = &args.db_path {
        engine = engine.with_store(open_store(db_path).await?);
        info!("Results will be stored in {:?}", db_path);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling run");
            interrupt.cancel();
        }
    });

    let (sink, rx) = ChannelProgressSink::channel(256);
    let progress_bar = if args.quiet || args.format == OutputFormat::Json {
        None
    } else {
        Some(create_progress_bar()?)
    };
    let progress = spawn_progress(rx, progress_bar);

    let provider = JsonFileContentProvider::new(&input);
    let source_ids = (!args.sources.is_empty()).then_some(args.sources.as_slice());
    info!("Loading sources from {}", provider.name());
    let outcome = engine
        .run_from_provider(
            &provider,
            source_ids,
            args.purpose,
            &overrides,
            Arc::new(sink),
            cancel,
        )
        .await;
    // The run context owned the sender, so the channel is closed by now
    if let Err(e) = progress.await {
        warn!("Progress display task failed: {}", e);
    }

    let result = outcome.context("Thematic analysis failed")?;

    match args.format {
        OutputFormat::Table => {
            println!("{}", format_themes_table(&result));
            print_summary(&result, start_time.elapsed());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&result)
                    .context("Failed to serialize result to JSON")?
            );
        }
    }

    if let RunStatus::Failed { stage, reason } = &result.status {
        warn!("Run stopped at stage {}: {}", stage, reason);
        anyhow::bail!("Run stopped early at stage {}: {}", stage, reason);
    }
    if result.low_confidence {
        warn!("Result is low confidence - too few codes for the requested theme range");
    }

    info!("Thematic analysis completed: run_id={}", result.run_id);
    Ok(())
}
