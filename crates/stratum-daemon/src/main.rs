//! `stratum` — CLI and daemon for the conversational knowledge
//! distillation pipeline.

mod sessions;
mod supervisor;

use std::sync::Arc;

use anyhow::{anyhow, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratum_core::{
    ElementRepository, JobRepository, JobSource, Layer, PipelineOptions, ReasoningBackend,
    RunReport, SessionProvider, WatchStateRepository,
};
use stratum_db::{Database, PgElementRepository, PgJobRepository, PgWatchStateRepository};
use stratum_inference::{OpenAiReasoning, ReasoningConfig};
use stratum_pipeline::{Pipeline, SynthesisScheduler, TranscriptWatcher, WatcherConfig};

use sessions::ExportSessionProvider;
use supervisor::DaemonConfig;

/// Shared collaborators handed to commands and the supervisor.
pub struct Services {
    pub jobs: Arc<dyn JobRepository>,
    pub elements: Arc<dyn ElementRepository>,
    pub watch: Arc<dyn WatchStateRepository>,
    pub sessions: Arc<dyn SessionProvider>,
    pub reasoning: Arc<dyn ReasoningBackend>,
    pub pipeline: Arc<Pipeline>,
}

#[derive(Parser)]
#[command(name = "stratum", version, about = "Distill conversations into a layered knowledge base")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Re-process raw units even when already covered by facts.
    #[arg(long)]
    force: bool,
    /// Log what would happen without persisting anything.
    #[arg(long)]
    dry_run: bool,
    /// Stop after fact extraction.
    #[arg(long)]
    facts_only: bool,
    /// Only material newer than this date (RFC 3339 or YYYY-MM-DD).
    #[arg(long)]
    since: Option<String>,
    /// Cap on units processed.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Full pipeline over every source: transcripts, then sessions,
    /// then synthesis.
    Run(RunArgs),
    /// Pipeline over chat-sync sessions only.
    Chats(RunArgs),
    /// Pipeline over watched transcript files only.
    Transcripts(RunArgs),
    /// Run a single layer (1-4 or facts|themes|insights|dossier).
    Layer {
        layer: String,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Re-run L2-L4 without re-extracting facts.
    Regenerate {
        #[arg(long)]
        dry_run: bool,
    },
    /// Incremental dossier refresh from material since the last
    /// generation.
    Curate {
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue and element counts.
    Stats,
    /// Print the full lineage of one element.
    Lineage { element_id: String },
    /// Apply the embedded schema.
    Migrate,
    /// Back up and empty the knowledge base.
    Reset {
        #[arg(long)]
        confirm: bool,
    },
    /// Run the watcher, worker pool, and synthesis loops until
    /// signalled.
    Daemon,
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stratum=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_services(db: &Database) -> anyhow::Result<Services> {
    let jobs: Arc<dyn JobRepository> = Arc::new(PgJobRepository::new(db.pool.clone()));
    let elements: Arc<dyn ElementRepository> = Arc::new(PgElementRepository::new(db.pool.clone()));
    let watch: Arc<dyn WatchStateRepository> =
        Arc::new(PgWatchStateRepository::new(db.pool.clone()));
    let sessions: Arc<dyn SessionProvider> = Arc::new(ExportSessionProvider::from_env());
    let reasoning: Arc<dyn ReasoningBackend> =
        Arc::new(OpenAiReasoning::new(ReasoningConfig::from_env()?)?);

    let pipeline = Arc::new(Pipeline::new(
        elements.clone(),
        reasoning.clone(),
        sessions.clone(),
        watch.clone(),
    ));
    Ok(Services {
        jobs,
        elements,
        watch,
        sessions,
        reasoning,
        pipeline,
    })
}

fn parse_since(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| anyhow!("unparseable --since value: {raw} (expected RFC 3339 or YYYY-MM-DD)"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc())
}

fn options_from(args: &RunArgs, source: Option<JobSource>) -> anyhow::Result<PipelineOptions> {
    Ok(PipelineOptions {
        force_reprocess: args.force,
        facts_only: args.facts_only,
        dry_run: args.dry_run,
        since: args.since.as_deref().map(parse_since).transpose()?,
        limit: args.limit,
        source,
    })
}

/// Record transcript changes into watch state, then extract facts from
/// every unprocessed file.
async fn process_transcripts(
    services: &Services,
    options: &PipelineOptions,
) -> anyhow::Result<RunReport> {
    let config = DaemonConfig::from_env();
    // Throwaway scheduler: the CLI path drains the watch state
    // directly instead of running the synthesis loops.
    let watcher = TranscriptWatcher::new(
        WatcherConfig::new(config.transcript_dir),
        services.watch.clone(),
        SynthesisScheduler::default(),
    );
    watcher.scan_once().await?;

    let mut report = RunReport::default();
    for entry in services.watch.list_unprocessed().await? {
        report.absorb(
            services
                .pipeline
                .transcript_facts(&entry.path, options)
                .await?,
        );
    }
    Ok(report)
}

/// L2-L4 with the given options, for command paths that extract facts
/// themselves.
async fn synthesis_tail(pipeline: &Pipeline, options: &PipelineOptions) -> anyhow::Result<RunReport> {
    let mut report = pipeline.run_layer(Layer::Themes, options).await?;
    report.absorb(pipeline.run_layer(Layer::Insights, options).await?);
    report.absorb(pipeline.run_layer(Layer::Dossier, options).await?);
    Ok(report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/stratum".to_string());
    let db = Database::connect(&database_url).await?;
    let services = build_services(&db)?;

    match cli.command {
        Command::Run(args) => {
            let options = options_from(&args, None)?;
            let mut report = process_transcripts(&services, &options).await?;
            report.absorb(services.pipeline.run_full(&options).await?);
            println!("{report}");
        }
        Command::Chats(args) => {
            let options = options_from(&args, Some(JobSource::ChatSync))?;
            let report = services.pipeline.run_full(&options).await?;
            println!("{report}");
        }
        Command::Transcripts(args) => {
            let options = options_from(&args, None)?;
            let mut report = process_transcripts(&services, &options).await?;
            if !options.facts_only {
                report.absorb(synthesis_tail(&services.pipeline, &options).await?);
            }
            println!("{report}");
        }
        Command::Layer {
            layer,
            since,
            limit,
        } => {
            let layer = Layer::parse(&layer)
                .ok_or_else(|| anyhow!("unknown layer: {layer} (expected 1-4 or facts|themes|insights|dossier)"))?;
            let options = PipelineOptions {
                since: since.as_deref().map(parse_since).transpose()?,
                limit,
                ..PipelineOptions::default()
            };
            let report = services.pipeline.run_layer(layer, &options).await?;
            println!("{report}");
        }
        Command::Regenerate { dry_run } => {
            let options = PipelineOptions {
                dry_run,
                ..PipelineOptions::default()
            };
            let report = services.pipeline.regenerate(&options).await?;
            println!("{report}");
        }
        Command::Curate { dry_run } => {
            let options = PipelineOptions {
                dry_run,
                ..PipelineOptions::default()
            };
            let report = services.pipeline.run_curator(&options).await?;
            println!("{report}");
        }
        Command::Stats => {
            let queue = services.jobs.stats().await?;
            let counts = services.elements.counts().await?;
            println!(
                "queue:    {} pending, {} processing, {} completed, {} failed ({} total)",
                queue.pending, queue.processing, queue.completed, queue.failed, queue.total
            );
            println!(
                "elements: {} facts, {} themes, {} insights, {} documents",
                counts.facts, counts.themes, counts.insights, counts.documents
            );
        }
        Command::Lineage { element_id } => {
            let trace = stratum_db::trace(&db.pool, &element_id).await?;
            println!("{trace}");
        }
        Command::Migrate => {
            stratum_db::migrate(&db.pool).await?;
            println!("schema up to date (version {})", stratum_db::SCHEMA_VERSION);
        }
        Command::Reset { confirm } => {
            if !confirm {
                bail!("reset empties the knowledge base; re-run with --confirm");
            }
            let backup_dir = std::env::var("STRATUM_BACKUP_DIR")
                .unwrap_or_else(|_| "./backups".to_string());
            std::fs::create_dir_all(&backup_dir)?;
            let backup = stratum_db::reset(&db.pool, std::path::Path::new(&backup_dir)).await?;
            info!(backup = %backup.display(), "Knowledge base reset");
            println!("backup written to {}", backup.display());
        }
        Command::Daemon => {
            supervisor::run(&db, services, DaemonConfig::from_env()).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_all_subcommands() {
        for argv in [
            vec!["stratum", "run", "--force", "--limit", "5"],
            vec!["stratum", "chats", "--dry-run"],
            vec!["stratum", "transcripts", "--facts-only"],
            vec!["stratum", "layer", "2", "--since", "2026-08-01"],
            vec!["stratum", "regenerate"],
            vec!["stratum", "curate", "--dry-run"],
            vec!["stratum", "stats"],
            vec!["stratum", "lineage", "d_abc"],
            vec!["stratum", "migrate"],
            vec!["stratum", "reset", "--confirm"],
            vec!["stratum", "daemon"],
        ] {
            Cli::try_parse_from(&argv).unwrap_or_else(|e| panic!("{argv:?}: {e}"));
        }
    }

    #[test]
    fn parse_since_accepts_both_forms() {
        let date = parse_since("2026-08-12").unwrap();
        assert_eq!(date.to_rfc3339(), "2026-08-12T00:00:00+00:00");

        let instant = parse_since("2026-08-12T09:30:00Z").unwrap();
        assert_eq!(instant.to_rfc3339(), "2026-08-12T09:30:00+00:00");

        assert!(parse_since("last tuesday").is_err());
    }

    #[test]
    fn run_args_map_to_pipeline_options() {
        let args = RunArgs {
            force: true,
            dry_run: true,
            facts_only: false,
            since: Some("2026-01-01".to_string()),
            limit: Some(10),
        };
        let options = options_from(&args, Some(JobSource::ChatSync)).unwrap();
        assert!(options.force_reprocess);
        assert!(options.dry_run);
        assert!(!options.facts_only);
        assert!(options.since.is_some());
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.source, Some(JobSource::ChatSync));
    }
}
