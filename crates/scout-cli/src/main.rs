use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use scout_adapters::{FixtureFetcher, ProfileFetcher};
use scout_core::RunSummary;
use scout_storage::{CandidateStore, MemoryCandidateStore, MemoryMissionStore, MissionStore, PgStore};
use scout_sync::missions::{import_missions, load_missions};
use scout_sync::schedule::run_scheduler;
use scout_sync::{MissionRequest, Pipeline, RunOutcome, ScoutConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Recruiting lead scout command-line interface")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one mission now.
    Run(RunArgs),
    /// Apply database migrations.
    Migrate,
    /// Seed missions from a YAML file.
    ImportMissions { file: PathBuf },
    /// Run a mission on its cron schedule until Ctrl-C.
    Schedule(SourceArgs),
}

#[derive(Debug, Default, Args)]
struct SourceArgs {
    #[arg(long)]
    mission: Option<String>,
    /// Serve search results and profiles from a fixture bundle instead of the network.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Use in-memory stores seeded from this missions file instead of Postgres.
    #[arg(long = "missions-file")]
    missions_file: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    location: Option<String>,
    /// Run even when the mission is not due.
    #[arg(long)]
    force: bool,
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "scout=info,sqlx=warn",
        1 => "scout=debug,sqlx=info",
        _ => "scout=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

struct Stores {
    candidates: Arc<dyn CandidateStore>,
    missions: Arc<dyn MissionStore>,
}

async fn open_stores(config: &ScoutConfig, missions_file: Option<&Path>) -> Result<Stores> {
    if let Some(path) = missions_file {
        let missions = load_missions(path).await?;
        info!(missions = missions.len(), "using in-memory stores");
        return Ok(Stores {
            candidates: Arc::new(MemoryCandidateStore::new(config.upsert_policy)),
            missions: Arc::new(MemoryMissionStore::from_missions(missions)),
        });
    }
    let store = connect(config).await?;
    Ok(Stores {
        candidates: Arc::new(store.clone()),
        missions: Arc::new(store),
    })
}

async fn connect(config: &ScoutConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.upsert_policy)
        .await
        .context("connecting to candidate store (DATABASE_URL)")
}

async fn build_pipeline(config: &ScoutConfig, source: &SourceArgs) -> Result<Pipeline> {
    let stores = open_stores(config, source.missions_file.as_deref()).await?;
    let fetcher: Arc<dyn ProfileFetcher> = match &source.fixtures {
        Some(path) => {
            let fixture = FixtureFetcher::load(path)?;
            info!(fixture_id = fixture.fixture_id(), "serving profiles from fixture");
            Arc::new(fixture)
        }
        None => config.build_fetcher(),
    };
    let scorer = config.build_scorer()?;
    info!(scorer = scorer.name(), "scorer selected");

    Ok(Pipeline::new(fetcher, scorer, stores.candidates, stores.missions)
        .with_retry(config.retry.clone())
        .with_options(config.pipeline.clone()))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} mission={} status={} {}",
        summary.run_id,
        summary.mission_name,
        summary.status().as_str(),
        summary.counter_line()
    );
    if let Some(err) = &summary.enumeration_error {
        println!("  search stopped early: {err}");
    }
    for failure in &summary.errors {
        println!("  {failure}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli);
    let config = ScoutConfig::from_env()?;

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let pipeline = build_pipeline(&config, &args.source).await?;
            let request = MissionRequest {
                name: args.source.mission.clone(),
                query: args.query,
                location: args.location,
                force: args.force,
            };
            match pipeline.run_mission(&request).await? {
                RunOutcome::Completed(summary) => print_summary(&summary),
                RunOutcome::NotDue { mission, next_run_at } => {
                    let next = next_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
                    println!("mission {mission} not due until {next}; pass --force to run now");
                }
            }
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::ImportMissions { file } => {
            let missions = load_missions(&file).await?;
            let store = connect(&config).await?;
            let count = import_missions(&store, &missions).await?;
            println!("imported {count} mission(s) from {}", file.display());
        }
        Commands::Schedule(source) => {
            let pipeline = build_pipeline(&config, &source).await?;
            let mission = pipeline.resolve_mission(source.mission.as_deref()).await?;
            run_scheduler(Arc::new(pipeline), &mission).await?;
        }
    }

    Ok(())
}
