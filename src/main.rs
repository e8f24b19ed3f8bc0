use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sample_dispatch::config::Settings;
use sample_dispatch::logging;
use sample_dispatch::orchestrator::{Orchestrator, PassSummary};
use sample_dispatch::scheduler::ProcessedLedger;
use sample_dispatch::shutdown::install_shutdown_handler;
use sample_dispatch::store::{JsonFileStore, RecordStore};
use sample_dispatch::worker::{Dispatcher, JobBuilder, JobExecutor, NextflowBuilder};

#[derive(Parser, Debug)]
#[command(name = "sample-dispatch")]
#[command(version)]
#[command(about = "Dispatch queued sequencing samples to nextflow pipelines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one dispatch pass: select, build, dispatch, record
    Run(RunArgs),

    /// Validate the configuration file, pipeline keys included, and exit
    Check {
        /// Path to the TOML configuration file
        #[arg(long, short = 'c', default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', default_value = "config.toml")]
    config: PathBuf,

    /// Directory for the per-run log file (overrides `logging.log_dir`)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Remove the work directory of every completed job
    #[arg(long)]
    cleanup: bool,

    /// Summary output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

async fn run_pass(args: RunArgs) -> Result<PassSummary, Box<dyn std::error::Error>> {
    let settings = Settings::load(&args.config)?;

    let log_dir = args.log_dir.or_else(|| settings.logging.log_dir.clone());
    if let Err(e) = logging::init(log_dir.as_deref(), settings.logging.max_log_files) {
        eprintln!("Warning: file logging unavailable: {e}");
    }

    let dispatch = &settings.dispatch;
    tracing::info!(
        queue = %dispatch.queue_tag,
        store = %dispatch.store_path.display(),
        concurrency_limit = dispatch.concurrency_limit,
        "Starting dispatch pass"
    );

    let shutdown = install_shutdown_handler();
    let store: Arc<dyn RecordStore> = Arc::new(JsonFileStore::new(&dispatch.store_path));
    let ledger = ProcessedLedger::load(&dispatch.ledger_path)?;
    let executor = JobExecutor::new()
        .with_timeout(dispatch.job_timeout())
        .with_shutdown(shutdown.clone());
    let dispatcher = Dispatcher::new(
        executor,
        dispatch.concurrency_limit,
        dispatch.stagger_interval(),
    )?
    .with_shutdown(shutdown);

    let mut orchestrator = Orchestrator::new(
        store,
        dispatch.queue_tag.clone(),
        ledger,
        NextflowBuilder::new(settings.pipeline.clone()),
        dispatcher,
    )
    .with_cleanup(args.cleanup);

    Ok(orchestrator.run_pass().await?)
}

fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(path)?;
    NextflowBuilder::new(settings.pipeline.clone()).validate()?;
    println!("Configuration OK: {}", path.display());
    println!("Queue: {}", settings.dispatch.queue_tag);
    println!("Concurrency limit: {}", settings.dispatch.concurrency_limit);
    println!("Stagger interval: {:?}", settings.dispatch.stagger_interval());
    println!("Pipelines: {}", settings.pipeline.pipelines.join(", "));
    Ok(())
}

fn print_summary(summary: &PassSummary, output: &OutputFormat) -> serde_json::Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Table => print!("{summary}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            let output = run_args.output.clone();
            match run_pass(run_args).await {
                Ok(summary) => {
                    if let Err(e) = print_summary(&summary, &output) {
                        eprintln!("Error: failed to print summary: {e}");
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch pass aborted");
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Check { config } => {
            if let Err(e) = check_config(&config) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }
}
