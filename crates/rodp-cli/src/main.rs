use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rodp_pipeline::config::{PipelineConfig, RunOverrides};
use rodp_pipeline::report::report_daily_markdown;
use rodp_pipeline::summary::RunSummary;
use rodp_pipeline::{
    connect_warehouse, maybe_build_scheduler, run_with_postgres, PipelineRunner,
    DEFAULT_CONFIG_PATH,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "rodp-cli")]
#[command(about = "Restaurant order data pipeline")]
struct Cli {
    /// Pipeline configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once
    Run(RunArgs),
    /// Apply database migrations
    Migrate,
    /// Run the pipeline on the configured cron schedule until interrupted
    Schedule,
    /// Print a markdown digest of recent runs
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
    #[arg(long, conflicts_with = "full")]
    incremental: bool,
    #[arg(long)]
    full: bool,
    #[arg(long, conflicts_with = "no_quality_check")]
    quality_check: bool,
    #[arg(long)]
    no_quality_check: bool,
    #[arg(long)]
    export_csv: bool,
    #[arg(long)]
    export_parquet: bool,
}

impl RunArgs {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            incremental: flag_pair(self.incremental, self.full),
            quality_check: flag_pair(self.quality_check, self.no_quality_check),
            export_csv: self.export_csv.then_some(true),
            export_parquet: self.export_parquet.then_some(true),
        }
    }
}

fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "pipeline {:?}: run_id={} mode={:?} duration={:.2}s reports={}",
        summary.status,
        summary.run_id,
        summary.mode,
        summary.duration_secs,
        summary.reports_dir.as_deref().unwrap_or("-")
    );
    if let Some(message) = &summary.message {
        println!("  {message}");
    }
    if let Some(stage) = &summary.stages.transformation {
        println!(
            "  complete_orders={} daily_revenue={} top_items={} category_metrics={} \
             total_discrepancies={}",
            stage.complete_orders,
            stage.daily_revenue,
            stage.top_items,
            stage.category_metrics,
            stage.total_discrepancies
        );
    }
    if let Some(stage) = &summary.stages.quality_check {
        println!(
            "  quality issues={} fixes_applied={}",
            stage.issues_found, stage.fixes_applied
        );
    }
    if let Some(error) = &summary.error {
        eprintln!("  error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = PipelineConfig::load(&cli.config)?;
    init_logging(&config.logging.level);
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found; using defaults");
    }

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let summary = run_with_postgres(config, &args.overrides()).await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if !summary.succeeded() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            connect_warehouse(&config.database).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let warehouse = connect_warehouse(&config.database).await?;
            let runner = Arc::new(PipelineRunner::new(config, Arc::new(warehouse)));
            let Some(mut sched) = maybe_build_scheduler(runner).await? else {
                eprintln!("scheduler is disabled; set scheduler.enabled in the config file");
                return Ok(ExitCode::FAILURE);
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let markdown = report_daily_markdown(runs, &config.paths.reports_dir)?;
            println!("{markdown}");
        }
    }

    Ok(ExitCode::SUCCESS)
}
