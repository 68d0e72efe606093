//! Tire-calibration enrichment pipeline CLI.
//!
//! Each stage is a separate invocation; stages coordinate only through the
//! persisted `enrichment_phase` of each record.
//!
//! # Usage
//!
//! ```bash
//! calibration-agents ingest vehicles.json --version v2
//! calibration-agents map --limit 50
//! ANTHROPIC_API_KEY=... calibration-agents refine-3a --limit 20 --delay 5
//! ANTHROPIC_API_KEY=... calibration-agents refine-3b --make Honda
//! calibration-agents publish --sink published-articles.json
//! calibration-agents fix-templates --dry-run
//! calibration-agents reset --category sedan
//! calibration-agents stats --days 7
//! ```
//!
//! Exit codes: 0 success, 1 failure, 2 skipped (environment does not allow
//! API or publication runs).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use calibration_agents::{
    JsonFileSink, LlmRefinementClient, Pipeline, PipelineConfig, PublicationPipeline, RunOptions,
    RunStats,
};
use clap::{Args, Parser, Subcommand};
use enrichment::{JsonFileStore, ModelTier, RawVehicleData, RecordStore, SchemaVersion};
use tracing::{error, info, warn};

/// Returned when the environment forbids the command.
const SKIP_EXIT_CODE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML file overlaid on the environment configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

/// Flags shared by every stage.
#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Maximum records per run (1-500)
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Only records of this vehicle category
    #[arg(long)]
    category: Option<String>,

    /// Only records of this make
    #[arg(long)]
    make: Option<String>,

    /// Schema version filter (v1 or v2); the target version for `ingest`
    #[arg(long)]
    version: Option<SchemaVersion>,

    /// Simulate without API calls or writes
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Reprocess records that already completed this stage
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Seconds between API calls (0-60)
    #[arg(long, default_value_t = 3)]
    delay: u64,

    /// Debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Pin every attempt to one tier (standard, intermediate, premium)
    #[arg(long)]
    model: Option<ModelTier>,
}

impl CommonArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            limit: self.limit,
            category: self.category.clone(),
            make: self.make.clone(),
            version: self.version,
            dry_run: self.dry_run,
            force: self.force,
            delay_secs: self.delay,
            debug: self.debug,
            forced_model: self.model,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create records from a JSON array of raw vehicle rows
    Ingest {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// vehicle_enriched → article_generated
    Map {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// article_generated → claude_3a_completed (editorial)
    #[command(name = "refine-3a")]
    Refine3a {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// claude_3a_completed → claude_3b_completed (technical)
    #[command(name = "refine-3b")]
    Refine3b {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// claude_3b_completed → published
    Publish {
        /// Published article file
        #[arg(long, default_value = "published-articles.json")]
        sink: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Correct templates that do not match the vehicle category
    FixTemplates {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Return failed records to the pipeline
    Reset {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Escalation statistics
    Stats {
        /// Only attempts from the last N days
        #[arg(long)]
        days: Option<u32>,
        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Self::Ingest { common, .. }
            | Self::Map { common }
            | Self::Refine3a { common }
            | Self::Refine3b { common }
            | Self::Publish { common, .. }
            | Self::FixTemplates { common }
            | Self::Reset { common }
            | Self::Stats { common, .. } => common,
        }
    }

    /// Commands that spend API budget or touch the live site.
    fn is_gated(&self) -> bool {
        matches!(self, Self::Refine3a { .. } | Self::Refine3b { .. } | Self::Publish { .. })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.command.common().debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = PipelineConfig::from_env().context("Invalid environment configuration")?;
    if let Some(path) = &cli.config {
        config = config.with_file(path)?;
    }
    let options = cli.command.common().options().validate()?;

    if cli.command.is_gated() && !config.environment.allows_api_calls() {
        warn!(environment = %config.environment, "Command disabled in this environment, skipping");
        return Ok(ExitCode::from(SKIP_EXIT_CODE));
    }

    let store: Arc<dyn RecordStore> = Arc::new(
        JsonFileStore::open(&config.store_path)
            .with_context(|| format!("Failed to open record store {}", config.store_path.display()))?,
    );
    info!(
        environment = %config.environment,
        store = %config.store_path.display(),
        dry_run = options.dry_run,
        "Calibration pipeline starting"
    );

    let stats = match &cli.command {
        Command::Ingest { file, .. } => {
            let rows = read_rows(file)?;
            let version = options.version.unwrap_or_default();
            Pipeline::new(store, config).ingest(rows, version, &options)?
        }
        Command::Map { .. } => Pipeline::new(store, config).run_mapping(&options)?,
        Command::Refine3a { .. } => {
            let client = LlmRefinementClient::from_config(&config)?;
            Pipeline::new(store, config)
                .with_client(client)
                .run_phase_3a(&options)
                .await?
        }
        Command::Refine3b { .. } => {
            let client = LlmRefinementClient::from_config(&config)?;
            Pipeline::new(store, config)
                .with_client(client)
                .run_phase_3b(&options)
                .await?
        }
        Command::Publish { sink, .. } => {
            let sink = JsonFileSink::open(sink)
                .with_context(|| format!("Failed to open article sink {}", sink.display()))?;
            PublicationPipeline::new(store, Arc::new(sink)).run(&options)?
        }
        Command::FixTemplates { .. } => Pipeline::new(store, config).repair_templates(&options)?,
        Command::Reset { .. } => Pipeline::new(store, config).reset_failed(&options)?,
        Command::Stats { days, json, .. } => {
            let report = Pipeline::new(store, config).escalation_report(&options, *days)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_statistics(&report);
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(finish(&stats, &options))
}

fn read_rows(path: &Path) -> Result<Vec<RawVehicleData>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid vehicle rows in {}", path.display()))
}

fn finish(stats: &RunStats, options: &RunOptions) -> ExitCode {
    print!("{}", stats.summary(options));
    if stats.aborted.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_statistics(report: &enrichment::EscalationStatistics) {
    println!(
        "attempts {} | successes {} ({:.1}%) | escalations {}",
        report.total_attempts, report.successful_attempts, report.success_rate, report.escalations
    );
    for (tier, usage) in &report.per_tier {
        println!(
            "  {tier}: {} attempts, {} ok, {} failed",
            usage.attempts, usage.successes, usage.failures
        );
    }
    for (category, count) in &report.error_breakdown {
        println!("  {category}: {count}");
    }
    println!(
        "cost units {} of {} possible (efficiency {:.0}%)",
        report.total_cost_units,
        report.max_possible_cost,
        report.cost_efficiency * 100.0
    );
    println!(
        "trend {} (slope {:.2}, {} days)",
        report.trend.label, report.trend.slope, report.trend.data_points
    );
    for hint in report.suggestions() {
        println!("→ {hint}");
    }
}
