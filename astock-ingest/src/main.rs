//! Astock Ingest - A-share warehouse ingestion CLI.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use astock_common::logging::{init_logging, mask_credentials};
use astock_common::Config;
use astock_ingest::datasets::{self, Dataset};
use astock_ingest::pipeline::{
    AutoConfirm, CancelFlag, CheckpointStore, Confirm, DateRange, FetchPoolOptions, FileCheckpoint,
    IngestionRun, MarketFilter, MemoryCheckpoint, RunOptions, RunState, SinkOptions, StdinConfirm,
    Storage, UpsertSink,
};
use astock_ingest::provider::AkToolsClient;
use astock_ingest::storage::SqliteWarehouse;

/// Exit status of a run that finished with failed units.
const EXIT_UNITS_FAILED: u8 = 2;
/// Exit status of a run stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Incremental A-share data ingestion into a SQLite warehouse.
#[derive(Parser, Debug)]
#[command(name = "astock-ingest")]
#[command(version)]
#[command(about = "Idempotent incremental ingestion of A-share market data.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.astock/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available datasets
    Datasets,

    /// Create every dataset table in the warehouse
    Init,

    /// Ingest one dataset
    Run {
        /// Dataset name (see `datasets`)
        dataset: String,

        /// First date of the window (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last date of the window (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Write to the staging table and offer a merge afterwards
        #[arg(long, conflicts_with = "no_staging")]
        staging: bool,

        /// Write directly to the target table
        #[arg(long)]
        no_staging: bool,

        /// Discard an existing checkpoint and start from the first unit
        #[arg(long)]
        restart: bool,

        /// Answer yes to every confirmation
        #[arg(short, long)]
        yes: bool,

        /// Override the number of fetch workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Merge a dataset's staging table into its target
    Merge {
        dataset: String,

        /// Answer yes to every confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_and_validate(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("astock-ingest: {}", e);
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1));
        }
    };

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );
    info!("Astock Ingest v{}", env!("CARGO_PKG_VERSION"));

    match dispatch(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("astock-ingest: {:#}", e);
            match e.downcast_ref::<astock_common::Error>() {
                Some(e) => ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1)),
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn dispatch(command: Commands, config: Config) -> Result<ExitCode> {
    let markets = MarketFilter::from_config(&config.markets);

    match command {
        Commands::Datasets => {
            for dataset in datasets::catalog(&markets) {
                println!(
                    "{:<16} {:<22} {}{}",
                    dataset.name,
                    dataset.schema.name,
                    dataset.description,
                    if dataset.staging { " (staged)" } else { "" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Init => {
            let warehouse = open_warehouse(&config)?;
            for dataset in datasets::catalog(&markets) {
                warehouse
                    .ensure_relation(&dataset.schema.name, &dataset.schema)
                    .await
                    .with_context(|| format!("Failed to create table for {}", dataset.name))?;
                info!(dataset = dataset.name, table = %dataset.schema.name, "Table ready");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            dataset,
            start,
            end,
            staging,
            no_staging,
            restart,
            yes,
            workers,
        } => {
            let dataset = lookup(&dataset, &markets)?;
            let staging = !no_staging && (staging || dataset.staging);
            let args = RunArgs {
                start,
                end,
                staging,
                restart,
                yes,
                workers,
            };
            run_dataset(&config, &markets, dataset, args).await
        }

        Commands::Merge { dataset, yes } => {
            let dataset = lookup(&dataset, &markets)?;
            let warehouse = open_warehouse(&config)?;
            let sink = UpsertSink::new(
                warehouse,
                dataset.schema.clone(),
                SinkOptions::from_config(&config.sink).with_staging(true),
            );
            sink.prepare().await?;
            match sink.merge_staging(confirmer(yes).as_ref()).await? {
                Some(rows) => println!("Merged {} rows into {}", rows, dataset.schema.name),
                None => println!("Nothing merged into {}", dataset.schema.name),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct RunArgs {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    staging: bool,
    restart: bool,
    yes: bool,
    workers: Option<usize>,
}

async fn run_dataset(
    config: &Config,
    markets: &MarketFilter,
    dataset: Dataset,
    args: RunArgs,
) -> Result<ExitCode> {
    let today = Local::now().date_naive();
    let range = DateRange::from_bounds(
        args.start.or(config.window.start_date),
        args.end.or(config.window.end_date),
        today,
    )?;

    let client = Arc::new(AkToolsClient::new(&config.provider)?);
    info!(
        dataset = dataset.name,
        provider = %mask_credentials(client.base_url()),
        window = ?range.map(|r| r.to_string()),
        staging = args.staging,
        "Starting ingestion"
    );

    let sink = UpsertSink::new(
        open_warehouse(config)?,
        dataset.schema.clone(),
        SinkOptions::from_config(&config.sink).with_staging(args.staging),
    );

    let checkpoint: Arc<dyn CheckpointStore> = if config.checkpoint.enabled {
        Arc::new(FileCheckpoint::for_run(
            &config.checkpoint.resolved_dir(),
            dataset.name,
            range.filter(|_| dataset.windowed),
        ))
    } else {
        Arc::new(MemoryCheckpoint::new())
    };

    let mut fetch = FetchPoolOptions::from_config(&config.fetch);
    if let Some(workers) = args.workers {
        fetch.max_workers = workers.max(1);
    }

    let mut options = RunOptions::from_config(dataset.name, config);
    options.restart = args.restart;
    options.merge_staging = args.staging;

    let mut run = IngestionRun::new(options, dataset.normalizer(), sink)
        .with_enumerator(dataset.enumerator(markets, range))
        .with_fetch_options(fetch)
        .with_checkpoint(checkpoint)
        .with_confirm(confirmer(args.yes));

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if on_signal.is_cancelled() {
                eprintln!("astock-ingest: second interrupt, exiting");
                std::process::exit(i32::from(EXIT_CANCELLED));
            }
            warn!("Interrupt received, stopping after the current unit batch (Ctrl-C again to exit)");
            on_signal.cancel();
        }
    });

    let ids = dataset.identifiers(Arc::clone(&client), range, today);
    let outcome = run
        .execute(ids.as_ref(), dataset.source(client), &cancel)
        .await?;
    println!("{}", outcome);

    Ok(match outcome.state {
        RunState::Completed => ExitCode::SUCCESS,
        RunState::Cancelled => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::from(EXIT_UNITS_FAILED),
    })
}

fn lookup(name: &str, markets: &MarketFilter) -> Result<Dataset> {
    Ok(datasets::require(name, markets)?)
}

fn open_warehouse(config: &Config) -> Result<Arc<SqliteWarehouse>> {
    let path = config.database.resolved_path();
    let warehouse = SqliteWarehouse::open(&path)
        .with_context(|| format!("Failed to open warehouse at {}", path.display()))?;
    Ok(Arc::new(warehouse))
}

fn confirmer(yes: bool) -> Arc<dyn Confirm> {
    if yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(StdinConfirm::stdin())
    }
}
