mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use sync_core::{FaultClass, SyncMode};
use sync_engine::{EngineError, SyncEngine, SyncError, SyncJob};
use sync_logging::{sync_error, sync_info, LogDestination};

use crate::config::SyncConfig;

/// Mirror remote collections into the local id-keyed cache.
#[derive(Parser)]
#[command(name = "collection-sync")]
#[command(about = "Checkpointed, load-adaptive sync of paginated remote collections")]
struct Cli {
    #[arg(short, long, env = "COLLECTION_SYNC_CONFIG", default_value = "sync.ron")]
    config: PathBuf,

    #[arg(
        long,
        value_enum,
        default_value_t = ModeArg::Incremental,
        help = "Incremental falls back to full when there is no completed run"
    )]
    mode: ModeArg,

    #[arg(long, help = "Only sync these collections (repeatable)")]
    only: Vec<String>,

    #[arg(long, value_enum, default_value_t = LogArg::Both)]
    log: LogArg,

    #[arg(short, long, help = "Log at debug level")]
    verbose: bool,

    #[arg(long, help = "Do not record the run's start checkpoint")]
    debug_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => SyncMode::Full,
            ModeArg::Incremental => SyncMode::Incremental,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogArg {
    File,
    Terminal,
    Both,
}

impl From<LogArg> for LogDestination {
    fn from(log: LogArg) -> Self {
        match log {
            LogArg::File => LogDestination::File,
            LogArg::Terminal => LogDestination::Terminal,
            LogArg::Both => LogDestination::Both,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    sync_logging::initialize(cli.log.into(), level);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let class = fault_class(&err);
            sync_error!("{:#}", err);
            eprintln!("collection-sync: {err:#}");
            ExitCode::from(class.exit_code())
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = SyncConfig::load(&cli.config)?;
    config.validate()?;

    let mut settings = config.sync_settings();
    if cli.debug_run {
        settings.record_started = false;
    }
    let engine = SyncEngine::new(&config.base_url, settings)?;

    let mode = SyncMode::from(cli.mode);
    let mut synced = 0;
    for spec in config.selected(&cli.only) {
        let job = SyncJob::open(spec.clone(), &config.cache_root, &config.checkpoint_dir, mode);
        let report = engine
            .run(&job)
            .with_context(|| format!("collection {}", spec.name))?;
        sync_info!(
            "{}: {} records, completed at {}",
            report.collection,
            report.records,
            report.completed
        );
        synced += 1;
    }
    sync_info!("synced {} collections", synced);
    Ok(())
}

fn fault_class(err: &anyhow::Error) -> FaultClass {
    if let Some(err) = err.downcast_ref::<SyncError>() {
        return err.class();
    }
    if let Some(err) = err.downcast_ref::<EngineError>() {
        return err.fault_class();
    }
    FaultClass::Generic
}
