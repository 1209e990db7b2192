pub mod inspect;
pub mod run;

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::Config,
    error::ConfigError,
    tracker::sync::api::{HeartbeatApi, HttpHeartbeatApi},
    utils::{
        dir::{create_application_default_path, ensure_dir},
        logging::{enable_logging, LOG_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "beatkeeper", version, long_about = None)]
#[command(about = "Captures activity heartbeats and syncs them to a time tracking service", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Mirror logs to stderr with the most verbose level")]
    log: bool,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(
        about = "Start tracking. Reads JSON signals like {\"kind\":\"edit\",\"entity\":\"/work/scene.blend\"} from stdin and prints status lines to stdout. {\"kind\":\"sync\"} delivers the queue right away"
    )]
    Run {
        #[arg(long, default_value_t = 5, help = "Seconds between status lines")]
        status_interval: u64,
    },
    #[command(about = "Send everything pending in the queue right now. Refused while `run` uses the same directory")]
    Sync {},
    #[command(about = "List heartbeats waiting for delivery")]
    Queue {
        #[arg(long, help = "Only show heartbeats that were given up on")]
        dead: bool,
    },
    #[command(about = "Show time tracked today per project")]
    Today {},
    #[command(about = "Show where today's timeline is written")]
    Timeline {
        #[arg(long, help = "Print the timeline instead of its path")]
        print: bool,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = match args.dir {
        Some(dir) => ensure_dir(dir)?,
        None => create_application_default_path()?,
    };
    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(LOG_PREFIX, &dir, logging_level, args.log)?;

    let config = Config::load(&dir)?;

    match args.commands {
        Commands::Run { status_interval } => {
            run::run_tracker(&dir, config, Duration::from_secs(status_interval.max(1))).await
        }
        Commands::Sync {} => inspect::sync_now(&dir, &config).await,
        Commands::Queue { dead } => inspect::print_queue(&dir, &config, dead).await,
        Commands::Today {} => inspect::print_today(&dir, &config),
        Commands::Timeline { print } => inspect::print_timeline(&dir, print).await,
    }
}

/// Remote client for the configured service. Without an api key the tracker still records
/// locally and syncing stays disabled.
fn create_api(config: &Config) -> Result<Box<dyn HeartbeatApi>, ConfigError> {
    HttpHeartbeatApi::new(config).map(|api| Box::new(api) as Box<dyn HeartbeatApi>)
}
