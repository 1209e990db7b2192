use std::{path::Path, time::Duration};

use anyhow::Result;
use serde::Serialize;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    config::Config,
    tracker::{
        collection::stdin::SignalReader,
        shutdown::detect_shutdown,
        status::{StatusReporter, TrackerStatus},
        Tracker,
    },
    utils::clock::DefaultClock,
};

use super::create_api;

/// One status line on stdout: every status field plus the short text for a status bar.
#[derive(Serialize)]
struct StatusOutput<'a> {
    #[serde(flatten)]
    status: &'a TrackerStatus,
    text: String,
}

pub async fn run_tracker(dir: &Path, config: Config, status_interval: Duration) -> Result<()> {
    let api = create_api(&config);
    if let Err(e) = &api {
        warn!("Syncing is disabled: {e}");
    }
    let (tracker, notifier) = Tracker::open(dir, &config, api, DefaultClock).await?;
    let reporter = tracker.status_reporter();
    let shutdown = CancellationToken::new();

    let reader = SignalReader::new(
        BufReader::new(tokio::io::stdin()),
        notifier,
        tracker.sync_trigger(),
        shutdown.clone(),
        config.project_tag.clone(),
        Box::new(DefaultClock),
    );

    let (reader_result, tracker_result, _, _) = tokio::join!(
        reader.run(),
        async {
            let result = tracker.run().await;
            shutdown.cancel();
            result
        },
        detect_shutdown(shutdown.clone()),
        print_status(reporter.clone(), status_interval, shutdown.clone()),
    );

    if let Err(e) = &reader_result {
        error!("Signal input failed {e:?}");
    }
    write_status(&reporter.current_state());
    tracker_result?;
    reader_result
}

async fn print_status(reporter: StatusReporter, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => write_status(&reporter.current_state()),
        }
    }
}

fn write_status(status: &TrackerStatus) {
    let output = StatusOutput {
        status,
        text: status.status_line(),
    };
    match serde_json::to_string(&output) {
        Ok(line) => println!("{line}"),
        Err(e) => error!("Failed to encode status {e}"),
    }
}
