//! One-shot commands working on the files of the application directory.

use std::{path::Path, sync::Arc, time::Duration};

use ansi_term::Colour::{Green, Red, Yellow};
use anyhow::Result;
use chrono::Local;

use crate::{
    config::Config,
    tracker::{
        storage::{
            entities::QueueEntry,
            queue::HeartbeatQueue,
            timeline::TimelineLogger,
            totals::{DailyTotals, TOTALS_FILE_NAME},
            QUEUE_DIR, TIMELINE_DIR,
        },
        sync::{CycleOutcome, SyncEngine, SyncSettings},
    },
    utils::{
        clock::{Clock, DefaultClock},
        time::{format_tracking_time, local_date},
    },
};

use super::create_api;

/// Drains the queue with as many cycles as it takes. Stops at the first cycle that delivers
/// nothing.
pub async fn sync_now(dir: &Path, config: &Config) -> Result<()> {
    let api = create_api(config)?;
    let queue = Arc::new(HeartbeatQueue::load(&dir.join(QUEUE_DIR), config.max_sync_attempts).await?);
    let engine = SyncEngine::new(
        queue.clone(),
        Ok(api),
        SyncSettings::from(config),
        Box::new(DefaultClock),
    );

    let (mut accepted, mut rejected, mut dead_lettered) = (0, 0, 0);
    let mut failed = false;
    loop {
        match engine.run_cycle().await {
            CycleOutcome::Delivered {
                accepted: cycle_accepted,
                rejected: cycle_rejected,
                dead_lettered: cycle_dead,
            } => {
                accepted += cycle_accepted;
                rejected += cycle_rejected;
                dead_lettered += cycle_dead;
                if cycle_accepted == 0 {
                    break;
                }
            }
            CycleOutcome::Failed => {
                failed = true;
                break;
            }
            CycleOutcome::Empty | CycleOutcome::Coalesced | CycleOutcome::Disabled => break,
        }
    }

    println!("{}", Green.paint(format!("Sent {accepted} heartbeats")));
    if rejected > 0 {
        println!(
            "{}",
            Yellow.paint(format!(
                "{rejected} rejected, {dead_lettered} of them gave up on"
            ))
        );
    }
    if failed {
        let reason = engine
            .subscribe()
            .borrow()
            .last_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        println!("{}", Red.paint(format!("Sync failed: {reason}")));
    }
    println!("{} heartbeats left in the queue", queue.snapshot().depth());
    Ok(())
}

pub async fn print_queue(dir: &Path, config: &Config, dead: bool) -> Result<()> {
    let queue = HeartbeatQueue::load(&dir.join(QUEUE_DIR), config.max_sync_attempts).await?;
    let entries = queue
        .entries()
        .await
        .into_iter()
        .filter(|entry| !dead || entry.is_dead_lettered())
        .collect::<Vec<_>>();
    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for entry in entries {
        let line = format_entry(&entry);
        if entry.is_dead_lettered() {
            println!("{}", Red.paint(line));
        } else {
            println!("{line}");
        }
    }
    Ok(())
}

fn format_entry(entry: &QueueEntry) -> String {
    let heartbeat = &entry.heartbeat;
    format!(
        "{}\t{}\t{}\t{} attempts\t{}\t{}",
        entry.id,
        heartbeat
            .timestamp
            .with_timezone(&Local)
            .format("%x %H:%M:%S"),
        heartbeat.kind,
        entry.attempt_count,
        heartbeat.project,
        heartbeat.entity
    )
}

pub fn print_today(dir: &Path, config: &Config) -> Result<()> {
    let today = local_date(DefaultClock.time());
    let totals = DailyTotals::load(&dir.join(TOTALS_FILE_NAME), config.totals_retention_days);

    let mut projects = totals.day(today).into_iter().collect::<Vec<_>>();
    projects.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (project, seconds) in projects {
        println!("{}\t{project}", format_seconds(seconds));
    }
    println!("{}\tTotal", format_seconds(totals.day_total(today)));
    Ok(())
}

fn format_seconds(seconds: f64) -> String {
    format_tracking_time(Duration::from_secs(seconds.max(0.) as u64))
}

pub async fn print_timeline(dir: &Path, print: bool) -> Result<()> {
    let timeline = TimelineLogger::new(dir.join(TIMELINE_DIR))?;
    let Some(path) = timeline.latest_log_path(DefaultClock.time()) else {
        println!("No activity today");
        return Ok(());
    };
    if print {
        print!("{}", tokio::fs::read_to_string(&path).await?);
    } else {
        println!("{}", path.display());
    }
    Ok(())
}
