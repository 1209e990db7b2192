use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    error::{ErrorCategory, ReportedError},
    utils::{
        clock::Clock,
        time::{format_tracking_time, local_date, local_day_start},
    },
};

use super::{
    processing::recorder::TrackingSnapshot,
    storage::queue::QueueSnapshot,
    sync::{SyncState, SyncStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// No tracked file was active yet, usually an unsaved file.
    NoSession,
    Idle,
    Stopped,
}

/// Everything the host shows about the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerStatus {
    pub tracking: bool,
    pub pause_reason: Option<PauseReason>,
    pub project: Option<Arc<str>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub dead_lettered: usize,
    pub sync_state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<ReportedError>,
    /// Today's active time including the part since the last heartbeat.
    pub today_seconds: u64,
}

impl TrackerStatus {
    /// Short text for a status bar, e.g. `Tracking 01:02:05 • Sync 14:30:00`.
    pub fn status_line(&self) -> String {
        let tracking = match self.pause_reason {
            _ if self.tracking => format!(
                "Tracking {}",
                format_tracking_time(Duration::from_secs(self.today_seconds))
            ),
            Some(PauseReason::NoSession) => "Paused: Save file".into(),
            Some(PauseReason::Idle) => "Paused: Idle".into(),
            Some(PauseReason::Stopped) | None => "Tracking stopped".into(),
        };
        let sync = match &self.sync_state {
            SyncState::Disabled => "Sync disabled".into(),
            SyncState::Draining | SyncState::Sending => "Syncing".into(),
            SyncState::Backoff { .. } => match self.last_error.as_ref().map(|e| e.category) {
                Some(ErrorCategory::TransientNetwork) => "Sync offline".into(),
                _ => "Sync error".into(),
            },
            SyncState::Idle => match self.last_sync_at {
                Some(at) => format!("Sync {}", at.with_timezone(&Local).format("%H:%M:%S")),
                None => "Sync idle".into(),
            },
        };
        format!("{tracking} • {sync}")
    }
}

/// Read-only view combining the recorder, queue and sync engine snapshots. Cheap to clone and safe
/// to poll from any task.
#[derive(Clone)]
pub struct StatusReporter {
    tracking: watch::Receiver<TrackingSnapshot>,
    queue: watch::Receiver<QueueSnapshot>,
    sync: watch::Receiver<SyncStatus>,
    idle_timeout: TimeDelta,
    max_heartbeat: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub fn new(
        tracking: watch::Receiver<TrackingSnapshot>,
        queue: watch::Receiver<QueueSnapshot>,
        sync: watch::Receiver<SyncStatus>,
        idle_timeout: Duration,
        max_heartbeat: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracking,
            queue,
            sync,
            idle_timeout: TimeDelta::from_std(idle_timeout).unwrap_or(TimeDelta::MAX),
            max_heartbeat: TimeDelta::from_std(max_heartbeat).unwrap_or(TimeDelta::MAX),
            clock,
        }
    }

    pub fn current_state(&self) -> TrackerStatus {
        let tracking = self.tracking.borrow().clone();
        let queue = *self.queue.borrow();
        let sync = self.sync.borrow().clone();
        let now = self.clock.time();

        let pause_reason = match &tracking.session {
            _ if tracking.stopped => Some(PauseReason::Stopped),
            None => Some(PauseReason::NoSession),
            Some(session) if now - session.last_activity_at > self.idle_timeout => {
                Some(PauseReason::Idle)
            }
            Some(_) => None,
        };
        let active = pause_reason.is_none();

        let today = local_date(now);
        let mut today_seconds = match tracking.totals_date {
            Some(date) if date == today => tracking.today_seconds,
            _ => 0.,
        };
        if let Some(last) = tracking
            .session
            .as_ref()
            .and_then(|session| session.last_heartbeat_at)
            .filter(|_| active)
        {
            let from = last.max(local_day_start(now));
            today_seconds += (now - from)
                .clamp(TimeDelta::zero(), self.max_heartbeat)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
        }

        let last_error = match (tracking.last_error, sync.last_error) {
            (Some(local), Some(remote)) => Some(if local.at >= remote.at { local } else { remote }),
            (local, remote) => local.or(remote),
        };

        TrackerStatus {
            tracking: active,
            pause_reason,
            project: tracking.session.map(|session| session.project),
            last_heartbeat_at: tracking.last_heartbeat_at,
            queue_depth: queue.depth(),
            dead_lettered: queue.dead_lettered,
            sync_state: sync.state,
            last_sync_at: sync.last_success_at,
            last_error,
            today_seconds: today_seconds.max(0.) as u64,
        }
    }
}
