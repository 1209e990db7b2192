use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    error::{ErrorCategory, ReportedError, StorageError},
    tracker::{
        collection::ActivitySignal,
        storage::{
            entities::Heartbeat, queue::HeartbeatQueue, timeline::TimelineLogger,
            totals::DailyTotals,
        },
    },
    utils::{
        clock::Clock,
        time::{format_tracking_time, local_date},
    },
};

use super::{debounce::Debouncer, module::EventProcessor};

/// Span during which one file of one project is the tracked target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub project: Arc<str>,
    pub entity: Arc<str>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Last heartbeat of the session's project, possibly emitted by an earlier session.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeats: u32,
}

/// What the recorder publishes after every signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingSnapshot {
    pub session: Option<Session>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stopped: bool,
    pub totals_date: Option<NaiveDate>,
    pub today_seconds: f64,
    pub last_error: Option<ReportedError>,
}

/// Turns signals into heartbeats and writes them to the queue, the daily totals and the timeline.
pub struct HeartbeatRecorder {
    debouncer: Debouncer,
    queue: Arc<HeartbeatQueue>,
    totals: DailyTotals,
    timeline: TimelineLogger,
    idle_timeout: TimeDelta,
    clock: Box<dyn Clock>,
    session: Option<Session>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    last_error: Option<ReportedError>,
    stopped: bool,
    status: watch::Sender<TrackingSnapshot>,
}

impl HeartbeatRecorder {
    pub fn new(
        debouncer: Debouncer,
        queue: Arc<HeartbeatQueue>,
        totals: DailyTotals,
        timeline: TimelineLogger,
        idle_timeout: Duration,
        clock: Box<dyn Clock>,
    ) -> Self {
        let recorder = Self {
            debouncer,
            queue,
            totals,
            timeline,
            idle_timeout: TimeDelta::from_std(idle_timeout).unwrap_or(TimeDelta::MAX),
            clock,
            session: None,
            last_heartbeat_at: None,
            last_error: None,
            stopped: false,
            status: watch::Sender::new(TrackingSnapshot::default()),
        };
        recorder.publish();
        recorder
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackingSnapshot> {
        self.status.subscribe()
    }

    /// Handles one signal. Returns the heartbeat if one was emitted and stored in the queue. A
    /// queue failure is returned and leaves the debouncer untouched, so the next signal retries.
    /// Totals and timeline failures only degrade the status.
    pub async fn on_activity_signal(
        &mut self,
        signal: ActivitySignal,
    ) -> Result<Option<Heartbeat>, StorageError> {
        let result = self.record(signal).await;
        self.publish();
        result
    }

    async fn record(&mut self, signal: ActivitySignal) -> Result<Option<Heartbeat>, StorageError> {
        let Some(project) = signal.project.clone() else {
            debug!("Ignoring signal for untracked entity {:?}", signal.entity);
            return Ok(None);
        };
        self.track_session(&signal, &project).await;

        let Some(emission) = self.debouncer.observe(&signal) else {
            return Ok(None);
        };
        let heartbeat = emission.heartbeat;
        let now = self.clock.time();

        if let Err(e) = self.queue.enqueue(heartbeat.clone(), now).await {
            error!("Lost heartbeat {heartbeat:?}, queue write failed: {e}");
            self.degrade(&e, now);
            return Err(e);
        }
        self.debouncer.commit(&heartbeat);
        self.last_heartbeat_at = Some(heartbeat.timestamp);
        if let Some(session) = self.session.as_mut() {
            session.heartbeats += 1;
        }
        self.last_error = None;

        let date = local_date(heartbeat.timestamp);
        let added = if emission.credited.is_zero() {
            self.totals.touch(date, &project).await
        } else {
            self.totals
                .add(date, &project, emission.credited.as_secs_f64())
                .await
        };
        if let Err(e) = added {
            warn!("Failed to update daily totals: {e}");
            self.degrade(&e, now);
        }

        if let Err(e) = self.timeline.append(&heartbeat).await {
            warn!("Failed to write timeline: {e}");
            self.degrade(&e, now);
        }

        info!(
            "Recorded {} heartbeat for {} ({:.1}s credited)",
            heartbeat.kind,
            heartbeat.project,
            emission.credited.as_secs_f64()
        );
        Ok(Some(heartbeat))
    }

    async fn track_session(&mut self, signal: &ActivitySignal, project: &Arc<str>) {
        let current = self
            .session
            .as_mut()
            .filter(|session| session.project == *project && session.entity == signal.entity);
        if let Some(session) = current {
            let idle = signal.at - session.last_activity_at;
            session.last_activity_at = session.last_activity_at.max(signal.at);
            if idle > self.idle_timeout {
                let message = format!(
                    "tracking resumed after {} idle",
                    format_tracking_time(idle.to_std().unwrap_or_default())
                );
                self.log_event(&message, signal.at).await;
            }
            return;
        }

        self.end_session(signal.at).await;
        self.session = Some(Session {
            project: project.clone(),
            entity: signal.entity.clone(),
            started_at: signal.at,
            last_activity_at: signal.at,
            last_heartbeat_at: None,
            heartbeats: 0,
        });
        let message = format!("session started {project} {}", signal.entity);
        self.log_event(&message, signal.at).await;
    }

    async fn end_session(&mut self, at: DateTime<Utc>) {
        let Some(session) = self.session.take() else {
            return;
        };
        let length = (session.last_activity_at - session.started_at)
            .to_std()
            .unwrap_or_default();
        let message = format!(
            "session ended {} after {}",
            session.project,
            format_tracking_time(length)
        );
        self.log_event(&message, at).await;
    }

    async fn log_event(&mut self, message: &str, at: DateTime<Utc>) {
        if let Err(e) = self.timeline.log_event(message, at).await {
            warn!("Failed to write timeline event: {e}");
            self.degrade(&e, self.clock.time());
        }
    }

    fn degrade(&mut self, error: &StorageError, at: DateTime<Utc>) {
        self.last_error = Some(ReportedError::new(ErrorCategory::LocalStorage, error, at));
    }

    fn publish(&self) {
        let today = local_date(self.clock.time());
        let session = self.session.clone().map(|mut session| {
            session.last_heartbeat_at = self.debouncer.last_emission(&session.project);
            session
        });
        self.status.send_replace(TrackingSnapshot {
            session,
            last_heartbeat_at: self.last_heartbeat_at,
            stopped: self.stopped,
            totals_date: Some(today),
            today_seconds: self.totals.day_total(today),
            last_error: self.last_error.clone(),
        });
    }
}

impl EventProcessor for HeartbeatRecorder {
    async fn process_next(&mut self, signal: ActivitySignal) -> Result<()> {
        self.on_activity_signal(signal).await?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        let now = self.clock.time();
        self.end_session(now).await;
        self.log_event("tracking stopped", now).await;
        self.stopped = true;
        self.publish();
        Ok(())
    }
}
