//! Background delivery of queued heartbeats.
//!
//! A cycle peeks the oldest entries, sends them as one request and settles the outcome with the
//! queue. Only one cycle runs at a time, a cycle requested while another one is running is
//! skipped. Failures push the next cycle back exponentially, any accepted heartbeat resets it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{futures::Notified, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    error::{ConfigError, ErrorCategory, ReportedError, StorageError, SyncError},
    tracker::storage::{entities::EntryId, queue::HeartbeatQueue},
    utils::clock::Clock,
};

use api::{BatchReceipt, HeartbeatApi, ItemResult};
use backoff::Backoff;

pub mod api;
pub mod backoff;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Draining,
    Sending,
    Backoff {
        failures: u32,
        #[serde(rename = "retry_in_seconds", serialize_with = "as_seconds")]
        retry_in: Duration,
    },
    Disabled,
}

fn as_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<ReportedError>,
    pub consecutive_failures: u32,
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was pending, no request was made.
    Empty,
    Delivered {
        accepted: usize,
        rejected: usize,
        dead_lettered: usize,
    },
    Failed,
    /// Another cycle was already running.
    Coalesced,
    Disabled,
}

/// Wakes a waiting engine right away, skipping any backoff delay.
#[derive(Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    /// Has no effect while a cycle is running, that cycle or the next one picks up new entries.
    pub fn force(&self) {
        self.notify.notify_waiters();
    }

    /// Completes on the next [SyncTrigger::force] issued after this call.
    pub fn forced(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub max_batch_size: usize,
    pub request_timeout: Duration,
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.sync_interval(),
            max_backoff: config.max_backoff(),
            max_batch_size: config.max_batch_size,
            request_timeout: config.request_timeout(),
        }
    }
}

pub struct SyncEngine {
    queue: Arc<HeartbeatQueue>,
    api: Result<Box<dyn HeartbeatApi>, ConfigError>,
    settings: SyncSettings,
    /// Held for the duration of a cycle.
    cycle: Mutex<Backoff>,
    trigger: SyncTrigger,
    clock: Box<dyn Clock>,
    status: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    /// `api` is the configuration error when no remote can be used, sync then stays disabled.
    pub fn new(
        queue: Arc<HeartbeatQueue>,
        api: Result<Box<dyn HeartbeatApi>, ConfigError>,
        settings: SyncSettings,
        clock: Box<dyn Clock>,
    ) -> Self {
        let status = match &api {
            Ok(_) => SyncStatus::default(),
            Err(e) => {
                warn!("Sync is disabled: {e}");
                SyncStatus {
                    state: SyncState::Disabled,
                    last_error: Some(ReportedError::new(ErrorCategory::Config, e, clock.time())),
                    ..Default::default()
                }
            }
        };
        Self {
            queue,
            api,
            cycle: Mutex::new(Backoff::new(settings.interval, settings.max_backoff)),
            settings,
            trigger: SyncTrigger::default(),
            clock,
            status: watch::Sender::new(status),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Runs cycles until `shutdown` is cancelled, then makes one last bounded attempt. The first
    /// cycle starts immediately so entries restored from disk go out first.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.api.is_err() {
            shutdown.cancelled().await;
            return;
        }

        let mut next_cycle = self.clock.instant();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.clock.sleep_until(next_cycle) => {}
                _ = self.trigger.forced() => debug!("Sync forced"),
            }

            let outcome = self.run_cycle().await;
            debug!("Sync cycle finished with {outcome:?}");
            next_cycle = self.clock.instant() + self.next_delay();
        }

        self.final_sync().await;
    }

    /// One best effort cycle bounded by the request timeout.
    pub async fn final_sync(&self) -> CycleOutcome {
        if self.api.is_err() {
            return CycleOutcome::Disabled;
        }
        info!("Running final sync");
        match tokio::time::timeout(self.settings.request_timeout, self.run_cycle()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Final sync did not finish in time");
                CycleOutcome::Failed
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(mut backoff) = self.cycle.try_lock() else {
            debug!("Sync cycle already running, skipping");
            return CycleOutcome::Coalesced;
        };
        let api = match &self.api {
            Ok(api) => api,
            Err(_) => return CycleOutcome::Disabled,
        };
        self.cycle_inner(&**api, &mut backoff)
            .instrument(info_span!("Sync cycle"))
            .await
    }

    async fn cycle_inner(&self, api: &dyn HeartbeatApi, backoff: &mut Backoff) -> CycleOutcome {
        self.set_state(SyncState::Draining);
        let batch = self.queue.peek_batch(self.settings.max_batch_size).await;
        if batch.is_empty() {
            backoff.reset();
            self.status.send_modify(|status| {
                status.state = SyncState::Idle;
                status.consecutive_failures = 0;
            });
            return CycleOutcome::Empty;
        }

        self.set_state(SyncState::Sending);
        let ids = batch.iter().map(|entry| entry.id).collect::<Vec<_>>();
        let heartbeats = batch.into_iter().map(|entry| entry.heartbeat).collect();
        info!("Sending {} heartbeats", ids.len());

        let sent = tokio::time::timeout(self.settings.request_timeout, api.send_batch(heartbeats))
            .await
            .unwrap_or(Err(SyncError::Timeout));

        let settled = match sent {
            Ok(receipt) => self.settle(receipt, &ids).await,
            Err(e) => Err(self.record_failure(e, &ids).await),
        };

        match settled {
            Ok(outcome @ CycleOutcome::Delivered { accepted, .. }) if accepted > 0 => {
                backoff.reset();
                let now = self.clock.time();
                self.status.send_modify(|status| {
                    status.state = SyncState::Idle;
                    status.last_success_at = Some(now);
                    status.consecutive_failures = 0;
                });
                outcome
            }
            Ok(outcome) => {
                self.back_off(backoff);
                outcome
            }
            Err(e) => {
                let reported = ReportedError::from((&e, self.clock.time()));
                self.status
                    .send_modify(|status| status.last_error = Some(reported));
                self.back_off(backoff);
                CycleOutcome::Failed
            }
        }
    }

    /// Applies a successful response. Rejected items are counted as failed, the rest delivered.
    async fn settle(
        &self,
        receipt: BatchReceipt,
        ids: &[EntryId],
    ) -> Result<CycleOutcome, SyncError> {
        let results = match receipt {
            BatchReceipt::AllAccepted => vec![ItemResult::Accepted; ids.len()],
            BatchReceipt::PerItem(results) => results,
        };

        let mut accepted = vec![];
        let mut rejected = vec![];
        let mut rejection = None;
        for (id, result) in ids.iter().zip(results) {
            match result {
                ItemResult::Accepted => accepted.push(*id),
                ItemResult::Rejected { status, message } => {
                    warn!("Heartbeat {id} rejected with {status}: {message}");
                    rejected.push(*id);
                    rejection.get_or_insert(SyncError::InvalidPayload { status, message });
                }
            }
        }

        let delivered = self.queue.mark_delivered(&accepted).await;
        let failed = self.queue.mark_failed(&rejected).await;
        delivered?;
        let dead_lettered = failed?;

        let now = self.clock.time();
        let last_error = rejection.map(|e| ReportedError::from((&e, now)));
        self.status.send_modify(|status| status.last_error = last_error);

        info!(
            "Delivered {} heartbeats, {} rejected",
            accepted.len(),
            rejected.len()
        );
        Ok(CycleOutcome::Delivered {
            accepted: accepted.len(),
            rejected: rejected.len(),
            dead_lettered: dead_lettered.len(),
        })
    }

    async fn record_failure(&self, error: SyncError, ids: &[EntryId]) -> SyncError {
        warn!("Sync request failed: {error}");
        let marked: Result<(), StorageError> = if error.is_rejection() {
            self.queue.mark_failed(ids).await.map(|_| ())
        } else {
            self.queue.mark_unreachable(ids).await
        };
        match marked {
            Ok(()) => error,
            Err(e) => {
                error!("Failed to record sync failure in the queue: {e}");
                e.into()
            }
        }
    }

    fn back_off(&self, backoff: &mut Backoff) {
        let retry_in = backoff.register_failure();
        let failures = backoff.failures();
        self.status.send_modify(|status| {
            status.state = SyncState::Backoff { failures, retry_in };
            status.consecutive_failures = failures;
        });
    }

    fn next_delay(&self) -> Duration {
        match &self.status.borrow().state {
            SyncState::Backoff { retry_in, .. } => *retry_in,
            _ => self.settings.interval,
        }
    }

    fn set_state(&self, state: SyncState) {
        self.status.send_modify(|status| status.state = state);
    }
}
