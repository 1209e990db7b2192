use std::{path::Path, sync::Arc};

use anyhow::Result;
use collection::{ActivityNotifier, ActivitySignal};
use processing::{debounce::Debouncer, recorder::HeartbeatRecorder, ProcessingModule};
use status::StatusReporter;
use storage::{
    queue::HeartbeatQueue,
    timeline::TimelineLogger,
    totals::{DailyTotals, TOTALS_FILE_NAME},
    QUEUE_DIR, TIMELINE_DIR,
};
use sync::{api::HeartbeatApi, SyncEngine, SyncSettings, SyncTrigger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{config::Config, error::ConfigError, utils::clock::Clock};

pub mod collection;
pub mod processing;
pub mod shutdown;
pub mod status;
pub mod storage;
pub mod sync;

/// The heartbeat pipeline: signals flow through the recorder into the queue, the sync engine
/// drains the queue in the background.
pub struct Tracker {
    queue: Arc<HeartbeatQueue>,
    processor: ProcessingModule<HeartbeatRecorder>,
    engine: SyncEngine,
    status: StatusReporter,
}

impl Tracker {
    /// Restores persisted state from `dir`. The queue is fully loaded before this returns, so the
    /// first sync cycle sees every entry left by a previous run.
    pub async fn open(
        dir: &Path,
        config: &Config,
        api: Result<Box<dyn HeartbeatApi>, ConfigError>,
        clock: impl Clock + Clone,
    ) -> Result<(Self, ActivityNotifier)> {
        let (sender, receiver) = mpsc::unbounded_channel::<ActivitySignal>();

        let queue = Arc::new(
            HeartbeatQueue::load(&dir.join(QUEUE_DIR), config.max_sync_attempts).await?,
        );
        let recorder = HeartbeatRecorder::new(
            Debouncer::new(config.debounce_interval(), config.max_heartbeat()),
            queue.clone(),
            DailyTotals::load(&dir.join(TOTALS_FILE_NAME), config.totals_retention_days),
            TimelineLogger::new(dir.join(TIMELINE_DIR))?,
            config.idle_timeout(),
            Box::new(clock.clone()),
        );
        let engine = SyncEngine::new(
            queue.clone(),
            api,
            SyncSettings::from(config),
            Box::new(clock.clone()),
        );
        let status = StatusReporter::new(
            recorder.subscribe(),
            queue.subscribe(),
            engine.subscribe(),
            config.idle_timeout(),
            config.max_heartbeat(),
            Arc::new(clock),
        );

        let tracker = Self {
            queue,
            processor: ProcessingModule::new(receiver, recorder),
            engine,
            status,
        };
        Ok((tracker, ActivityNotifier::new(sender)))
    }

    pub fn status_reporter(&self) -> StatusReporter {
        self.status.clone()
    }

    pub fn sync_trigger(&self) -> SyncTrigger {
        self.engine.trigger()
    }

    pub fn queue(&self) -> Arc<HeartbeatQueue> {
        self.queue.clone()
    }

    /// Runs until every [ActivityNotifier] is dropped. Signals still in flight are recorded, then
    /// the sync engine stops with a final bounded sync.
    pub async fn run(self) -> Result<()> {
        let Self {
            queue,
            processor,
            engine,
            ..
        } = self;
        let engine_shutdown = CancellationToken::new();

        let (processing_result, _) = tokio::join!(
            async {
                let result = processor.run().await;
                engine_shutdown.cancel();
                result
            },
            engine.run(engine_shutdown.clone()),
        );

        if let Err(processing_result) = &processing_result {
            error!("Processing module got an error {:?}", processing_result);
        }
        info!(
            "Tracker stopped, {} heartbeats left in the queue",
            queue.snapshot().depth()
        );
        processing_result
    }
}

#[cfg(test)]
mod tracker_tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::Result;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        tracker::{
            status::PauseReason,
            storage::entities::ActivityKind,
            sync::api::{BatchReceipt, MockHeartbeatApi},
        },
        utils::{
            clock::{Clock, TestClock},
            logging::TEST_LOGGING,
            time::local_date,
        },
    };

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 7, 4, 12, 0, 0).unwrap()
    }

    /// Smoke test of the whole pipeline: a host sends an edit, a too early edit and a save, then
    /// goes away. Both heartbeats must reach the remote and the local records.
    #[tokio::test(start_paused = true)]
    async fn smoke_test_tracker() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let clock = TestClock::starting_at(start());

        let sent = Arc::new(AtomicUsize::new(0));
        let mut api = MockHeartbeatApi::new();
        let counter = sent.clone();
        api.expect_send_batch().returning(move |batch| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(BatchReceipt::AllAccepted)
        });

        let (tracker, notifier) =
            Tracker::open(dir.path(), &Config::default(), Ok(Box::new(api)), clock.clone())
                .await?;
        let reporter = tracker.status_reporter();
        let queue = tracker.queue();

        let (run_result, tracking_while_active) = tokio::join!(tracker.run(), async {
            let project = Some(Arc::<str>::from("scene"));
            notifier.notify(ActivityKind::Edit, "/w/scene.blend", project.clone(), clock.time());
            tokio::time::sleep(Duration::from_secs(30)).await;
            notifier.notify(ActivityKind::Edit, "/w/scene.blend", project.clone(), clock.time());
            tokio::time::sleep(Duration::from_secs(15)).await;
            notifier.notify(ActivityKind::Save, "/w/scene.blend", project, clock.time());
            tokio::time::sleep(Duration::from_secs(1)).await;
            let tracking = reporter.current_state().tracking;
            drop(notifier);
            tracking
        });
        run_result?;

        assert!(tracking_while_active);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert_eq!(queue.snapshot().depth(), 0);

        let status = reporter.current_state();
        assert_eq!(status.pause_reason, Some(PauseReason::Stopped));
        assert_eq!(status.queue_depth, 0);
        assert!(status.last_sync_at.is_some());
        assert!(status.last_error.is_none());

        let totals = DailyTotals::load(&dir.path().join(TOTALS_FILE_NAME), 31);
        assert_eq!(
            totals.get(local_date(start()), "scene"),
            45.
        );
        assert_eq!(std::fs::read_dir(dir.path().join(TIMELINE_DIR))?.count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn queue_survives_restart_without_api_key() -> Result<()> {
        let dir = tempdir()?;
        let clock = TestClock::starting_at(start());

        let (tracker, notifier) = Tracker::open(
            dir.path(),
            &Config::default(),
            Err(ConfigError::MissingApiKey),
            clock.clone(),
        )
        .await?;
        let reporter = tracker.status_reporter();
        notifier.notify(
            ActivityKind::Save,
            "/w/scene.blend",
            Some("scene".into()),
            clock.time(),
        );
        drop(notifier);
        tracker.run().await?;
        assert_eq!(reporter.current_state().queue_depth, 1);
        assert!(reporter.current_state().status_line().ends_with("Sync disabled"));

        let (tracker, _notifier) = Tracker::open(
            dir.path(),
            &Config::default(),
            Err(ConfigError::MissingApiKey),
            clock,
        )
        .await?;
        let entries = tracker.queue().entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(&*entries[0].heartbeat.project, "scene");
        assert!(entries[0].heartbeat.is_write);
        Ok(())
    }

    #[tokio::test]
    async fn second_tracker_on_same_dir_is_refused() -> Result<()> {
        let dir = tempdir()?;
        let clock = TestClock::starting_at(start());
        let (_tracker, _notifier) = Tracker::open(
            dir.path(),
            &Config::default(),
            Err(ConfigError::MissingApiKey),
            clock.clone(),
        )
        .await?;

        let second = Tracker::open(
            dir.path(),
            &Config::default(),
            Err(ConfigError::MissingApiKey),
            clock,
        )
        .await;
        assert!(second.is_err());
        Ok(())
    }
}
