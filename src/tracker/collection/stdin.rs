use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    tracker::{
        storage::entities::{fractional_seconds, ActivityKind},
        sync::SyncTrigger,
    },
    utils::clock::Clock,
};

use super::{derive_project_name, ActivityNotifier, ActivitySignal};

/// One line of host input. Either a request like `{"kind":"sync"}` or an activity signal.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostLine {
    Request { kind: Request },
    Signal(SignalLine),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Request {
    /// Deliver the queue now instead of waiting for the interval or backoff.
    Sync,
}

/// Activity signal, e.g. `{"kind":"save","entity":"/work/scene.blend","time":1712.5}`.
#[derive(Debug, Deserialize)]
struct SignalLine {
    kind: ActivityKind,
    entity: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    time: Option<f64>,
}

/// Host adapter reading JSON-line signals. Closing the input stops the whole tracker.
pub struct SignalReader<R> {
    input: R,
    notifier: ActivityNotifier,
    sync: SyncTrigger,
    shutdown: CancellationToken,
    project_tag: Option<String>,
    clock: Box<dyn Clock>,
}

impl<R: AsyncBufRead + Unpin> SignalReader<R> {
    pub fn new(
        input: R,
        notifier: ActivityNotifier,
        sync: SyncTrigger,
        shutdown: CancellationToken,
        project_tag: Option<String>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            input,
            notifier,
            sync,
            shutdown,
            project_tag,
            clock,
        }
    }

    /// Forwards signals until the input ends or shutdown is requested. Dropping the reader drops
    /// the notifier, which lets the processing module finish.
    pub async fn run(self) -> Result<()> {
        let mut lines = self.input.lines();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!("Signal input closed, stopping");
                self.shutdown.cancel();
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_line(&line, self.project_tag.as_deref(), self.clock.time()) {
                Ok(Input::Request(Request::Sync)) => {
                    debug!("Sync requested by host");
                    self.sync.force();
                }
                Ok(Input::Signal(signal)) => {
                    debug!("Received signal {signal:?}");
                    if !self.notifier.notify(
                        signal.kind,
                        signal.entity,
                        signal.project,
                        signal.at,
                    ) {
                        return Ok(());
                    }
                }
                Err(e) => warn!("Ignoring malformed signal {line:?}: {e}"),
            }
        }
    }
}

enum Input {
    Request(Request),
    Signal(ActivitySignal),
}

fn parse_line(line: &str, tag: Option<&str>, now: DateTime<Utc>) -> Result<Input> {
    let parsed = match serde_json::from_str::<HostLine>(line)? {
        HostLine::Request { kind } => return Ok(Input::Request(kind)),
        HostLine::Signal(parsed) => parsed,
    };
    let at = match parsed.time {
        Some(seconds) => fractional_seconds::from_f64(seconds)
            .ok_or_else(|| anyhow!("invalid time {seconds}"))?,
        None => now,
    };
    let project = match parsed.project.as_deref().map(str::trim) {
        Some(project) if !project.is_empty() => Some(project.into()),
        _ => derive_project_name(&parsed.entity, tag),
    };
    Ok(Input::Signal(ActivitySignal {
        kind: parsed.kind,
        entity: parsed.entity.into(),
        project,
        at,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    use crate::utils::clock::TestClock;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 7, 4, 12, 0, 0).unwrap()
    }

    fn signal_of(line: &str, tag: Option<&str>) -> Result<ActivitySignal> {
        match parse_line(line, tag, now())? {
            Input::Signal(signal) => Ok(signal),
            Input::Request(request) => Err(anyhow!("expected a signal, got {request:?}")),
        }
    }

    #[test]
    fn signal_lines_are_parsed() -> Result<()> {
        let signal = signal_of(r#"{"kind":"edit","entity":"/w/scene.blend"}"#, None)?;
        assert_eq!(signal.kind, ActivityKind::Edit);
        assert_eq!(signal.project.as_deref(), Some("scene"));
        assert_eq!(signal.at, now());

        let signal = signal_of(
            r#"{"kind":"save","entity":"/w/scene.blend","project":"film","time":1530705600.5}"#,
            Some("blender"),
        )?;
        assert_eq!(signal.project.as_deref(), Some("film"));
        assert_eq!(signal.at.timestamp_millis(), 1_530_705_600_500);

        let signal = signal_of(r#"{"kind":"view","entity":""}"#, None)?;
        assert_eq!(signal.project, None);

        assert!(parse_line(r#"{"kind":"jump","entity":"a"}"#, None, now()).is_err());
        assert!(parse_line(r#"{"kind":"edit"}"#, None, now()).is_err());
        assert!(parse_line("not json", None, now()).is_err());
        Ok(())
    }

    #[test]
    fn sync_request_is_parsed() -> Result<()> {
        assert!(matches!(
            parse_line(r#"{"kind":"sync"}"#, None, now())?,
            Input::Request(Request::Sync)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn reader_stops_on_end_of_input() -> Result<()> {
        let input: &[u8] = b"{\"kind\":\"edit\",\"entity\":\"a.blend\"}\n\ngarbage\n{\"kind\":\"save\",\"entity\":\"a.blend\"}\n";
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        SignalReader::new(
            input,
            ActivityNotifier::new(sender),
            SyncTrigger::default(),
            shutdown.clone(),
            None,
            Box::new(TestClock::starting_at(now())),
        )
        .run()
        .await?;

        assert!(shutdown.is_cancelled());
        let mut kinds = vec![];
        while let Some(signal) = receiver.recv().await {
            kinds.push(signal.kind);
        }
        assert_eq!(kinds, vec![ActivityKind::Edit, ActivityKind::Save]);
        Ok(())
    }

    #[tokio::test]
    async fn sync_request_forces_sync() -> Result<()> {
        let input: &[u8] = b"{\"kind\":\"sync\"}\n";
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let trigger = SyncTrigger::default();
        let forced = trigger.forced();

        SignalReader::new(
            input,
            ActivityNotifier::new(sender),
            trigger.clone(),
            CancellationToken::new(),
            None,
            Box::new(TestClock::starting_at(now())),
        )
        .run()
        .await?;

        assert!(tokio::time::timeout(Duration::from_secs(1), forced)
            .await
            .is_ok());
        assert!(receiver.recv().await.is_none());
        Ok(())
    }
}
