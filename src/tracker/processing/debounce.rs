use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    tracker::{
        collection::ActivitySignal,
        storage::entities::{ActivityKind, Heartbeat},
    },
    utils::time::local_day_start,
};

/// A heartbeat the debouncer wants to emit, with the active time it adds to the daily total.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub heartbeat: Heartbeat,
    pub credited: Duration,
}

/// Decides which signals become heartbeats. Emission is two phase: [Debouncer::observe] proposes,
/// [Debouncer::commit] records it once the heartbeat is safely stored. A proposal that is never
/// committed is simply proposed again on the next signal.
pub struct Debouncer {
    interval: TimeDelta,
    max_heartbeat: TimeDelta,
    by_entity: HashMap<(Arc<str>, Arc<str>), DateTime<Utc>>,
    by_project: HashMap<Arc<str>, DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(interval: Duration, max_heartbeat: Duration) -> Self {
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            max_heartbeat: TimeDelta::from_std(max_heartbeat).unwrap_or(TimeDelta::MAX),
            by_entity: HashMap::new(),
            by_project: HashMap::new(),
        }
    }

    pub fn observe(&self, signal: &ActivitySignal) -> Option<Emission> {
        let project = signal.project.as_ref()?;

        if signal.kind != ActivityKind::Save {
            let key = (project.clone(), signal.entity.clone());
            if let Some(last) = self.by_entity.get(&key) {
                if signal.at - *last < self.interval {
                    return None;
                }
            }
        }

        let previous = self.by_project.get(project).copied();
        let timestamp = match previous {
            Some(previous) if signal.at <= previous => previous + TimeDelta::milliseconds(1),
            _ => signal.at,
        };

        let credited = previous
            .map(|previous| {
                let from = previous.max(local_day_start(timestamp));
                (timestamp - from).clamp(TimeDelta::zero(), self.max_heartbeat)
            })
            .and_then(|delta| delta.to_std().ok())
            .unwrap_or_default();

        Some(Emission {
            heartbeat: Heartbeat::new(signal.kind, signal.entity.clone(), project.clone(), timestamp),
            credited,
        })
    }

    pub fn commit(&mut self, heartbeat: &Heartbeat) {
        self.by_entity.insert(
            (heartbeat.project.clone(), heartbeat.entity.clone()),
            heartbeat.timestamp,
        );
        self.by_project
            .insert(heartbeat.project.clone(), heartbeat.timestamp);
    }

    /// Last committed heartbeat of `project`.
    pub fn last_emission(&self, project: &str) -> Option<DateTime<Utc>> {
        self.by_project.get(project).copied()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(120);

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 7, 4, 12, 0, 0).unwrap()
    }

    fn signal(kind: ActivityKind, project: &str, entity: &str, seconds: i64) -> ActivitySignal {
        ActivitySignal {
            kind,
            entity: entity.into(),
            project: Some(project.into()),
            at: start() + TimeDelta::seconds(seconds),
        }
    }

    fn feed(debouncer: &mut Debouncer, signal: ActivitySignal) -> Option<Emission> {
        let emission = debouncer.observe(&signal)?;
        debouncer.commit(&emission.heartbeat);
        Some(emission)
    }

    #[test]
    fn edit_then_save_within_interval() {
        let mut debouncer = Debouncer::new(INTERVAL, INTERVAL);

        let first = feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "foo.blend", 0))
            .expect("first signal emits");
        assert_eq!(first.credited, Duration::ZERO);

        assert!(feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "foo.blend", 30)).is_none());

        let save = feed(&mut debouncer, signal(ActivityKind::Save, "foo", "foo.blend", 45))
            .expect("save always emits");
        assert!(save.heartbeat.is_write);
        assert_eq!(save.credited, Duration::from_secs(45));
        assert!(save.credited <= INTERVAL);
    }

    #[test]
    fn no_two_edits_within_interval() {
        let mut debouncer = Debouncer::new(INTERVAL, INTERVAL);
        let mut emitted = vec![];
        for seconds in (0..1000).step_by(7) {
            if let Some(emission) =
                feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "foo.blend", seconds))
            {
                emitted.push(emission.heartbeat.timestamp);
            }
        }
        assert!(emitted.len() > 1);
        for pair in emitted.windows(2) {
            assert!(pair[1] - pair[0] >= TimeDelta::seconds(120));
        }
    }

    #[test]
    fn uncommitted_emission_is_proposed_again() {
        let mut debouncer = Debouncer::new(INTERVAL, INTERVAL);
        let lost = signal(ActivityKind::Edit, "foo", "foo.blend", 0);
        assert!(debouncer.observe(&lost).is_some());
        assert!(feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "foo.blend", 10)).is_some());
        assert_eq!(debouncer.last_emission("foo"), Some(start() + TimeDelta::seconds(10)));
    }

    #[test]
    fn credited_time_is_capped() {
        let mut debouncer = Debouncer::new(INTERVAL, Duration::from_secs(60));
        feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "foo.blend", 0));
        let emission = feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "foo.blend", 3600))
            .expect("interval elapsed");
        assert_eq!(emission.credited, Duration::from_secs(60));
    }

    #[test]
    fn projects_are_independent() {
        let mut debouncer = Debouncer::new(INTERVAL, INTERVAL);
        assert!(feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "a.blend", 0)).is_some());
        let bar = feed(&mut debouncer, signal(ActivityKind::Edit, "bar", "a.blend", 10))
            .expect("other project emits");
        assert_eq!(bar.credited, Duration::ZERO);
        let foo = feed(&mut debouncer, signal(ActivityKind::Edit, "foo", "b.blend", 20))
            .expect("other entity emits");
        assert_eq!(foo.credited, Duration::from_secs(20));
    }

    #[test]
    fn timestamps_strictly_increase_per_project() {
        let mut debouncer = Debouncer::new(INTERVAL, INTERVAL);
        let first = feed(&mut debouncer, signal(ActivityKind::Save, "foo", "a.blend", 10))
            .expect("save emits");
        let second = feed(&mut debouncer, signal(ActivityKind::Save, "foo", "a.blend", 5))
            .expect("save emits");
        assert!(second.heartbeat.timestamp > first.heartbeat.timestamp);
        assert_eq!(second.credited, Duration::from_millis(1));
    }

    #[test]
    fn signals_without_project_are_ignored() {
        let debouncer = Debouncer::new(INTERVAL, INTERVAL);
        let mut untracked = signal(ActivityKind::Save, "foo", "a.blend", 0);
        untracked.project = None;
        assert!(debouncer.observe(&untracked).is_none());
    }
}
