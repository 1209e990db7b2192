use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use super::storage::entities::ActivityKind;

pub mod stdin;

/// Raw activity reported by the host. Signals without a project belong to untracked files.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySignal {
    pub kind: ActivityKind,
    pub entity: Arc<str>,
    pub project: Option<Arc<str>>,
    pub at: DateTime<Utc>,
}

/// The only inbound interface the host needs. Never blocks, so it can be called straight from a
/// host event hook.
#[derive(Clone)]
pub struct ActivityNotifier {
    next: mpsc::UnboundedSender<ActivitySignal>,
}

impl ActivityNotifier {
    pub fn new(next: mpsc::UnboundedSender<ActivitySignal>) -> Self {
        Self { next }
    }

    /// Returns false once the tracker stopped accepting signals.
    pub fn notify(
        &self,
        kind: ActivityKind,
        entity: impl Into<Arc<str>>,
        project: Option<Arc<str>>,
        at: DateTime<Utc>,
    ) -> bool {
        let signal = ActivitySignal {
            kind,
            entity: entity.into(),
            project,
            at,
        };
        self.next
            .send(signal)
            .inspect_err(|e| warn!("Tracker is stopped, dropping signal {:?}", e.0))
            .is_ok()
    }
}

/// Project name for a file. Unsaved files (no usable stem) are not tracked.
pub fn derive_project_name(entity: &str, tag: Option<&str>) -> Option<Arc<str>> {
    let stem = Path::new(entity.trim()).file_stem()?.to_str()?.trim();
    if stem.is_empty() {
        return None;
    }
    match tag.map(str::trim).filter(|tag| !tag.is_empty()) {
        Some(tag) if !stem.ends_with(&format!("[{tag}]")) => Some(format!("{stem} [{tag}]").into()),
        _ => Some(stem.into()),
    }
}
