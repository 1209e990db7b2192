use std::{fmt::Display, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Edit,
    Save,
    View,
}

impl Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Edit => write!(f, "edit"),
            ActivityKind::Save => write!(f, "save"),
            ActivityKind::View => write!(f, "view"),
        }
    }
}

/// One observed unit of activity. Immutable once created by the debouncer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(with = "fractional_seconds")]
    pub timestamp: DateTime<Utc>,
    pub project: Arc<str>,
    pub entity: Arc<str>,
    pub kind: ActivityKind,
    pub is_write: bool,
}

impl Heartbeat {
    pub fn new(
        kind: ActivityKind,
        entity: Arc<str>,
        project: Arc<str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            project,
            entity,
            kind,
            is_write: kind == ActivityKind::Save,
        }
    }

    /// Seconds since epoch with sub-second precision, the form the remote API expects.
    pub fn epoch_seconds(&self) -> f64 {
        fractional_seconds::to_f64(&self.timestamp)
    }
}

/// Identifier of a queue entry. Assigned in arrival order, so ordering by id is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    DeadLettered,
}

/// A heartbeat plus delivery metadata. Owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub heartbeat: Heartbeat,
    pub attempt_count: u32,
    /// Failures where the remote explicitly refused the entry. Only these lead to dead-lettering.
    #[serde(default)]
    pub rejection_count: u32,
    pub first_enqueued_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl QueueEntry {
    pub fn new(id: EntryId, heartbeat: Heartbeat, first_enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            heartbeat,
            attempt_count: 0,
            rejection_count: 0,
            first_enqueued_at,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.delivery_state == DeliveryState::DeadLettered
    }
}

/// Serializes timestamps as fractional epoch seconds with microsecond precision.
pub(crate) mod fractional_seconds {
    use chrono::{DateTime, Utc};
    use serde::{self, de::Error, Deserialize, Deserializer, Serializer};

    pub fn to_f64(moment: &DateTime<Utc>) -> f64 {
        moment.timestamp_micros() as f64 / 1_000_000.
    }

    pub fn from_f64(seconds: f64) -> Option<DateTime<Utc>> {
        if !seconds.is_finite() {
            return None;
        }
        DateTime::from_timestamp_micros((seconds * 1_000_000.).round() as i64)
    }

    pub fn serialize<S>(moment: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(to_f64(moment))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        from_f64(seconds).ok_or_else(|| D::Error::custom(format!("invalid timestamp {seconds}")))
    }
}
