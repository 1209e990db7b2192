//! Durable FIFO of heartbeats waiting for delivery.
//!
//! The queue is persisted as an append-only journal of JSON lines. Every mutation appends one
//! record and syncs it to disk before the in-memory state is touched, so memory never gets ahead
//! of what a restart would restore. On load the journal is replayed. A torn last line (crash
//! during an append) is cut off, it only ever holds the operation that never returned.
//!
//! The queue directory belongs to a single [HeartbeatQueue] at a time. An exclusive lock on
//! `queue/lock` is taken by [HeartbeatQueue::load] and held until the queue is dropped.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};

use crate::{
    error::StorageError,
    fs::operations::{find_torn_tail, spawn_atomic_write},
};

use super::entities::{DeliveryState, EntryId, Heartbeat, QueueEntry};

const JOURNAL_FILE_NAME: &str = "journal.jsonl";
const LOCK_FILE_NAME: &str = "lock";

/// Number of journal records allowed on top of the live entries before the journal is rewritten.
const COMPACTION_SLACK: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueued {
        entry: QueueEntry,
    },
    Delivered {
        ids: Vec<EntryId>,
    },
    Failed {
        ids: Vec<EntryId>,
        rejected: bool,
        #[serde(default)]
        dead_lettered: Vec<EntryId>,
    },
    /// Written first by compaction so ids stay unique after delivered entries are dropped.
    Checkpoint {
        next_id: u64,
    },
}

/// Counts published after every mutation. Readers get a consistent copy without touching the
/// queue lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl QueueSnapshot {
    /// Entries that still await delivery.
    pub fn depth(&self) -> usize {
        self.pending + self.in_flight
    }
}

pub struct HeartbeatQueue {
    inner: Mutex<QueueInner>,
    snapshot: watch::Sender<QueueSnapshot>,
    max_attempts: u32,
    /// Released when the queue is dropped.
    _lock: File,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

struct QueueInner {
    journal: Journal,
    entries: BTreeMap<EntryId, QueueEntry>,
    next_id: u64,
}

struct Journal {
    path: PathBuf,
    file: File,
    records: usize,
}

impl HeartbeatQueue {
    /// Opens the queue stored in `dir`, restoring every entry persisted by a previous run. Fails
    /// with [StorageError::Locked] while another queue has `dir` open.
    pub async fn load(dir: &Path, max_attempts: u32) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(dir, e))?;
        let lock = acquire_lock(dir.join(LOCK_FILE_NAME)).await?;
        let path = dir.join(JOURNAL_FILE_NAME);
        let mut journal = Journal::open(path).await?;
        let records = journal.read_all().await?;

        let mut entries = BTreeMap::new();
        let mut next_id = 0;
        for record in records.iter() {
            match record {
                JournalRecord::Enqueued { entry } => next_id = next_id.max(entry.id.0 + 1),
                JournalRecord::Checkpoint { next_id: checkpoint } => {
                    next_id = next_id.max(*checkpoint)
                }
                _ => {}
            }
        }
        journal.records = records.len();
        for record in records {
            apply(&mut entries, record);
        }
        for entry in entries.values_mut() {
            if entry.delivery_state == DeliveryState::InFlight {
                entry.delivery_state = DeliveryState::Pending;
            }
        }

        let snapshot = count(&entries);
        info!(
            "Loaded heartbeat queue from {:?}: {} pending, {} dead-lettered",
            journal.path, snapshot.pending, snapshot.dead_lettered
        );

        Ok(Self {
            inner: Mutex::new(QueueInner {
                journal,
                entries,
                next_id,
            }),
            snapshot: watch::Sender::new(snapshot),
            max_attempts,
            _lock: lock,
            #[cfg(test)]
            fail_writes: Default::default(),
        })
    }

    /// Makes every following write fail as if the disk refused it.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::io(
                JOURNAL_FILE_NAME,
                std::io::Error::other("writes disabled"),
            ));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Appends a heartbeat. Returns once the entry is on disk.
    pub async fn enqueue(
        &self,
        heartbeat: Heartbeat,
        now: DateTime<Utc>,
    ) -> Result<EntryId, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let id = EntryId(inner.next_id);
        let record = JournalRecord::Enqueued {
            entry: QueueEntry::new(id, heartbeat, now),
        };
        inner.journal.append(&record).await?;
        inner.next_id += 1;
        apply(&mut inner.entries, record);
        debug!("Enqueued heartbeat {id}");
        self.publish(&inner);
        Ok(id)
    }

    /// Returns up to `max_n` deliverable entries, oldest first, and marks them in flight.
    /// Dead-lettered entries are never returned. Entries left in flight by an abandoned cycle are
    /// handed out again.
    pub async fn peek_batch(&self, max_n: usize) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .entries
            .values_mut()
            .filter(|entry| !entry.is_dead_lettered())
            .take(max_n)
            .map(|entry| {
                entry.delivery_state = DeliveryState::InFlight;
                entry.clone()
            })
            .collect::<Vec<_>>();
        self.publish(&inner);
        batch
    }

    /// Removes delivered entries. Unknown ids are ignored, so repeating the call is harmless.
    pub async fn mark_delivered(&self, ids: &[EntryId]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let ids = inner.known(ids);
        if ids.is_empty() {
            return Ok(());
        }
        let record = JournalRecord::Delivered { ids };
        inner.journal.append(&record).await?;
        apply(&mut inner.entries, record);
        self.publish(&inner);
        inner.compact_if_needed().await;
        Ok(())
    }

    /// Records a remote rejection. Entries rejected `max_attempts` times are dead-lettered and the
    /// ids of those are returned.
    pub async fn mark_failed(&self, ids: &[EntryId]) -> Result<Vec<EntryId>, StorageError> {
        let mut inner = self.inner.lock().await;
        let ids = inner.known(ids);
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let dead_lettered = ids
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|entry| !entry.is_dead_lettered())
            .filter(|entry| entry.rejection_count + 1 >= self.max_attempts)
            .map(|entry| entry.id)
            .collect::<Vec<_>>();
        let record = JournalRecord::Failed {
            ids,
            rejected: true,
            dead_lettered: dead_lettered.clone(),
        };
        inner.journal.append(&record).await?;
        apply(&mut inner.entries, record);
        if !dead_lettered.is_empty() {
            warn!(
                "Dead-lettered heartbeats {dead_lettered:?} after {} rejections",
                self.max_attempts
            );
        }
        self.publish(&inner);
        inner.compact_if_needed().await;
        Ok(dead_lettered)
    }

    /// Records a failed attempt that says nothing about the entries themselves (network down,
    /// timeout, server error). Increments the attempt count but never dead-letters.
    pub async fn mark_unreachable(&self, ids: &[EntryId]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let ids = inner.known(ids);
        if ids.is_empty() {
            return Ok(());
        }
        let record = JournalRecord::Failed {
            ids,
            rejected: false,
            dead_lettered: vec![],
        };
        inner.journal.append(&record).await?;
        apply(&mut inner.entries, record);
        self.publish(&inner);
        inner.compact_if_needed().await;
        Ok(())
    }

    /// Every entry in FIFO order, dead letters included. Meant for inspection.
    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().await.entries.values().cloned().collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.subscribe()
    }

    fn publish(&self, inner: &QueueInner) {
        self.snapshot.send_replace(count(&inner.entries));
    }
}

impl QueueInner {
    fn known(&self, ids: &[EntryId]) -> Vec<EntryId> {
        let mut known = ids
            .iter()
            .copied()
            .filter(|id| self.entries.contains_key(id))
            .collect::<Vec<_>>();
        known.sort_unstable();
        known.dedup();
        known
    }

    /// Rewrites the journal once it carries too many records for the live entries. The record
    /// that triggered it is already on disk, so a failed rewrite only leaves the journal long.
    async fn compact_if_needed(&mut self) {
        if self.journal.records <= self.entries.len() + COMPACTION_SLACK {
            return;
        }
        let checkpoint = JournalRecord::Checkpoint {
            next_id: self.next_id,
        };
        let records = std::iter::once(checkpoint)
            .chain(self.entries.values().cloned().map(|mut entry| {
                if entry.delivery_state == DeliveryState::InFlight {
                    entry.delivery_state = DeliveryState::Pending;
                }
                JournalRecord::Enqueued { entry }
            }))
            .collect::<Vec<_>>();
        let before = self.journal.records;
        match self.journal.rewrite(&records).await {
            Ok(()) => info!(
                "Compacted queue journal from {before} to {} records",
                self.journal.records
            ),
            Err(e) => warn!("Failed to compact queue journal: {e}"),
        }
    }
}

impl Journal {
    async fn open(path: PathBuf) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(Self {
            path,
            file,
            records: 0,
        })
    }

    /// Reads every complete record. Drops a torn tail first so later appends start on a fresh
    /// line.
    async fn read_all(&mut self) -> Result<Vec<JournalRecord>, StorageError> {
        let io = |e| StorageError::io(&self.path, e);

        if let Some(position) = find_torn_tail(&mut self.file, &mut vec![0; 1024])
            .await
            .map_err(io)?
        {
            warn!(
                "Queue journal {:?} ends with a torn record, truncating at {position}",
                self.path
            );
            self.file.set_len(position).await.map_err(io)?;
        }
        self.file.rewind().await.map_err(io)?;

        let mut records = vec![];
        let mut lines = BufReader::new(&mut self.file).lines();
        while let Some(line) = lines.next_line().await.map_err(io)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        "Skipping unreadable queue record in {:?} {}: {e}",
                        self.path, &line
                    )
                }
            }
        }
        Ok(records)
    }

    async fn append(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        let mut buffer = serde_json::to_vec(record).map_err(|source| StorageError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        buffer.push(b'\n');

        Self::write_synced(&mut self.file, &buffer)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        self.records += 1;
        Ok(())
    }

    async fn write_synced(file: &mut File, buffer: &[u8]) -> std::io::Result<()> {
        file.write_all(buffer).await?;
        file.flush().await?;
        file.sync_data().await
    }

    /// Atomically replaces the journal with `records` and reopens it.
    async fn rewrite(&mut self, records: &[JournalRecord]) -> Result<(), StorageError> {
        let mut buffer = Vec::<u8>::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record).map_err(|source| {
                StorageError::Serialize {
                    path: self.path.clone(),
                    source,
                }
            })?;
            buffer.push(b'\n');
        }
        spawn_atomic_write(self.path.clone(), buffer)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        let mut reopened = Self::open(self.path.clone()).await?;
        reopened.records = records.len();
        *self = reopened;
        Ok(())
    }
}

async fn acquire_lock(path: PathBuf) -> Result<File, StorageError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .await
        .map_err(|e| StorageError::io(&path, e))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs4::lock_contended_error().kind() => {
            Err(StorageError::Locked { path })
        }
        Err(e) => Err(StorageError::io(&path, e)),
    }
}

fn apply(entries: &mut BTreeMap<EntryId, QueueEntry>, record: JournalRecord) {
    match record {
        JournalRecord::Enqueued { entry } => {
            entries.insert(entry.id, entry);
        }
        JournalRecord::Delivered { ids } => {
            for id in ids {
                entries.remove(&id);
            }
        }
        JournalRecord::Failed {
            ids,
            rejected,
            dead_lettered,
        } => {
            for id in ids {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.attempt_count += 1;
                    if rejected {
                        entry.rejection_count += 1;
                    }
                    if entry.delivery_state == DeliveryState::InFlight {
                        entry.delivery_state = DeliveryState::Pending;
                    }
                }
            }
            for id in dead_lettered {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.delivery_state = DeliveryState::DeadLettered;
                }
            }
        }
        JournalRecord::Checkpoint { .. } => {}
    }
}

fn count(entries: &BTreeMap<EntryId, QueueEntry>) -> QueueSnapshot {
    entries
        .values()
        .fold(QueueSnapshot::default(), |mut snapshot, entry| {
            match entry.delivery_state {
                DeliveryState::Pending => snapshot.pending += 1,
                DeliveryState::InFlight => snapshot.in_flight += 1,
                DeliveryState::DeadLettered => snapshot.dead_lettered += 1,
                DeliveryState::Delivered => {}
            }
            snapshot
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        error::StorageError,
        tracker::storage::entities::{ActivityKind, DeliveryState, Heartbeat},
    };

    use super::{HeartbeatQueue, JOURNAL_FILE_NAME};

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    fn heartbeat(seconds: i64) -> Heartbeat {
        Heartbeat::new(
            ActivityKind::Edit,
            "/projects/foo.blend".into(),
            "foo".into(),
            Utc.from_utc_datetime(&TEST_START_DATE) + Duration::seconds(seconds),
        )
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.from_utc_datetime(&TEST_START_DATE)
    }

    #[tokio::test]
    async fn test_peek_is_fifo_and_bounded() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        for i in 0..5 {
            queue.enqueue(heartbeat(i), now()).await?;
        }

        let batch = queue.peek_batch(3).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.iter().map(|v| v.heartbeat.clone()).collect::<Vec<_>>(),
            (0..3).map(heartbeat).collect::<Vec<_>>()
        );
        assert!(batch
            .iter()
            .all(|v| v.delivery_state == DeliveryState::InFlight));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.in_flight, 3);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.depth(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_entry_survives_restart() -> Result<()> {
        let dir = tempdir()?;
        let enqueued = {
            let queue = HeartbeatQueue::load(dir.path(), 3).await?;
            queue.enqueue(heartbeat(0), now()).await?;
            queue.entries().await
        };

        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        assert_eq!(queue.entries().await, enqueued);
        assert_eq!(queue.snapshot().pending, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_in_flight_entries_are_pending_after_restart() -> Result<()> {
        let dir = tempdir()?;
        {
            let queue = HeartbeatQueue::load(dir.path(), 3).await?;
            queue.enqueue(heartbeat(0), now()).await?;
            queue.peek_batch(10).await;
        }

        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        let entries = queue.entries().await;
        assert_eq!(entries[0].delivery_state, DeliveryState::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_delivered_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        let first = queue.enqueue(heartbeat(0), now()).await?;
        let second = queue.enqueue(heartbeat(1), now()).await?;

        queue.mark_delivered(&[first]).await?;
        queue.mark_delivered(&[first]).await?;

        let entries = queue.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, second);

        drop(queue);
        let reloaded = HeartbeatQueue::load(dir.path(), 3).await?;
        assert_eq!(reloaded.entries().await, entries);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejections_dead_letter_after_threshold() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 2).await?;
        let id = queue.enqueue(heartbeat(0), now()).await?;

        assert!(queue.mark_failed(&[id]).await?.is_empty());
        assert_eq!(queue.peek_batch(10).await.len(), 1);
        assert_eq!(queue.mark_failed(&[id]).await?, vec![id]);

        assert!(queue.peek_batch(10).await.is_empty());
        let entries = queue.entries().await;
        assert_eq!(entries[0].delivery_state, DeliveryState::DeadLettered);
        assert_eq!(entries[0].attempt_count, 2);
        assert_eq!(queue.snapshot().dead_lettered, 1);
        assert_eq!(queue.snapshot().depth(), 0);

        drop(queue);
        let reloaded = HeartbeatQueue::load(dir.path(), 2).await?;
        assert_eq!(reloaded.entries().await, entries);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_never_dead_letters() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 1).await?;
        let id = queue.enqueue(heartbeat(0), now()).await?;
        for _ in 0..5 {
            queue.peek_batch(10).await;
            queue.mark_unreachable(&[id]).await?;
        }
        let entries = queue.entries().await;
        assert_eq!(entries[0].attempt_count, 5);
        assert_eq!(entries[0].rejection_count, 0);
        assert_eq!(entries[0].delivery_state, DeliveryState::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped_on_load() -> Result<()> {
        let dir = tempdir()?;
        {
            let queue = HeartbeatQueue::load(dir.path(), 3).await?;
            queue.enqueue(heartbeat(0), now()).await?;
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE_NAME))?;
        file.write_all(b"{\"op\":\"enqueued\",\"entry\":{\"id\":1,")?;
        drop(file);

        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        assert_eq!(queue.entries().await.len(), 1);
        let id = queue.enqueue(heartbeat(1), now()).await?;
        assert_eq!(id.0, 1);

        drop(queue);
        let reloaded = HeartbeatQueue::load(dir.path(), 3).await?;
        assert_eq!(reloaded.entries().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_is_compacted() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        let kept = queue.enqueue(heartbeat(0), now()).await?;
        for i in 1..400 {
            let id = queue.enqueue(heartbeat(i), now()).await?;
            queue.mark_delivered(&[id]).await?;
        }

        let lines = std::fs::read_to_string(dir.path().join(JOURNAL_FILE_NAME))?
            .lines()
            .count();
        assert!(lines < 400, "journal has {lines} lines");

        drop(queue);
        let reloaded = HeartbeatQueue::load(dir.path(), 3).await?;
        let entries = reloaded.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, kept);
        assert_eq!(reloaded.enqueue(heartbeat(500), now()).await?.0, 400);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_attempts_compact_the_journal() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        let id = queue.enqueue(heartbeat(0), now()).await?;
        for _ in 0..600 {
            queue.peek_batch(10).await;
            queue.mark_unreachable(&[id]).await?;
        }

        let lines = std::fs::read_to_string(dir.path().join(JOURNAL_FILE_NAME))?
            .lines()
            .count();
        assert!(lines < 600, "journal has {lines} lines");

        drop(queue);
        let reloaded = HeartbeatQueue::load(dir.path(), 3).await?;
        let entries = reloaded.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 600);
        assert_eq!(entries[0].delivery_state, DeliveryState::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_queue_on_same_dir_is_refused() -> Result<()> {
        let dir = tempdir()?;
        let queue = HeartbeatQueue::load(dir.path(), 3).await?;
        queue.enqueue(heartbeat(0), now()).await?;

        assert!(matches!(
            HeartbeatQueue::load(dir.path(), 3).await,
            Err(StorageError::Locked { .. })
        ));

        drop(queue);
        let reopened = HeartbeatQueue::load(dir.path(), 3).await?;
        assert_eq!(reopened.snapshot().pending, 1);
        Ok(())
    }
}
