use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::{
    error::StorageError,
    utils::time::{date_to_record_name, local_date},
};

use super::entities::Heartbeat;

/// Human readable, append-only record of the session. One file per local day.
pub struct TimelineLogger {
    dir: PathBuf,
}

impl TimelineLogger {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub async fn append(&self, heartbeat: &Heartbeat) -> Result<(), StorageError> {
        let line = format!(
            "{} {} {} {}",
            format_moment(heartbeat.timestamp),
            heartbeat.kind,
            heartbeat.project,
            heartbeat.entity
        );
        self.write_line(local_date(heartbeat.timestamp), line).await
    }

    /// Appends a free form event like a session transition. Blank messages are dropped.
    pub async fn log_event(&self, message: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        let message = message.trim();
        if message.is_empty() {
            return Ok(());
        }
        let line = format!("{} - {message}", format_moment(at));
        self.write_line(local_date(at), line).await
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.log", date_to_record_name(date)))
    }

    /// The log of the day containing `now`, if anything has been written to it.
    pub fn latest_log_path(&self, now: DateTime<Utc>) -> Option<PathBuf> {
        let path = self.path_for(local_date(now));
        path.exists().then_some(path)
    }

    async fn write_line(&self, date: NaiveDate, mut line: String) -> Result<(), StorageError> {
        let path = self.path_for(date);
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))
    }
}

fn format_moment(moment: DateTime<Utc>) -> String {
    moment
        .with_timezone(&Local)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        tracker::storage::entities::{ActivityKind, Heartbeat},
        utils::time::local_date,
    };

    use super::TimelineLogger;

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    #[tokio::test]
    async fn test_lines_are_appended() -> Result<()> {
        let dir = tempdir()?;
        let logger = TimelineLogger::new(dir.path().join("timeline"))?;
        let at = Utc.from_utc_datetime(&TEST_START_DATE) + Duration::hours(12);

        logger
            .append(&Heartbeat::new(
                ActivityKind::Edit,
                "/work/scene.blend".into(),
                "scene".into(),
                at,
            ))
            .await?;
        logger.log_event("file saved scene.blend", at).await?;
        logger.log_event("   ", at).await?;

        let path = logger.latest_log_path(at).expect("log should exist");
        assert_eq!(path, logger.path_for(local_date(at)));
        let content = std::fs::read_to_string(path)?;
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" edit scene /work/scene.blend"));
        assert!(lines[1].ends_with(" - file saved scene.blend"));
        Ok(())
    }

    #[tokio::test]
    async fn test_new_file_per_day() -> Result<()> {
        let dir = tempdir()?;
        let logger = TimelineLogger::new(dir.path().to_path_buf())?;
        let first = Utc.from_utc_datetime(&TEST_START_DATE) + Duration::hours(12);
        let second = first + Duration::days(1);

        logger.log_event("first", first).await?;
        logger.log_event("second", second).await?;

        assert_ne!(
            logger.latest_log_path(first),
            logger.latest_log_path(second)
        );
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 2);
        assert!(logger
            .latest_log_path(second + Duration::days(1))
            .is_none());
        Ok(())
    }
}
