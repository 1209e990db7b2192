use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Days, NaiveDate};
use tracing::{debug, warn};

use crate::{error::StorageError, fs::operations::spawn_atomic_write};

pub const TOTALS_FILE_NAME: &str = "totals.json";

pub type ProjectTotals = BTreeMap<Arc<str>, f64>;

/// Accumulated active seconds keyed by local date and project. Every change is written through to
/// a small JSON file, replaced atomically so a crash leaves either the old or the new totals.
pub struct DailyTotals {
    path: PathBuf,
    days: BTreeMap<NaiveDate, ProjectTotals>,
    retention_days: u32,
}

impl DailyTotals {
    /// Restores totals from `path`. A missing or corrupted file starts from zero.
    pub fn load(path: &Path, retention_days: u32) -> Self {
        let days = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Daily totals in {path:?} are corrupted, starting over: {e}");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read daily totals from {path:?}: {e}");
                BTreeMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            days,
            retention_days,
        }
    }

    /// Adds `seconds` to the total of `project` on `date` and persists the result. Non-positive
    /// amounts are ignored so totals never decrease.
    pub async fn add(
        &mut self,
        date: NaiveDate,
        project: &Arc<str>,
        seconds: f64,
    ) -> Result<(), StorageError> {
        if !(seconds.is_finite() && seconds > 0.) {
            return Ok(());
        }
        *self
            .days
            .entry(date)
            .or_default()
            .entry(project.clone())
            .or_insert(0.) += seconds;
        self.prune(date);
        debug!("Added {seconds:.1}s to {project} on {date}");
        self.persist().await
    }

    /// Makes sure `date` has an entry, so a day with no credited time yet is still persisted.
    pub async fn touch(&mut self, date: NaiveDate, project: &Arc<str>) -> Result<(), StorageError> {
        let day = self.days.entry(date).or_default();
        if day.contains_key(project) {
            return Ok(());
        }
        day.insert(project.clone(), 0.);
        self.prune(date);
        self.persist().await
    }

    pub fn get(&self, date: NaiveDate, project: &str) -> f64 {
        self.days
            .get(&date)
            .and_then(|day| day.get(project))
            .copied()
            .unwrap_or(0.)
    }

    pub fn day(&self, date: NaiveDate) -> ProjectTotals {
        self.days.get(&date).cloned().unwrap_or_default()
    }

    pub fn day_total(&self, date: NaiveDate) -> f64 {
        self.days
            .get(&date)
            .map(|day| day.values().sum::<f64>())
            .unwrap_or(0.)
    }

    fn prune(&mut self, today: NaiveDate) {
        let Some(oldest) = today.checked_sub_days(Days::new(self.retention_days as u64)) else {
            return;
        };
        self.days.retain(|date, _| *date >= oldest);
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(&self.days).map_err(|source| {
            StorageError::Serialize {
                path: self.path.clone(),
                source,
            }
        })?;
        spawn_atomic_write(self.path.clone(), data)
            .await
            .map_err(|e| StorageError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 7, day).unwrap()
    }

    #[tokio::test]
    async fn test_totals_accumulate_and_persist() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(TOTALS_FILE_NAME);
        let foo: Arc<str> = "foo".into();
        let bar: Arc<str> = "bar".into();

        let mut totals = DailyTotals::load(&path, 31);
        totals.add(date(4), &foo, 30.).await?;
        totals.add(date(4), &foo, 15.5).await?;
        totals.add(date(4), &bar, 10.).await?;
        totals.add(date(5), &foo, 1.).await?;

        let reloaded = DailyTotals::load(&path, 31);
        assert_eq!(reloaded.get(date(4), "foo"), 45.5);
        assert_eq!(reloaded.get(date(4), "bar"), 10.);
        assert_eq!(reloaded.day_total(date(4)), 55.5);
        assert_eq!(reloaded.get(date(5), "foo"), 1.);
        assert_eq!(reloaded.get(date(6), "foo"), 0.);
        Ok(())
    }

    #[tokio::test]
    async fn test_negative_amounts_are_ignored() -> Result<()> {
        let dir = tempdir()?;
        let mut totals = DailyTotals::load(&dir.path().join(TOTALS_FILE_NAME), 31);
        let foo: Arc<str> = "foo".into();
        totals.add(date(4), &foo, 5.).await?;
        totals.add(date(4), &foo, -3.).await?;
        totals.add(date(4), &foo, f64::NAN).await?;
        assert_eq!(totals.get(date(4), "foo"), 5.);
        Ok(())
    }

    #[tokio::test]
    async fn test_old_days_are_pruned() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(TOTALS_FILE_NAME);
        let foo: Arc<str> = "foo".into();
        let mut totals = DailyTotals::load(&path, 2);
        totals.add(date(1), &foo, 5.).await?;
        totals.add(date(4), &foo, 5.).await?;
        assert_eq!(totals.get(date(1), "foo"), 0.);
        assert_eq!(totals.get(date(4), "foo"), 5.);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_file_starts_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(TOTALS_FILE_NAME);
        std::fs::write(&path, "{ not json")?;
        let totals = DailyTotals::load(&path, 31);
        assert_eq!(totals.day_total(date(4)), 0.);
        Ok(())
    }
}
