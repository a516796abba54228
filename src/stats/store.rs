// src/stats/store.rs
//! Historical duration storage
//!
//! One JSON file holds per-key durations and which root keys each source
//! defined last time. It is read once when a run starts and rewritten once
//! when it ends.

use crate::utils::config::MergePolicy;
use crate::utils::errors::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Key to duration in seconds
pub type StatsMap = BTreeMap<String, f64>;

/// Contents of the stats file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsFile {
    pub durations: StatsMap,

    /// Source artifact to the root keys it defined
    pub sources: BTreeMap<String, BTreeSet<String>>,
}

impl StatsFile {
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty() && self.sources.is_empty()
    }

    pub fn duration(&self, key: &str) -> Option<f64> {
        self.durations.get(key).copied()
    }

    /// Duration of the slowest root item a source defined last run
    pub fn slowest_in_source(&self, source: &str) -> Option<f64> {
        self.sources
            .get(source)?
            .iter()
            .filter_map(|key| self.duration(key))
            .reduce(f64::max)
    }

    pub fn record_source(&mut self, source: &str, root_key: &str) {
        self.sources
            .entry(source.to_string())
            .or_default()
            .insert(root_key.to_string());
    }

    /// Fold this run's results into the previous file
    pub fn merged(previous: &StatsFile, run: &StatsFile, policy: MergePolicy) -> StatsFile {
        match policy {
            MergePolicy::Replace => run.clone(),
            MergePolicy::Merge => {
                let mut merged = previous.clone();
                merged.durations.extend(run.durations.iter().map(|(k, v)| (k.clone(), *v)));
                merged.merge_sources(run);
                merged
            }
            MergePolicy::KeepMax => {
                let mut merged = previous.clone();
                for (key, value) in &run.durations {
                    let slot = merged.durations.entry(key.clone()).or_insert(*value);
                    *slot = slot.max(*value);
                }
                merged.merge_sources(run);
                merged
            }
        }
    }

    fn merge_sources(&mut self, run: &StatsFile) {
        for (source, keys) in &run.sources {
            self.sources
                .entry(source.clone())
                .or_default()
                .extend(keys.iter().cloned());
        }
    }
}

/// Add one worker's durations into a run total
pub fn accumulate(total: &mut StatsMap, worker: &StatsMap) {
    for (key, value) in worker {
        *total.entry(key.clone()).or_insert(0.0) += value;
    }
}

/// Persistent stats location
#[derive(Debug, Clone)]
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load previous stats; a missing or unreadable file yields empty stats
    pub async fn load(&self) -> StatsFile {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No stats file at {:?}", self.path);
                return StatsFile::default();
            }
            Err(e) => {
                warn!("Failed to read stats file {:?}: {}", self.path, e);
                return StatsFile::default();
            }
        };

        match serde_json::from_slice(&data) {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Ignoring corrupt stats file {:?}: {}", self.path, e);
                StatsFile::default()
            }
        }
    }

    /// Merge and persist; a run that produced nothing leaves the file alone
    pub async fn save(
        &self,
        previous: &StatsFile,
        run: &StatsFile,
        policy: MergePolicy,
    ) -> Result<Option<StatsFile>> {
        if run.is_empty() {
            debug!("No new stats recorded, leaving {:?} untouched", self.path);
            return Ok(None);
        }

        let merged = StatsFile::merged(previous, run, policy);
        let data = serde_json::to_vec_pretty(&merged)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data)
            .await
            .map_err(|e| QueueError::StatsFailed(format!("Failed to write {:?}: {}", tmp, e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| QueueError::StatsFailed(format!("Failed to replace {:?}: {}", self.path, e)))?;

        info!("Saved {} durations to {:?}", merged.durations.len(), self.path);
        Ok(Some(merged))
    }
}

/// Read a worker's transient stats file and delete it
pub async fn take_worker_stats(path: &Path) -> Option<StatsMap> {
    let data = fs::read(path).await.ok()?;
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove {:?}: {}", path, e);
    }
    match serde_json::from_slice(&data) {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("Ignoring corrupt worker stats {:?}: {}", path, e);
            None
        }
    }
}

/// Write a worker's durations (called from inside the worker, synchronously)
pub fn write_worker_stats(path: &Path, stats: &StatsMap) -> Result<()> {
    let data = serde_json::to_vec(stats)?;
    std::fs::write(path, data)
        .map_err(|e| QueueError::StatsFailed(format!("Failed to write {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn durations(pairs: &[(&str, f64)]) -> StatsMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("stats"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("stats"));

        let mut run = StatsFile {
            durations: durations(&[("a", 1.5), ("b", 0.25)]),
            ..Default::default()
        };
        run.record_source("suite/a.json", "a");

        store.save(&StatsFile::default(), &run, MergePolicy::Merge).await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded, run);
    }

    #[tokio::test]
    async fn test_empty_run_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("stats"));
        let saved = store
            .save(&StatsFile::default(), &StatsFile::default(), MergePolicy::Merge)
            .await
            .unwrap();
        assert!(saved.is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats");
        std::fs::write(&path, b"not json").unwrap();
        assert!(StatsStore::new(path).load().await.is_empty());
    }

    #[test]
    fn test_merge_policies() {
        let previous = StatsFile {
            durations: durations(&[("a", 5.0), ("b", 2.0)]),
            ..Default::default()
        };
        let run = StatsFile {
            durations: durations(&[("a", 3.0), ("c", 1.0)]),
            ..Default::default()
        };

        let replaced = StatsFile::merged(&previous, &run, MergePolicy::Replace);
        assert_eq!(replaced.durations, durations(&[("a", 3.0), ("c", 1.0)]));

        let merged = StatsFile::merged(&previous, &run, MergePolicy::Merge);
        assert_eq!(merged.durations, durations(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]));

        let maxed = StatsFile::merged(&previous, &run, MergePolicy::KeepMax);
        assert_eq!(maxed.durations, durations(&[("a", 5.0), ("b", 2.0), ("c", 1.0)]));
    }

    #[test]
    fn test_accumulate_sums_across_workers() {
        let mut total = StatsMap::new();
        accumulate(&mut total, &durations(&[("g", 1.0)]));
        accumulate(&mut total, &durations(&[("g", 2.5), ("h", 1.0)]));
        assert_eq!(total, durations(&[("g", 3.5), ("h", 1.0)]));
    }

    #[test]
    fn test_slowest_in_source() {
        let mut stats = StatsFile {
            durations: durations(&[("a", 1.0), ("b", 7.0)]),
            ..Default::default()
        };
        stats.record_source("f.json", "a");
        stats.record_source("f.json", "b");
        stats.record_source("g.json", "unknown");

        assert_eq!(stats.slowest_in_source("f.json"), Some(7.0));
        assert_eq!(stats.slowest_in_source("g.json"), None);
        assert_eq!(stats.slowest_in_source("missing.json"), None);
    }

    #[tokio::test]
    async fn test_worker_stats_are_consumed_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("distq_worker_1_stats");
        write_worker_stats(&path, &durations(&[("x", 0.5)])).unwrap();

        assert_eq!(take_worker_stats(&path).await, Some(durations(&[("x", 0.5)])));
        assert!(!path.exists());
        assert_eq!(take_worker_stats(&path).await, None);
    }
}
