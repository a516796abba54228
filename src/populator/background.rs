// src/populator/background.rs
//! Master side of background discovery
//!
//! Sources are ordered so likely-slow work is discovered first, dealt out
//! round-robin to a fixed number of loader processes, and their frames are
//! drained without ever blocking the master loop.

use crate::populator::eager::{EagerReader, Shift, DEFAULT_CAPACITY};
use crate::populator::DiscoveredGroup;
use crate::stats::StatsFile;
use crate::tree::WorkTree;
use crate::utils::errors::{QueueError, Result};
use crate::worker::supervisor::SpawnConfig;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

struct Loader {
    id: usize,
    child: Option<Child>,
    reader: EagerReader,
    closed: bool,
}

/// Streams discovered root items from loader processes into the tree
pub struct BackgroundPopulator {
    loaders: Vec<Loader>,
    next: usize,
    discovered: usize,
}

impl BackgroundPopulator {
    /// Order sources: unknown cost first, then slowest known, then largest
    pub fn order_sources(sources: &[PathBuf], stats: &StatsFile) -> Vec<PathBuf> {
        let mut keyed: Vec<(Option<f64>, u64, PathBuf)> = sources
            .iter()
            .map(|source| {
                let slowest = stats.slowest_in_source(&source.display().to_string());
                let size = std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
                (slowest, size, source.clone())
            })
            .collect();

        keyed.sort_by(|(a_time, a_size, _), (b_time, b_size, _)| {
            let by_time = match (a_time, b_time) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => b.total_cmp(a),
            };
            by_time.then_with(|| b_size.cmp(a_size))
        });

        keyed.into_iter().map(|(_, _, source)| source).collect()
    }

    /// Deal ordered sources round-robin into at most `loaders` chunks
    pub fn partition(sources: Vec<PathBuf>, loaders: usize) -> Vec<Vec<PathBuf>> {
        let loaders = loaders.max(1).min(sources.len().max(1));
        let mut chunks = vec![Vec::new(); loaders];
        for (index, source) in sources.into_iter().enumerate() {
            chunks[index % loaders].push(source);
        }
        chunks.retain(|c| !c.is_empty());
        chunks
    }

    /// Start one `discover` child per chunk
    pub fn start(spawn: &SpawnConfig, sources: &[PathBuf], stats: &StatsFile, loaders: usize) -> Result<Self> {
        let ordered = Self::order_sources(sources, stats);
        let chunks = Self::partition(ordered, loaders);

        let mut started = Vec::with_capacity(chunks.len());
        for (id, chunk) in chunks.into_iter().enumerate() {
            let mut command = Command::new(&spawn.program);
            command
                .args(&spawn.args)
                .arg("--loader")
                .arg(id.to_string())
                .args(&chunk)
                .stdin(Stdio::null())
                .stdout(Stdio::piped());
            if let Some(work_dir) = &spawn.work_dir {
                command.current_dir(work_dir);
            }
            for (key, value) in &spawn.env_vars {
                command.env(key, value);
            }

            let mut child = command
                .spawn()
                .map_err(|e| QueueError::ProcessSpawnFailed(format!("Failed to start loader {}: {}", id, e)))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| QueueError::ProcessSpawnFailed(format!("Loader {} has no stdout", id)))?;

            debug!("Loader {} (pid {}) discovering {} sources", id, child.id(), chunk.len());
            started.push(Loader {
                id,
                child: Some(child),
                reader: EagerReader::spawn(stdout, DEFAULT_CAPACITY),
                closed: false,
            });
        }

        info!("Started {} loaders for {} sources", started.len(), sources.len());
        Ok(Self::with_loaders(started))
    }

    /// Populate from already-open frame streams
    pub fn from_readers(readers: Vec<EagerReader>) -> Self {
        let loaders = readers
            .into_iter()
            .enumerate()
            .map(|(id, reader)| Loader {
                id,
                child: None,
                reader,
                closed: false,
            })
            .collect();
        Self::with_loaders(loaders)
    }

    fn with_loaders(loaders: Vec<Loader>) -> Self {
        Self {
            loaders,
            next: 0,
            discovered: 0,
        }
    }

    /// Next discovered group from any loader, without blocking
    pub fn shift(&mut self) -> Shift<DiscoveredGroup> {
        let count = self.loaders.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            let loader = &mut self.loaders[index];
            if loader.closed {
                continue;
            }

            match loader.reader.try_next() {
                Shift::Ready(frame) => match serde_json::from_slice::<DiscoveredGroup>(&frame) {
                    Ok(group) => {
                        self.next = (index + 1) % count;
                        self.discovered += 1;
                        return Shift::Ready(group);
                    }
                    Err(e) => warn!("Dropping undecodable frame from loader {}: {}", loader.id, e),
                },
                Shift::Pending => {}
                Shift::Closed => {
                    debug!("Loader {} finished", loader.id);
                    loader.closed = true;
                }
            }
        }

        if self.is_exhausted() {
            Shift::Closed
        } else {
            Shift::Pending
        }
    }

    /// Move everything discovered so far into the tree
    ///
    /// Records which root keys each source defined into `run_stats`.
    pub fn poll(&mut self, tree: &mut WorkTree, run_stats: &mut StatsFile) -> usize {
        let mut ingested = 0;
        while let Shift::Ready(group) = self.shift() {
            run_stats.record_source(&group.source, &group.item.key);
            if tree.ingest(Some(group.source), group.item) {
                ingested += 1;
            }
        }

        if ingested > 0 {
            metrics::counter!("distq_items_discovered_total").increment(ingested as u64);
        }
        ingested
    }

    /// All loaders have closed and every frame was consumed
    pub fn is_exhausted(&self) -> bool {
        self.loaders.iter().all(|l| l.closed)
    }

    pub fn discovered(&self) -> usize {
        self.discovered
    }

    /// Kill loaders that are still running
    pub fn shutdown(&mut self) {
        for loader in &mut self.loaders {
            let Some(mut child) = loader.child.take() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    warn!("Loader {} exited with {}", loader.id, status);
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("Killing loader {} (pid {})", loader.id, child.id());
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill loader {}: {}", loader.id, e);
                    }
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to poll loader {}: {}", loader.id, e),
            }
            loader.closed = true;
        }
    }
}

impl Drop for BackgroundPopulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::populator::eager::EagerWriter;
    use crate::tree::{PopRequest, WorkItem};
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn frame(loader: usize, source: &str, item: WorkItem) -> Vec<u8> {
        serde_json::to_vec(&DiscoveredGroup {
            loader,
            remaining: 0,
            source: source.to_string(),
            item,
        })
        .unwrap()
    }

    #[test]
    fn test_order_sources_unknown_first_then_slowest_then_largest() {
        let dir = tempdir().unwrap();
        let file = |name: &str, size: usize| {
            let path = dir.path().join(name);
            std::fs::write(&path, vec![b'x'; size]).unwrap();
            path
        };
        let fast = file("fast.json", 900);
        let slow = file("slow.json", 10);
        let small_new = file("small_new.json", 5);
        let big_new = file("big_new.json", 500);

        let mut stats = StatsFile::default();
        stats.durations.insert("f".to_string(), 1.0);
        stats.durations.insert("s".to_string(), 30.0);
        stats.record_source(&fast.display().to_string(), "f");
        stats.record_source(&slow.display().to_string(), "s");

        let ordered = BackgroundPopulator::order_sources(
            &[fast.clone(), small_new.clone(), slow.clone(), big_new.clone()],
            &stats,
        );
        assert_eq!(ordered, vec![big_new, small_new, slow, fast]);
    }

    #[test]
    fn test_partition_round_robin() {
        let chunks = BackgroundPopulator::partition(paths(&["a", "b", "c", "d", "e"]), 2);
        assert_eq!(chunks, vec![paths(&["a", "c", "e"]), paths(&["b", "d"])]);

        let chunks = BackgroundPopulator::partition(paths(&["a"]), 4);
        assert_eq!(chunks, vec![paths(&["a"])]);

        assert!(BackgroundPopulator::partition(Vec::new(), 2).is_empty());
    }

    #[test]
    fn test_poll_feeds_tree_until_exhausted() {
        let (a1, b1) = UnixStream::pair().unwrap();
        let (a2, b2) = UnixStream::pair().unwrap();
        let mut populator = BackgroundPopulator::from_readers(vec![
            EagerReader::spawn(b1, 8),
            EagerReader::spawn(b2, 8),
        ]);
        let mut tree = WorkTree::default();
        let mut run_stats = StatsFile::default();

        assert_eq!(populator.shift(), Shift::Pending);
        assert!(!populator.is_exhausted());

        let w1 = EagerWriter::spawn(a1, 8);
        w1.send(&frame(0, "one.json", WorkItem::group("g", vec![WorkItem::leaf("x")]))).unwrap();
        w1.finish().unwrap();
        let w2 = EagerWriter::spawn(a2, 8);
        w2.send(&frame(1, "two.json", WorkItem::leaf("solo"))).unwrap();
        w2.finish().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ingested = 0;
        while !populator.is_exhausted() {
            assert!(Instant::now() < deadline, "populator never closed");
            ingested += populator.poll(&mut tree, &mut run_stats);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(ingested, 2);
        assert_eq!(populator.discovered(), 2);
        assert_eq!(populator.shift(), Shift::Closed);
        assert_eq!(tree.source_of("g"), Some("one.json"));
        assert_eq!(tree.source_of("solo"), Some("two.json"));
        assert_eq!(run_stats.sources["two.json"].iter().next().map(String::as_str), Some("solo"));

        let mut popped = vec![tree.pop(&PopRequest::Root).unwrap(), tree.pop(&PopRequest::Root).unwrap()];
        popped.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(popped[0].source.as_deref(), Some("one.json"));
        assert_eq!(popped[0].path, vec!["g".to_string(), "x".to_string()]);
    }

    #[test]
    fn test_start_with_missing_program_fails() {
        let spawn = SpawnConfig::new("/nonexistent/distq");
        let result = BackgroundPopulator::start(&spawn, &paths(&["a"]), &StatsFile::default(), 2);
        assert!(matches!(result, Err(QueueError::ProcessSpawnFailed(_))));
    }
}
