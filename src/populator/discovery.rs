// src/populator/discovery.rs
//! Loader side of background discovery
//!
//! Runs inside a `distq discover` child: enumerates each assigned source and
//! streams every non-empty root item back to the master as one frame.

use crate::collaborator::ExecutionCollaborator;
use crate::populator::eager::{EagerWriter, DEFAULT_CAPACITY};
use crate::populator::DiscoveredGroup;
use crate::utils::errors::Result;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Enumerate `sources` in order and write what they define to `out`
///
/// A source that fails to load is logged and skipped; the remaining sources
/// are still discovered.
pub fn run_discovery<W>(
    collaborator: &dyn ExecutionCollaborator,
    loader: usize,
    sources: &[PathBuf],
    out: W,
) -> Result<usize>
where
    W: Write + Send + 'static,
{
    let writer = EagerWriter::spawn(out, DEFAULT_CAPACITY);
    let mut sent = 0;

    for (index, source) in sources.iter().enumerate() {
        let items = match collaborator.enumerate(source) {
            Ok(items) => items,
            Err(e) => {
                warn!("Loader {} skipping {:?}: {}", loader, source, e);
                continue;
            }
        };

        let remaining = sources.len() - index - 1;
        for item in items.into_iter().filter(|i| !i.is_exhausted()) {
            let group = DiscoveredGroup {
                loader,
                remaining,
                source: source.display().to_string(),
                item,
            };
            writer.send(&serde_json::to_vec(&group)?)?;
            sent += 1;
        }
        debug!("Loader {} finished {:?} ({} sources left)", loader, source, remaining);
    }

    writer.finish()?;
    info!("Loader {} discovered {} root items from {} sources", loader, sent, sources.len());
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::Outcome;
    use crate::populator::eager::{EagerReader, Shift};
    use crate::tree::WorkItem;
    use crate::utils::errors::QueueError;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::time::Duration;

    struct FixedForest;

    impl ExecutionCollaborator for FixedForest {
        fn enumerate(&self, source: &Path) -> Result<Vec<WorkItem>> {
            match source.to_str() {
                Some("a") => Ok(vec![
                    WorkItem::group("ga", vec![WorkItem::leaf("x")]),
                    WorkItem::group("hollow", vec![]),
                ]),
                Some("b") => Ok(vec![WorkItem::leaf("lb")]),
                _ => Err(QueueError::DiscoveryFailed("unreadable".to_string())),
            }
        }

        fn execute(&self, _source: Option<&str>, _path: &[String]) -> Result<Outcome> {
            Ok(Outcome::passed(""))
        }
    }

    #[test]
    fn test_streams_non_empty_items_and_skips_bad_sources() {
        let (a, b) = UnixStream::pair().unwrap();
        let reader = EagerReader::spawn(b, 16);
        let sources = vec![PathBuf::from("a"), PathBuf::from("broken"), PathBuf::from("b")];

        let sent = run_discovery(&FixedForest, 1, &sources, a).unwrap();
        assert_eq!(sent, 2);

        let mut groups = Vec::new();
        while let Shift::Ready(frame) = reader.next_timeout(Duration::from_secs(5)) {
            groups.push(serde_json::from_slice::<DiscoveredGroup>(&frame).unwrap());
        }

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].item.key, "ga");
        assert_eq!(groups[0].source, "a");
        assert_eq!(groups[0].remaining, 2);
        assert_eq!(groups[1].item.key, "lb");
        assert_eq!(groups[1].remaining, 0);
        assert!(groups.iter().all(|g| g.loader == 1));
    }
}
