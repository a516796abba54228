// src/collaborator/mod.rs
//! The seam between the engine and whatever actually runs work
//!
//! The engine only moves opaque key paths around. Enumerating the items a
//! source defines, executing one leaf, and running group setup/teardown are
//! all delegated to an [`ExecutionCollaborator`].

pub mod manifest;

pub use manifest::ManifestCollaborator;

use crate::stats::StatsFile;
use crate::tree::WorkItem;
use crate::utils::errors::Result;
use crate::worker::record::WorkerRecord;
use std::path::Path;

/// Lines a worker prints per executed leaf
pub const PASS_PREFIX: &str = "ok ";
pub const FAIL_PREFIX: &str = "FAILED ";

/// Longest failure excerpt kept per worker
const MAX_FAILURE_LINES: usize = 40;

/// Result of executing one leaf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,

    /// Free-form output, echoed into the worker's log on failure
    pub output: String,
}

impl Outcome {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Everything the engine needs from the outside world
pub trait ExecutionCollaborator: Send + Sync {
    /// Top-level items a source artifact defines
    fn enumerate(&self, source: &Path) -> Result<Vec<WorkItem>>;

    /// Run one leaf identified by its full key path
    fn execute(&self, source: Option<&str>, path: &[String]) -> Result<Outcome>;

    /// Called when a worker starts its slice of a group
    fn enter_group(&self, _source: Option<&str>, _scope: &[String]) -> Result<()> {
        Ok(())
    }

    /// Called when a worker finishes its slice of a group
    fn leave_group(&self, _source: Option<&str>, _scope: &[String]) -> Result<()> {
        Ok(())
    }

    fn estimated_duration(&self, stats: &StatsFile, key: &str) -> Option<f64> {
        stats.duration(key)
    }

    /// Fill in the summary line and failure excerpt of a reaped worker
    fn summarize_worker(&self, record: &mut WorkerRecord) {
        let passed = record.lines().filter(|l| l.starts_with(PASS_PREFIX)).count();
        let failed = record.lines().filter(|l| l.starts_with(FAIL_PREFIX)).count();
        record.summary = Some(format!("{} passed, {} failed", passed, failed));

        if failed > 0 {
            let excerpt: Vec<&str> = record
                .lines()
                .skip_while(|l| !l.starts_with(FAIL_PREFIX))
                .take(MAX_FAILURE_LINES)
                .collect();
            record.failure_output = Some(excerpt.join("\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    impl ExecutionCollaborator for Nothing {
        fn enumerate(&self, _source: &Path) -> Result<Vec<WorkItem>> {
            Ok(Vec::new())
        }

        fn execute(&self, _source: Option<&str>, _path: &[String]) -> Result<Outcome> {
            Ok(Outcome::passed(""))
        }
    }

    #[test]
    fn test_default_summary_counts_results() {
        let mut record = WorkerRecord::new(1, 1);
        record.output = "ok a > x\nFAILED a > y\nassertion failed\nok b\n".to_string();

        Nothing.summarize_worker(&mut record);
        assert_eq!(record.summary.as_deref(), Some("2 passed, 1 failed"));
        assert_eq!(
            record.failure_output.as_deref(),
            Some("FAILED a > y\nassertion failed\nok b")
        );
    }

    #[test]
    fn test_clean_worker_has_no_failure_excerpt() {
        let mut record = WorkerRecord::new(1, 1);
        record.output = "ok a\n".to_string();
        Nothing.summarize_worker(&mut record);
        assert!(record.failure_output.is_none());
    }
}
