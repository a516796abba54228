// src/server/summary.rs
//! End-of-run report and exit status

use crate::worker::WorkerRecord;
use std::fmt;
use std::time::Duration;

/// Everything the master prints once a run ends
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub records: Vec<WorkerRecord>,
    pub timed_out: bool,
    pub elapsed: Duration,

    /// Root items dropped because their key was already queued this run
    pub duplicates: u64,
}

impl RunSummary {
    pub fn new(mut records: Vec<WorkerRecord>, timed_out: bool, elapsed: Duration) -> Self {
        records.sort_by(|a, b| (&a.host, a.num, a.pid).cmp(&(&b.host, b.num, b.pid)));
        Self {
            records,
            timed_out,
            elapsed,
            duplicates: 0,
        }
    }

    pub fn with_duplicates(mut self, duplicates: u64) -> Self {
        self.duplicates = duplicates;
        self
    }

    /// 0 only if every worker exited cleanly and nothing stalled
    pub fn exit_code(&self) -> i32 {
        if !self.timed_out && self.records.iter().all(WorkerRecord::succeeded) {
            0
        } else {
            1
        }
    }

    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.iter().filter(|r| !r.succeeded())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            let status = match record.exit_status {
                Some(code) => code.to_string(),
                None => "signal".to_string(),
            };
            write!(
                f,
                "[{:>2}] {} ({} root items) in {:.2}s, pid {}, exit {}",
                record.num,
                record.summary.as_deref().unwrap_or("no summary"),
                record.stats.len(),
                record.elapsed_secs(),
                record.pid,
                status
            )?;
            if let Some(host) = record.short_host() {
                write!(f, " on {}", host)?;
            }
            writeln!(f)?;
        }

        if self.timed_out {
            writeln!(f, "Run stalled: no worker activity, outstanding workers marked failed")?;
        }
        if self.duplicates > 0 {
            writeln!(f, "Skipped {} duplicate root items", self.duplicates)?;
        }

        let failures: Vec<&WorkerRecord> = self
            .failed_workers()
            .filter(|r| r.failure_output.is_some())
            .collect();
        if !failures.is_empty() {
            writeln!(f, "\nFailures:")?;
            for record in failures {
                writeln!(f, "\n-- worker {} (pid {}) --", record.num, record.pid)?;
                writeln!(f, "{}", record.failure_output.as_deref().unwrap_or_default())?;
            }
        }

        write!(
            f,
            "Finished in {:.2}s with {} workers, {} failed",
            self.elapsed.as_secs_f64(),
            self.records.len(),
            self.failed_workers().count()
        )
    }
}
