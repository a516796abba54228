// src/worker/record.rs
//! What the master knows about one worker process

use crate::stats::StatsMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One worker slot, local or remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub pid: u32,

    /// 1-based slot number on its host; 0 for synthesized records
    pub num: usize,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    /// Exit code; `None` until reaped, or when killed by a signal
    pub exit_status: Option<i32>,

    /// Captured stdout and stderr
    #[serde(default)]
    pub output: String,

    /// Set for workers that ran behind a relay
    #[serde(default)]
    pub host: Option<String>,

    /// Per-key durations the worker measured
    #[serde(default)]
    pub stats: StatsMap,

    #[serde(default)]
    pub summary: Option<String>,

    #[serde(default)]
    pub failure_output: Option<String>,
}

impl WorkerRecord {
    pub fn new(pid: u32, num: usize) -> Self {
        Self {
            pid,
            num,
            start_time: Utc::now(),
            end_time: None,
            exit_status: None,
            output: String::new(),
            host: None,
            stats: StatsMap::new(),
            summary: None,
            failure_output: None,
        }
    }

    /// Failing stand-in for a worker slot that never reported back
    pub fn stalled(host: Option<String>) -> Self {
        let mut record = Self::new(0, 0);
        record.host = host;
        record.finish(Some(1));
        record
    }

    pub fn finish(&mut self, exit_status: Option<i32>) {
        self.exit_status = exit_status;
        self.end_time = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Wall-clock seconds between spawn and reap
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }

    /// First label of the host name, for summaries
    pub fn short_host(&self) -> Option<&str> {
        self.host.as_deref().and_then(|h| h.split('.').next())
    }
}
