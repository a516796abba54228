// src/utils/config.rs
//! Run configuration
//!
//! Values are layered: built-in defaults, then an optional `distq.toml`
//! (or `.yaml`/`.json`) in the working directory, then `DISTQ_*`
//! environment variables.

use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the run's durations are folded into the persisted stats file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Write only this run's durations
    Replace,

    /// Per-run totals (summed across workers) overwrite previous values
    Merge,

    /// Keep the larger of the previous and the new value
    #[serde(alias = "max")]
    KeepMax,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::Merge
    }
}

/// Configuration shared by the master, relays, and workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of local worker processes; 0 runs everything in-process
    pub concurrency: usize,

    /// Listening endpoint: a filesystem path or `[host:]port`
    pub socket: String,

    /// Root master to register with; presence turns this process into a relay
    pub relay: Option<String>,

    /// How long a relay keeps retrying the root master
    pub relay_timeout_secs: u64,

    /// Run token; generated when absent
    pub run_token: Option<String>,

    /// Free-form text a relay attaches to its registration
    pub relay_message: Option<String>,

    /// Seconds without any request before the run is declared stalled
    pub bad_worker_timeout_secs: u64,

    /// How many times one group may be re-enqueued for sharing
    pub max_splits_per_group: u32,

    /// Allow groups to be split across workers at all
    pub split_groups: bool,

    /// Historical durations file
    pub stats_file: PathBuf,

    /// Stats merge policy
    pub stats_mode: MergePolicy,

    /// Directory for per-worker output and stats files
    pub scratch_dir: PathBuf,

    /// Number of background discovery processes
    pub loaders: usize,

    /// Discover sources in background processes instead of up front
    pub lazy_discovery: bool,

    /// Restrict the run to these root keys, in this order
    pub force: Vec<String>,

    /// Tag (`name=value`) workers ask for before falling back to FIFO
    pub preferred_tag: Option<String>,

    /// Master loop readiness timeout in milliseconds
    pub poll_interval_ms: u64,

    /// Echo every worker's output, and log at debug level
    pub verbose: bool,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Prometheus exporter listen address
    pub metrics_addr: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            socket: format!("/tmp/distq_{}.sock", std::process::id()),
            relay: None,
            relay_timeout_secs: 30,
            run_token: None,
            relay_message: None,
            bad_worker_timeout_secs: 120,
            max_splits_per_group: 20,
            split_groups: true,
            stats_file: PathBuf::from(".distq_stats"),
            stats_mode: MergePolicy::default(),
            scratch_dir: std::env::temp_dir(),
            loaders: 2,
            lazy_discovery: true,
            force: Vec::new(),
            preferred_tag: None,
            poll_interval_ms: 100,
            verbose: false,
            json_logs: false,
            metrics_addr: None,
        }
    }
}

impl QueueConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name("distq").required(false))
            .add_source(
                Environment::with_prefix("DISTQ")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("force"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Relay target, unless it points back at our own socket
    pub fn relay_target(&self) -> Option<&str> {
        match self.relay.as_deref() {
            Some(relay) if relay == self.socket => {
                tracing::warn!("Relay target equals the local socket, disabling relay mode");
                None
            }
            other => other,
        }
    }

    /// Effective split bound; zero when splitting is disabled
    pub fn split_limit(&self) -> u32 {
        if self.split_groups {
            self.max_splits_per_group
        } else {
            0
        }
    }

    pub fn bad_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.bad_worker_timeout_secs)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
