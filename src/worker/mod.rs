// src/worker/mod.rs
//! Worker processes
//!
//! - **Record**: what the master keeps per worker slot, local or remote
//! - **Supervisor**: spawning, reaping, and killing local worker processes
//! - **Iterator**: the loop that runs inside each worker process
//!
//! Workers hand results back through two pid-namespaced files in the
//! scratch directory, read once by the supervisor and then deleted.

pub mod iterator;
pub mod record;
pub mod supervisor;

pub use iterator::{redirect_output, run_worker, PopSource, RemoteQueue, WorkItemClient};
pub use record::WorkerRecord;
pub use supervisor::{output_path, stats_path, SpawnConfig, WorkerSupervisor};
