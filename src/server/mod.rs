// src/server/mod.rs
//! Root master: queue ownership, request handling, stall detection, and
//! the end-of-run summary.

pub mod queue_server;
pub mod summary;

pub use queue_server::{QueueServer, RunOutcome, ServerConfig};
pub use summary::RunSummary;
