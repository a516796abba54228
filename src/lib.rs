// src/lib.rs
//! distq work distribution library
//!
//! Splits a forest of grouped work items across local worker processes
//! and, through relays, across hosts.
//!
//! # Architecture
//!
//! - **tree**: work items, tags, and the shared queue with group splitting
//! - **protocol**: line-framed request/reply codec over Unix or TCP sockets
//! - **server**: the root master loop, stall detection, run summary
//! - **relay**: sub-master proxying a secondary host's workers
//! - **worker**: the pull client, process supervision, worker records
//! - **populator**: background discovery streaming groups into the tree
//! - **stats**: historical durations used for ordering
//! - **collaborator**: the seam to whatever actually enumerates and runs items
//! - **runner**: wires the above into a single `distq run`
//! - **observability**: tracing and metrics
//! - **utils**: configuration and errors

pub mod collaborator;
pub mod observability;
pub mod populator;
pub mod protocol;
pub mod relay;
pub mod runner;
pub mod server;
pub mod stats;
pub mod tree;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use collaborator::{ExecutionCollaborator, ManifestCollaborator, Outcome};
pub use runner::Runner;
pub use tree::{Assignment, WorkItem, WorkTree};
pub use utils::config::QueueConfig;
pub use utils::errors::{QueueError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
