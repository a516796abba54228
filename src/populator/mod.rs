// src/populator/mod.rs
//! Background discovery of work items
//!
//! ```text
//!  master ──spawn──▶ distq discover --loader 0 a.json c.json
//!         ──spawn──▶ distq discover --loader 1 b.json d.json
//!
//!  loader stdout ─▶ EagerReader ─▶ BackgroundPopulator::poll ─▶ WorkTree
//! ```
//!
//! The master starts serving as soon as the first root item arrives. A root
//! POP that finds nothing while loaders are still running is answered with
//! `wait` instead of ending the run.

pub mod background;
pub mod discovery;
pub mod eager;

pub use background::BackgroundPopulator;
pub use discovery::run_discovery;
pub use eager::{EagerReader, EagerWriter, Shift};

use crate::tree::WorkItem;
use serde::{Deserialize, Serialize};

/// One root item as streamed from a loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredGroup {
    pub loader: usize,

    /// Sources this loader has yet to enumerate
    pub remaining: usize,

    pub source: String,

    pub item: WorkItem,
}
