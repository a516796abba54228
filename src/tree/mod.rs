// src/tree/mod.rs
//! Work item model and the master's splittable queue
//!
//! - **Item**: leaves, groups, tags, and the paths handed to workers
//! - **Work Tree**: root FIFO plus per-group sub-queues with bounded splitting
//!
//! # Dispatch
//!
//! ```text
//!  POP ─────────────▶ root queue ──▶ group G ──▶ leaf      => [G, leaf]
//!  POP EXAMPLE [G] ──▶ G.examples ──────────────▶ leaf     => [G, leaf]
//!  POP GROUP [G] ────▶ G.groups ──▶ group H ──▶ leaf       => [G, H, leaf]
//! ```
//!
//! A group popped through its parent is pushed back onto that parent while
//! it still has children, at most `max_splits` times, unless tagged
//! `no_split`.

pub mod item;
pub mod work_tree;

pub use item::{Assignment, ItemKind, TagFilter, Tags, WorkItem, NO_SPLIT};
pub use work_tree::{PopRequest, TreeStats, WorkTree, DEFAULT_MAX_SPLITS};
