// src/stats/mod.rs
//! Historical durations
//!
//! Durations only ever order work (longest first); they never cause an item
//! to be skipped.

pub mod store;

pub use store::{accumulate, StatsFile, StatsMap, StatsStore};
