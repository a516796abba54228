// src/relay/mod.rs
//! Relays let one queue span a fleet: each secondary host registers its
//! local worker count with the root master and forwards its workers' POPs.

pub mod client;

pub use client::{local_hostname, RelayClient, RelayConfig};
