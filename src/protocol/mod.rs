// src/protocol/mod.rs
//! Wire protocol between workers, relays, and the root master
//!
//! ```text
//!   worker ──POP──►  relay ──POP (verbatim)──►  root master
//!   worker ◄─item──  relay ◄──────item────────  root master
//!                    relay ──SLAVE / WORKER───► root master
//! ```
//!
//! One request per connection. The server closes the connection after
//! answering, or without answering once the run is over.

pub mod command;
pub mod transport;

pub use command::{PopReply, Registration, Request, MAX_LINE, MAX_PAYLOAD};
pub use transport::{BlockingConnection, Connection, Endpoint, Listener};
