//! coverage-collector: method coverage ingestion server
//!
//! Instrumented application builds stream coverage reports to this server
//! over long-lived TCP connections. The server:
//! - Reassembles `\r\n\r\n`-terminated JSON frames from each connection
//! - Aggregates hit counters per application and per device
//! - Appends every raw report to a per-session trace file
//! - Reaps idle connections and shuts down on a bare delimiter handshake

pub mod config;
pub mod coverage;
pub mod frame;
pub mod ingest;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod trace;
pub mod worker;

pub use config::Config;
pub use coverage::{CoverageStore, DeviceKey};
pub use server::{Server, ServerState};
