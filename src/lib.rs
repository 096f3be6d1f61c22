//! frame-echo: a length-prefixed echo server and load-generating client
//!
//! - `protocol`: 12-byte big-endian frame header codec
//! - `runtime`: mio server (worker threads, connection registry, handler)
//! - `client`: tokio load client with per-phase timeout and retry
//! - `stats`: shared atomic counters and the final report
//! - `config`: CLI arguments merged over an optional TOML file

pub mod client;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod stats;
