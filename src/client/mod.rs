//! Load-generating echo client.
//!
//! Opens many connections in parallel, each running a fixed number of
//! request/response cycles and verifying every echo. Runs on a
//! multi-threaded tokio runtime; the only shared state is `Arc<Stats>` and
//! the cancellation flag.

mod worker;

pub use worker::{exchange, ConnectionWorker};

use crate::config::ClientConfig;
use crate::protocol::{FrameError, PAYLOAD_PATTERN};
use crate::stats::{Report, Stats};
use bytes::Bytes;
use chrono::Local;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

/// How long, and how many times, to wait for one phase of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Total budget for the phase, measured from its start.
    pub window: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, window: Duration) -> Self {
        Self { attempts, window }
    }

    /// Wait granted to a single attempt.
    pub fn per_attempt(&self) -> Duration {
        self.window / self.attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Ways an echo can fail to match what was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    /// Echoed header was malformed.
    Frame(FrameError),
    MessageId { expected: u32, found: u32 },
    Length { expected: usize, found: u32 },
    /// First differing payload byte.
    Payload { offset: usize },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::Frame(e) => write!(f, "{e}"),
            Mismatch::MessageId { expected, found } => {
                write!(f, "message id mismatch: expected {expected}, got {found}")
            }
            Mismatch::Length { expected, found } => {
                write!(f, "length mismatch: expected {expected}, got {found}")
            }
            Mismatch::Payload { offset } => write!(f, "payload differs at byte {offset}"),
        }
    }
}

/// Client-side connection errors.
#[derive(Debug)]
pub enum ClientError {
    /// Could not establish the connection.
    Transport(io::Error),
    /// Echo did not match the request.
    Protocol(Mismatch),
    /// Phase window or attempts exhausted.
    Timeout(&'static str),
    /// Zero-length read while waiting for a reply.
    PeerClosed(&'static str),
    Io(io::Error),
    /// Run was cancelled; not counted as an error.
    Cancelled,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "connect failed: {e}"),
            ClientError::Protocol(m) => write!(f, "protocol violation: {m}"),
            ClientError::Timeout(phase) => write!(f, "timed out waiting for {phase}"),
            ClientError::PeerClosed(phase) => write!(f, "server closed during {phase}"),
            ClientError::Io(e) => write!(f, "I/O error: {e}"),
            ClientError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Transport(e) | ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<Mismatch> for ClientError {
    fn from(m: Mismatch) -> Self {
        ClientError::Protocol(m)
    }
}

/// Drives `config.connections` connection workers to completion.
pub struct EchoClient {
    config: ClientConfig,
    stats: Arc<Stats>,
}

impl EchoClient {
    pub fn new(config: ClientConfig, stats: Arc<Stats>) -> Self {
        Self { config, stats }
    }

    /// Run every connection and summarize.
    ///
    /// Setting `cancel` to `true` stops new connections and ends running
    /// ones at their next check.
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Report {
        let config = &self.config;
        let started_at = Local::now();
        let start = Instant::now();

        info!(
            host = %config.host,
            port = config.port,
            connections = config.connections,
            messages = config.messages_per_conn,
            size = config.message_size,
            concurrency = config.concurrency,
            "Starting load test"
        );

        let permits = Arc::new(Semaphore::new(config.concurrency));
        let payload = Bytes::from(vec![PAYLOAD_PATTERN; config.message_size]);
        let mut tasks = JoinSet::new();
        let mut attempted = 0;

        for index in 0..config.connections {
            if *cancel.borrow() {
                break;
            }
            if index > 0 && config.ramp_batch > 0 && index % config.ramp_batch == 0 {
                tokio::time::sleep(config.ramp_pause).await;
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let worker = ConnectionWorker::new(
                index,
                config,
                payload.clone(),
                Arc::clone(&self.stats),
                cancel.clone(),
            );
            tasks.spawn(async move {
                let _permit = permit;
                worker.run().await;
            });
            attempted += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection worker failed");
                self.stats.record_error();
            }
        }

        Report {
            started_at,
            elapsed: start.elapsed(),
            attempted,
            totals: self.stats.snapshot(),
        }
    }
}
