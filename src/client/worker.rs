//! One client connection: connect, then send/verify a fixed number of frames.

use super::{ClientError, Mismatch, RetryPolicy};
use crate::config::ClientConfig;
use crate::protocol::{encode_frame, FrameHeader, HEADER_LEN};
use crate::stats::Stats;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Runs the request/response loop for a single connection.
pub struct ConnectionWorker {
    index: usize,
    host: String,
    port: u16,
    messages: u32,
    connect_timeout: Duration,
    retry: RetryPolicy,
    message_delay: Duration,
    payload: Bytes,
    stats: Arc<Stats>,
    cancel: watch::Receiver<bool>,
}

impl ConnectionWorker {
    pub fn new(
        index: usize,
        config: &ClientConfig,
        payload: Bytes,
        stats: Arc<Stats>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            index,
            host: config.host.clone(),
            port: config.port,
            messages: config.messages_per_conn,
            connect_timeout: config.connect_timeout,
            retry: config.retry,
            message_delay: config.message_delay,
            payload,
            stats,
            cancel,
        }
    }

    /// Connect and run every message cycle.
    ///
    /// Each failure counts one error and ends this connection; other
    /// connections are unaffected.
    pub async fn run(self) {
        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(conn = self.index, error = %e, "Connection failed");
                self.stats.record_error();
                return;
            }
        };
        self.stats.record_connection();
        let _ = stream.set_nodelay(true);

        for message_id in 0..self.messages {
            if *self.cancel.borrow() {
                break;
            }

            match exchange(
                &mut stream,
                message_id,
                &self.payload,
                &self.retry,
                &self.cancel,
                &self.stats,
            )
            .await
            {
                Ok(rtt) => {
                    trace!(
                        conn = self.index,
                        message_id,
                        rtt_us = rtt.as_micros() as u64,
                        "Echo verified"
                    );
                }
                Err(ClientError::Cancelled) => break,
                Err(e) => {
                    warn!(conn = self.index, message_id, error = %e, "Message failed");
                    self.stats.record_error();
                    break;
                }
            }

            let last = message_id + 1 == self.messages;
            if !last && !self.message_delay.is_zero() {
                tokio::time::sleep(self.message_delay).await;
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!(conn = self.index, error = %e, "Shutdown failed");
        }
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ClientError::Transport(e)),
            Err(_) => Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }
}

/// Send one frame and verify its echo.
///
/// Counts `sent` once the frame is written and `received` (with the round
/// trip) once the echo checks out. Returns the round-trip time.
pub async fn exchange<S>(
    stream: &mut S,
    message_id: u32,
    payload: &[u8],
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
    stats: &Stats,
) -> Result<Duration, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len()).map_err(|_| {
        ClientError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload too large for a frame",
        ))
    })?;
    let frame = encode_frame(&FrameHeader::new(length, message_id), payload);

    let start = Instant::now();
    let send = async {
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok::<_, io::Error>(())
    };
    tokio::select! {
        sent = tokio::time::timeout(policy.window, send) => match sent {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout("send")),
        },
        () = cancelled(cancel) => return Err(ClientError::Cancelled),
    }
    stats.record_sent();

    let mut header = [0u8; HEADER_LEN];
    read_with_retry(stream, &mut header, policy, cancel, "header").await?;
    let echoed = FrameHeader::decode(&header).map_err(Mismatch::Frame)?;
    if echoed.message_id != message_id {
        return Err(Mismatch::MessageId {
            expected: message_id,
            found: echoed.message_id,
        }
        .into());
    }
    if echoed.payload_length as usize != payload.len() {
        return Err(Mismatch::Length {
            expected: payload.len(),
            found: echoed.payload_length,
        }
        .into());
    }

    let mut body = vec![0u8; payload.len()];
    read_with_retry(stream, &mut body, policy, cancel, "payload").await?;
    if let Some(offset) = body.iter().zip(payload).position(|(a, b)| a != b) {
        return Err(Mismatch::Payload { offset }.into());
    }

    let rtt = start.elapsed();
    stats.record_round_trip(rtt);
    stats.record_received();
    Ok(rtt)
}

/// Resolves once `cancel` is set; never, if the sender is gone.
async fn cancelled(cancel: &watch::Receiver<bool>) {
    let mut cancel = cancel.clone();
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Fill `buf`, waiting at most `policy.per_attempt()` per attempt.
///
/// An attempt that sees no data is retried; the phase fails once the attempts
/// or the window run out.
async fn read_with_retry<S>(
    stream: &mut S,
    buf: &mut [u8],
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
    phase: &'static str,
) -> Result<(), ClientError>
where
    S: AsyncRead + Unpin,
{
    let started = Instant::now();
    let mut filled = 0;
    let mut idle_attempts = 0;

    while filled < buf.len() {
        if *cancel.borrow() {
            return Err(ClientError::Cancelled);
        }
        let elapsed = started.elapsed();
        if idle_attempts >= policy.attempts || elapsed >= policy.window {
            return Err(ClientError::Timeout(phase));
        }

        let wait = policy.per_attempt().min(policy.window - elapsed);
        match tokio::time::timeout(wait, stream.read(&mut buf[filled..])).await {
            Err(_) => {
                idle_attempts += 1;
                trace!(phase, attempt = idle_attempts, "No data yet");
            }
            Ok(Ok(0)) => return Err(ClientError::PeerClosed(phase)),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return Err(ClientError::Io(e)),
        }
    }
    Ok(())
}
