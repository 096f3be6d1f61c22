//! Per-connection echo state machine.
//!
//! Driven by readiness events from the event loop. Each call runs the
//! connection forward as far as the socket allows, then parks it:
//!
//! ```text
//! Idle -> AwaitHeader -> (validate) -> AwaitPayload -> Echo -> (drain) -> Idle
//! ```
//!
//! The handler never blocks or sleeps. `WouldBlock` parks the connection
//! until the next readiness event; phase deadlines are enforced by the
//! event loop's sweep via [`check_deadline`]. Any error means teardown, which
//! the caller performs exactly once.

use crate::protocol::{FrameError, FrameHeader, HEADER_LEN};
use crate::runtime::connection::{ConnPhase, Connection};
use crate::stats::Stats;
use mio::{Interest, Token};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Limits applied to every connection on a worker.
#[derive(Debug, Clone, Copy)]
pub struct HandlerLimits {
    pub max_payload: usize,
    /// Deadline for the rest of a header once its first byte arrived.
    pub header_timeout: Duration,
    /// Deadline for the payload (and for writing the echo back).
    pub payload_timeout: Duration,
    /// Discard bytes left on the socket after each echo.
    pub drain_trailing: bool,
}

/// Where the handler left the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting for readiness; `deadline` is the current phase deadline.
    Parked { deadline: Option<Instant> },
    /// Peer closed cleanly between frames.
    Finished,
}

/// Reasons a connection is torn down.
#[derive(Debug)]
pub enum HandlerError {
    /// Bad magic or length; never echoed.
    Protocol(FrameError),
    /// Phase deadline passed.
    Timeout(&'static str),
    /// Zero-length read in the middle of a frame.
    PeerClosed(&'static str),
    /// Socket error other than `WouldBlock`.
    Io(io::Error),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Protocol(e) => write!(f, "protocol violation: {e}"),
            HandlerError::Timeout(phase) => write!(f, "timed out waiting for {phase}"),
            HandlerError::PeerClosed(phase) => write!(f, "peer closed during {phase}"),
            HandlerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Protocol(e) => Some(e),
            HandlerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HandlerError {
    fn from(e: io::Error) -> Self {
        HandlerError::Io(e)
    }
}

impl From<FrameError> for HandlerError {
    fn from(e: FrameError) -> Self {
        HandlerError::Protocol(e)
    }
}

enum ReadStatus {
    Data(usize),
    Eof,
    WouldBlock,
}

fn read_some(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadStatus> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(ReadStatus::Eof),
            Ok(n) => return Ok(ReadStatus::Data(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadStatus::WouldBlock)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Run the connection forward until it would block.
///
/// Must be called with the connection's lock held, from the worker whose
/// poll owns `token`.
pub fn handle_ready(
    conn: &mut Connection,
    poll: &mio::Registry,
    token: Token,
    limits: &HandlerLimits,
    stats: &Stats,
) -> Result<Status, HandlerError> {
    loop {
        let Some(stream) = conn.stream.as_mut() else {
            return Ok(Status::Finished);
        };
        let now = Instant::now();
        check_deadline(&conn.phase, now)?;

        match conn.phase {
            ConnPhase::Closed => return Ok(Status::Finished),

            ConnPhase::Idle => match read_some(stream, &mut conn.buffer[..HEADER_LEN])? {
                ReadStatus::Data(n) => {
                    conn.phase = ConnPhase::AwaitHeader {
                        filled: n,
                        deadline: now + limits.header_timeout,
                    };
                }
                ReadStatus::Eof => return Ok(Status::Finished),
                ReadStatus::WouldBlock => return park(conn, poll, token, Interest::READABLE),
            },

            ConnPhase::AwaitHeader { filled, deadline } if filled < HEADER_LEN => {
                match read_some(stream, &mut conn.buffer[filled..HEADER_LEN])? {
                    ReadStatus::Data(n) => {
                        conn.phase = ConnPhase::AwaitHeader {
                            filled: filled + n,
                            deadline,
                        };
                    }
                    ReadStatus::Eof => return Err(HandlerError::PeerClosed("header")),
                    ReadStatus::WouldBlock => return park(conn, poll, token, Interest::READABLE),
                }
            }

            ConnPhase::AwaitHeader { .. } => {
                let (header, length) = validate_header(&conn.buffer, limits.max_payload)?;
                trace!(
                    conn_id = conn.id(),
                    message_id = header.message_id,
                    length,
                    "Header accepted"
                );
                conn.phase = ConnPhase::AwaitPayload {
                    header,
                    length,
                    filled: 0,
                    deadline: now + limits.payload_timeout,
                };
            }

            ConnPhase::AwaitPayload {
                header,
                length,
                filled,
                deadline,
            } => {
                if filled == length {
                    stats.record_received();
                    let slot = header_slot(&mut conn.buffer)?;
                    header.encode_into(slot);
                    conn.phase = ConnPhase::Echo {
                        written: 0,
                        total: HEADER_LEN + length,
                        deadline: now + limits.payload_timeout,
                    };
                    continue;
                }

                let start = HEADER_LEN + filled;
                let end = HEADER_LEN + length;
                match read_some(stream, &mut conn.buffer[start..end])? {
                    ReadStatus::Data(n) => {
                        conn.phase = ConnPhase::AwaitPayload {
                            header,
                            length,
                            filled: filled + n,
                            deadline,
                        };
                    }
                    ReadStatus::Eof => return Err(HandlerError::PeerClosed("payload")),
                    ReadStatus::WouldBlock => return park(conn, poll, token, Interest::READABLE),
                }
            }

            ConnPhase::Echo {
                written,
                total,
                deadline,
            } => {
                if written == total {
                    stats.record_sent();
                    conn.phase = ConnPhase::Idle;
                    if !limits.drain_trailing {
                        // Edge-triggered: a queued frame won't raise a new event.
                        continue;
                    }
                    let (discarded, eof) = drain_trailing(stream, &mut conn.buffer)?;
                    if discarded > 0 {
                        debug!(conn_id = conn.id(), discarded, "Discarded trailing bytes");
                    }
                    if eof {
                        return Ok(Status::Finished);
                    }
                    return park(conn, poll, token, Interest::READABLE);
                }

                match stream.write(&conn.buffer[written..total]) {
                    Ok(0) => {
                        let e = io::Error::new(io::ErrorKind::WriteZero, "write returned 0");
                        return Err(e.into());
                    }
                    Ok(n) => {
                        conn.phase = ConnPhase::Echo {
                            written: written + n,
                            total,
                            deadline,
                        };
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return park(conn, poll, token, Interest::WRITABLE)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

/// Fail with `Timeout` if the phase deadline has passed.
pub fn check_deadline(phase: &ConnPhase, now: Instant) -> Result<(), HandlerError> {
    match phase.deadline() {
        Some(deadline) if now >= deadline => Err(HandlerError::Timeout(phase.name())),
        _ => Ok(()),
    }
}

fn header_slot(buffer: &mut [u8]) -> Result<&mut [u8; HEADER_LEN], HandlerError> {
    buffer.first_chunk_mut::<HEADER_LEN>().ok_or_else(|| {
        HandlerError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame buffer smaller than header",
        ))
    })
}

/// Decode and bounds-check the buffered header.
///
/// The bound is the smaller of the configured maximum and the buffer's
/// payload area.
fn validate_header(
    buffer: &[u8],
    max_payload: usize,
) -> Result<(FrameHeader, usize), HandlerError> {
    let slot = buffer.first_chunk::<HEADER_LEN>().ok_or_else(|| {
        HandlerError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame buffer smaller than header",
        ))
    })?;
    let header = FrameHeader::decode(slot)?;
    let max = max_payload.min(buffer.len() - HEADER_LEN);
    let length = header.validate(max)?;
    Ok((header, length))
}

/// Read and discard whatever is already buffered on the socket.
///
/// Returns the number of bytes discarded and whether the peer closed.
fn drain_trailing(stream: &mut impl Read, scratch: &mut [u8]) -> io::Result<(usize, bool)> {
    let mut discarded = 0;
    loop {
        match read_some(stream, scratch)? {
            ReadStatus::Data(n) => discarded += n,
            ReadStatus::Eof => return Ok((discarded, true)),
            ReadStatus::WouldBlock => return Ok((discarded, false)),
        }
    }
}

/// Re-arm the connection for `interest` and report its deadline.
fn park(
    conn: &mut Connection,
    poll: &mio::Registry,
    token: Token,
    interest: Interest,
) -> Result<Status, HandlerError> {
    if conn.interest != interest {
        if let Some(stream) = conn.stream.as_mut() {
            poll.reregister(stream, token, interest)?;
        }
        conn.interest = interest;
    }
    Ok(Status::Parked {
        deadline: conn.phase.deadline(),
    })
}
