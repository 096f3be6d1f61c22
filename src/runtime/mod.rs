//! Server runtime for the echo protocol.
//!
//! Readiness-based, built on mio (epoll on Linux, kqueue on macOS):
//! - `EchoServer`: worker threads, each with its own poll and listener
//! - `ConnectionRegistry`: slab of live connections plus their buffers
//! - `handle_ready`: the per-connection frame state machine
//! - `BufferPool`: recycled frame buffers

mod buffer;
mod connection;
mod event_loop;
mod handler;

pub use buffer::BufferPool;
pub use connection::{
    lock, ConnPhase, Connection, ConnectionRef, ConnectionRegistry, RegistryError,
};
pub use event_loop::{EchoServer, ServerError, ShutdownHandle};
pub use handler::{check_deadline, handle_ready, HandlerError, HandlerLimits, Status};

use tracing::{debug, warn};

/// Raise the open-file soft limit to the hard limit.
///
/// Every connection holds a descriptor on both sides, so large runs hit the
/// default soft limit quickly. Failure is logged and otherwise ignored.
#[cfg(unix)]
pub fn raise_fd_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit for the duration of the call.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "getrlimit failed");
        return;
    }
    if limit.rlim_cur >= limit.rlim_max {
        return;
    }

    let raised = libc::rlimit {
        rlim_cur: limit.rlim_max,
        rlim_max: limit.rlim_max,
    };
    // SAFETY: `raised` is a valid rlimit; the kernel only reads it.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "setrlimit failed");
        return;
    }
    debug!(from = limit.rlim_cur, to = raised.rlim_cur, "Raised open file limit");
}

#[cfg(not(unix))]
pub fn raise_fd_limit() {}
