//! Readiness waiting on a raw socket descriptor
//!
//! The concrete stream drives a non-blocking transport, so before every
//! send/receive attempt it parks the calling thread here until the
//! descriptor is ready for the requested direction. There is no timeout:
//! a stalled peer blocks the caller indefinitely, which is the accepted
//! contract of this layer.

use super::{Error, Result};
use std::io;
use std::os::fd::RawFd;

/// I/O direction to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Block until `fd` is ready for `dir` or has an error condition flagged.
///
/// Error conditions (`POLLERR`, `POLLHUP`) are always reported by poll and
/// end the wait; the subsequent send/receive attempt surfaces the actual
/// failure. A negative poll return is an OS-level error.
pub fn wait(fd: RawFd, dir: Direction) -> Result<()> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match dir {
            Direction::Read => POLLIN,
            Direction::Write => POLLOUT,
        },
        revents: 0,
    };

    // -1 = infinite
    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, -1) };

    if result < 0 {
        return Err(Error::Os(io::Error::last_os_error()));
    }

    Ok(())
}
