//! Readiness primitive: a thin wrapper over `poll(2)`.
//!
//! `poll(2)` is level-triggered, which the dispatch loop depends on:
//! only one ready descriptor is serviced per poll call, and the ones
//! not chosen must be reported again by the next call.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::types::EventMask;

/// One descriptor that the poll reported ready, with the categories
/// that are ready on it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyFd {
    pub fd: RawFd,
    pub ready: EventMask,
}

fn interest_bits(mask: EventMask) -> libc::c_short {
    let mut events = 0;
    if mask.contains(EventMask::READABLE) {
        events |= libc::POLLIN;
    }
    if mask.contains(EventMask::WRITABLE) {
        events |= libc::POLLOUT;
    }
    // POLLERR/POLLHUP/POLLNVAL are always reported; ERRORED interest
    // needs no request bit.
    events
}

fn ready_mask(revents: libc::c_short) -> EventMask {
    let mut ready = EventMask::empty();
    // POLLHUP is delivered as readable so a registered read handler
    // observes EOF through a zero-byte read, and as errored so an
    // error handler (when one exists) wins the dispatch.
    if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
        ready |= EventMask::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= EventMask::WRITABLE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ready |= EventMask::ERRORED;
    }
    ready
}

/// Milliseconds for `poll(2)`, rounding up so a short timeout cannot
/// degenerate into a busy loop. `None` blocks indefinitely.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(d.subsec_nanos().div_ceil(1_000_000)));
            ms.min(libc::c_int::MAX as u64) as libc::c_int
        }
    }
}

/// Poll the given interests once. Returns the descriptors that became
/// ready (empty on timeout). Errors, including `EINTR`, are returned to
/// the caller undecorated.
pub(crate) fn poll(
    interests: &[(RawFd, EventMask)],
    timeout: Option<Duration>,
) -> io::Result<Vec<ReadyFd>> {
    let mut fds: Vec<libc::pollfd> = interests
        .iter()
        .map(|(fd, mask)| libc::pollfd {
            fd: *fd,
            events: interest_bits(*mask),
            revents: 0,
        })
        .collect();

    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fds
        .iter()
        .filter(|p| p.revents != 0)
        .map(|p| ReadyFd {
            fd: p.fd,
            ready: ready_mask(p.revents),
        })
        .collect())
}
