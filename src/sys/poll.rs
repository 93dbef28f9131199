//! The default injectable poll primitive (spec section 6), a thin wrapper
//! around `poll(2)` in the style of the teacher's `poll/mod.rs` free
//! function — no selector object, no registration bookkeeping, just an
//! array in, an array out.

use std::convert::TryInto;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;
use std::time::Instant;

use crate::ready::Ready;

/// Spec section 6's "optional debug variable [that] enables verbose poll
/// logging (records, timeout, elapsed time, received bits per
/// descriptor)". Read once and cached, matching `TimerSource`'s own
/// lazily-cached env lookup.
fn debug_poll_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("EVENTCORE_DEBUG_POLL").is_some())
}

/// One slot of the flattened poll array: a descriptor, what was asked of
/// it, and what came back.
#[derive(Clone, Copy, Debug)]
pub struct PollEntry {
    pub fd: RawFd,
    pub requested: Ready,
    pub received: Ready,
}

impl PollEntry {
    pub fn new(fd: RawFd, requested: Ready) -> PollEntry {
        PollEntry {
            fd,
            requested,
            received: Ready::empty(),
        }
    }
}

fn ready_to_poll_events(ready: Ready) -> libc::c_short {
    let mut events = 0;
    if ready.is_readable() {
        events |= libc::POLLIN;
    }
    if ready.is_writable() {
        events |= libc::POLLOUT;
    }
    if ready.is_priority() {
        events |= libc::POLLPRI;
    }
    events as libc::c_short
}

fn poll_revents_to_ready(revents: libc::c_short) -> Ready {
    let revents = revents as libc::c_int;
    let mut ready = Ready::empty();
    if revents & libc::POLLIN != 0 {
        ready.insert(Ready::readable());
    }
    if revents & libc::POLLOUT != 0 {
        ready.insert(Ready::writable());
    }
    if revents & libc::POLLPRI != 0 {
        ready.insert(Ready::priority());
    }
    if revents & libc::POLLERR != 0 {
        ready.insert(Ready::error());
    }
    if revents & libc::POLLHUP != 0 {
        ready.insert(Ready::hangup());
    }
    if revents & libc::POLLNVAL != 0 {
        ready.insert(Ready::invalid());
    }
    ready
}

/// Classic `poll`-style contract (spec section 6): fill in `received` for
/// every entry and return the count with any bit set, or `-1`/`Err` on
/// failure. `timeout_ms` of `-1` blocks indefinitely, `0` never blocks.
///
/// `EINTR` is absorbed here and reported as zero readiness, matching the
/// error taxonomy in spec section 7 — callers never see it as an error.
pub fn poll(entries: &mut [PollEntry], timeout_ms: i32) -> io::Result<i32> {
    let verbose = debug_poll_enabled();
    let started = verbose.then(Instant::now);
    if verbose {
        log::debug!(target: "eventcore", "poll: {} records, timeout={}ms", entries.len(), timeout_ms);
    }

    let mut pollfds: Vec<libc::pollfd> = entries
        .iter()
        .map(|e| libc::pollfd {
            fd: e.fd,
            events: ready_to_poll_events(e.requested),
            revents: 0,
        })
        .collect();

    let nfds: libc::nfds_t = pollfds.len().try_into().expect("too many descriptors for poll(2)");

    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), nfds, timeout_ms) };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            for entry in entries.iter_mut() {
                entry.received = Ready::empty();
            }
            if verbose {
                log::debug!(target: "eventcore", "poll: interrupted, treating as zero readiness");
            }
            return Ok(0);
        }
        return Err(err);
    }

    for (entry, pollfd) in entries.iter_mut().zip(pollfds.iter()) {
        entry.received = poll_revents_to_ready(pollfd.revents).filter_received(entry.requested);
    }

    if let Some(started) = started {
        log::debug!(target: "eventcore", "poll: returned {} ready after {:?}", ret, started.elapsed());
        for entry in entries.iter() {
            if !entry.received.is_empty() {
                log::debug!(target: "eventcore", "poll: fd {} received {:?}", entry.fd, entry.received);
            }
        }
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn empty_array_with_zero_timeout_returns_immediately() {
        let mut entries: Vec<PollEntry> = Vec::new();
        let n = poll(&mut entries, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn pipe_write_end_is_writable() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut entries = vec![PollEntry::new(write_fd, Ready::writable())];
        let n = poll(&mut entries, 0).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].received.is_writable());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn closed_fd_reports_invalid() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = file.as_raw_fd();
        drop(file);

        let mut entries = vec![PollEntry::new(fd, Ready::readable())];
        let n = poll(&mut entries, 0).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].received.is_invalid());
    }
}
