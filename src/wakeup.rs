//! Thread-safe edge-triggered notifier used to unblock a poll in progress
//! (spec section 4.2). Backed by an `eventfd(2)` counter, the way the
//! teacher's own `Waker`/`Awakener` types are.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::eventfd::EventFd;

/// A cheap, idempotent cross-thread wakeup. Not exposed to users of
/// [`crate::Context`] directly — it backs the context's own poll descriptor.
#[derive(Debug, Clone)]
pub struct Wakeup {
    inner: Arc<EventFd>,
}

impl Wakeup {
    pub fn new() -> io::Result<Wakeup> {
        Ok(Wakeup {
            inner: Arc::new(EventFd::new()?),
        })
    }

    /// Idempotent, cheap, safe to call with nobody waiting: the counter
    /// just accumulates and the next `poll` observes it immediately.
    pub fn signal(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain any pending notifications so the next poll doesn't spuriously
    /// wake on a stale signal.
    pub fn acknowledge(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ready::Ready;
    use crate::sys::poll::{poll, PollEntry};

    #[test]
    fn signal_then_poll_observes_readable() {
        let wakeup = Wakeup::new().unwrap();
        wakeup.signal().unwrap();

        let mut entries = vec![PollEntry::new(wakeup.as_raw_fd(), Ready::readable())];
        let n = poll(&mut entries, 0).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].received.is_readable());

        wakeup.acknowledge().unwrap();

        let mut entries = vec![PollEntry::new(wakeup.as_raw_fd(), Ready::readable())];
        let n = poll(&mut entries, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn signal_is_idempotent_under_repeated_calls() {
        let wakeup = Wakeup::new().unwrap();
        for _ in 0..16 {
            wakeup.signal().unwrap();
        }
        wakeup.acknowledge().unwrap();
    }
}
