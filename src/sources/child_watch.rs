//! Child-process-termination source (spec section 4.7). Watches one pid
//! and dispatches exactly once with its reaped wait status.
//!
//! The original design's preferred mechanism is a `pidfd`, falling back to
//! `SIGCHLD` plus a reaping `waitpid`. We implement only the fallback: a
//! process-global `SIGCHLD` flag (the async-signal-safe building block
//! `signal-hook` itself recommends) backs every child watch's cheap
//! non-blocking reap attempt. Tracked as an open question resolution in
//! DESIGN.md — a `pidfd`-based fast path can be added later without
//! changing this type's public surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use once_cell::sync::Lazy;

use crate::clock::Micros;
use crate::source::{Callback, DispatchAction, Source, SourceImpl, PRIORITY_HIGH};

/// Set (indirectly, by `signal-hook`) whenever the process observes a
/// `SIGCHLD`. Every watch does its own `waitpid(WNOHANG)` off the back of
/// it rather than trying to demultiplex which child exited from the
/// signal alone, since a single `SIGCHLD` can coalesce multiple exits.
static SIGCHLD_FLAG: Lazy<Arc<AtomicBool>> = Lazy::new(|| {
    let flag = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(libc::SIGCHLD, flag.clone()) {
        log::warn!(target: "eventcore", "failed to register SIGCHLD handler: {e}");
    }
    flag
});

pub struct ChildWatchSource {
    pid: Pid,
    status: Mutex<Option<WaitStatus>>,
}

impl ChildWatchSource {
    fn try_reap(&self) -> bool {
        if self.status.lock().unwrap().is_some() {
            return true;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => {
                *self.status.lock().unwrap() = Some(status);
                true
            }
            Err(_) => false,
        }
    }
}

impl SourceImpl for ChildWatchSource {
    fn prepare(&self, _source: &Source, _now: Micros) -> (bool, Option<i64>) {
        // Always attempt a reap: SIGCHLD may have arrived and been
        // consumed by another watch's flag-read race before we saw it.
        // 50ms is the fallback poll period if the signal is ever missed
        // entirely (e.g. a signal mask change elsewhere in the process).
        if self.try_reap() {
            (true, None)
        } else {
            (false, Some(50_000))
        }
    }

    fn check(&self, _source: &Source) -> bool {
        // Only bother reaping if a SIGCHLD actually landed since the last
        // check; `prepare`'s own unconditional reap (with its 50ms
        // fallback timeout) still covers a coalesced or missed signal.
        if !SIGCHLD_FLAG.swap(false, Ordering::AcqRel) {
            return self.status.lock().unwrap().is_some();
        }
        self.try_reap()
    }

    fn dispatch(&self, _source: &Source, callback: &mut Option<Callback>) -> DispatchAction {
        if let Some(status) = self.status.lock().unwrap().take() {
            if let Some(Callback::ChildExit(f)) = callback {
                f(self.pid, status);
            }
        }
        // A child only ever exits once; never re-dispatch (spec section 4.7).
        DispatchAction::Remove
    }

    fn kind_name(&self) -> &'static str {
        "child-watch"
    }
}

impl ChildWatchSource {
    pub fn new(pid: Pid, callback: impl FnMut(Pid, WaitStatus) + Send + 'static) -> Arc<Source> {
        Lazy::force(&SIGCHLD_FLAG);

        let source = Source::new(ChildWatchSource { pid, status: Mutex::new(None) });
        source.set_callback(Callback::ChildExit(Box::new(callback)));
        source.set_priority(PRIORITY_HIGH);
        source.set_name(format!("child-watch[{pid}]"));
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicBool as StdAtomicBool, Ordering as StdOrdering};
    use std::time::{Duration, Instant};

    #[test]
    fn watch_dispatches_once_for_an_already_forked_short_lived_child() {
        // `true` is close to universally present and exits immediately.
        let child = std::process::Command::new("true").spawn();
        let Ok(child) = child else {
            return; // environment without /usr/bin/true; nothing to assert.
        };
        let pid = Pid::from_raw(child.id() as i32);

        let ctx = Context::new().unwrap();
        let dispatched = Arc::new(StdAtomicBool::new(false));
        let dispatched2 = dispatched.clone();

        let watch = ChildWatchSource::new(pid, move |_pid, _status| {
            dispatched2.store(true, StdOrdering::SeqCst);
        });
        let id = watch.attach(&ctx);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !dispatched.load(StdOrdering::SeqCst) && Instant::now() < deadline {
            ctx.iteration(true);
        }

        assert!(dispatched.load(StdOrdering::SeqCst));
        assert!(ctx.find_source(id).is_none());
    }
}
