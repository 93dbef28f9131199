//! Async signal notification source (spec section 4.7): turns a raw Unix
//! signal into an ordinary dispatch, via the same async-signal-safe
//! flag-setting building block `signal-hook` ships for exactly this.

use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::Micros;
use crate::source::{Callback, DispatchAction, Source, SourceImpl, PRIORITY_HIGH};

pub struct SignalWatchSource {
    signum: c_int,
    flag: Arc<AtomicBool>,
}

impl SourceImpl for SignalWatchSource {
    fn prepare(&self, _source: &Source, _now: Micros) -> (bool, Option<i64>) {
        (self.flag.load(Ordering::Acquire), None)
    }

    fn check(&self, _source: &Source) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn dispatch(&self, _source: &Source, callback: &mut Option<Callback>) -> DispatchAction {
        self.flag.store(false, Ordering::Release);
        match callback {
            Some(Callback::Plain(f)) => f(),
            _ => DispatchAction::Continue,
        }
    }

    fn kind_name(&self) -> &'static str {
        "signal-watch"
    }
}

impl SignalWatchSource {
    pub fn new(signum: c_int, callback: impl FnMut() -> DispatchAction + Send + 'static) -> io::Result<Arc<Source>> {
        let flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signum, flag.clone())?;

        let source = Source::new(SignalWatchSource { signum, flag });
        source.set_callback(Callback::Plain(Box::new(callback)));
        source.set_priority(PRIORITY_HIGH);
        source.set_name(format!("signal-watch[{signum}]"));
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::time::{Duration, Instant};

    #[test]
    fn fires_after_the_process_receives_the_registered_signal() {
        let ctx = Context::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let watch = SignalWatchSource::new(libc::SIGUSR1, move || {
            fired2.fetch_add(1, StdOrdering::SeqCst);
            DispatchAction::Continue
        })
        .unwrap();
        watch.attach(&ctx);

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.load(StdOrdering::SeqCst) == 0 && Instant::now() < deadline {
            ctx.iteration(true);
        }

        assert_eq!(fired.load(StdOrdering::SeqCst), 1);
    }
}
