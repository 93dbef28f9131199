//! The thin driver on top of [`crate::Context`] (spec section 4.6): owns
//! nothing the context doesn't already own, just loops calling
//! `iteration(true)` until told to stop.

use std::sync::Arc;

use crate::context::Context;

struct LoopInner {
    context: Context,
}

/// A run/quit wrapper around a [`Context`]. Cheap to clone, like `Context`
/// itself — clones share the same running flag.
#[derive(Clone)]
pub struct Loop(Arc<LoopInner>);

impl Loop {
    pub fn new(context: Context) -> Loop {
        Loop(Arc::new(LoopInner { context }))
    }

    pub fn with_default_context() -> Loop {
        Loop::new(Context::default())
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    /// Acquire the context, blocking until ownership is handed off if
    /// another thread currently holds it (spec section 4.5 step 1), and
    /// run iterations until [`Loop::quit`] is called.
    pub fn run(&self) {
        let _guard = self.0.context.acquire_blocking();

        self.0.context.set_running(true);
        while self.0.context.is_running() {
            self.0.context.iteration(true);
        }
    }

    pub fn quit(&self) {
        self.0.context.set_running(false);
        let _ = self.0.context.wakeup();
        // Spec section 4.6: "quit broadcasts the condition variable" so a
        // `run` blocked acquiring ownership elsewhere wakes and re-checks
        // rather than waiting for that owner's next `release`.
        self.0.context.broadcast_ownership_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.0.context.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Callback, DispatchAction, Source, SourceImpl};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct QuitAfterOne {
        loop_handle: Loop,
        fired: Arc<AtomicUsize>,
    }

    impl SourceImpl for QuitAfterOne {
        fn prepare(&self, _source: &Source, _now: i64) -> (bool, Option<i64>) {
            (true, None)
        }

        fn dispatch(&self, _source: &Source, _callback: &mut Option<Callback>) -> DispatchAction {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.loop_handle.quit();
            DispatchAction::Remove
        }

        fn kind_name(&self) -> &'static str {
            "quit-after-one"
        }
    }

    #[test]
    fn run_stops_after_quit_is_called() {
        let context = Context::new().unwrap();
        let loop_handle = Loop::new(context.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let source = Source::new(QuitAfterOne { loop_handle: loop_handle.clone(), fired: fired.clone() });
        source.attach(&context);

        loop_handle.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!loop_handle.is_running());
    }
}
