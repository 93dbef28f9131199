//! Idle source (spec section 4.7): always ready, runs at the lowest
//! urgency by default so it never starves descriptor or timer work.

use std::sync::Arc;

use crate::clock::Micros;
use crate::source::{Callback, DispatchAction, Source, SourceImpl, PRIORITY_DEFAULT_IDLE};

pub struct IdleSource {
    one_shot: bool,
}

impl SourceImpl for IdleSource {
    fn prepare(&self, _source: &Source, _now: Micros) -> (bool, Option<i64>) {
        (true, None)
    }

    fn dispatch(&self, _source: &Source, callback: &mut Option<Callback>) -> DispatchAction {
        let action = match callback {
            Some(Callback::Plain(f)) => f(),
            _ => return DispatchAction::Remove,
        };

        if self.one_shot {
            DispatchAction::Remove
        } else {
            action
        }
    }

    fn kind_name(&self) -> &'static str {
        "idle"
    }
}

impl IdleSource {
    pub fn new(callback: impl FnMut() -> DispatchAction + Send + 'static) -> Arc<Source> {
        let source = Source::new(IdleSource { one_shot: false });
        source.set_callback(Callback::Plain(Box::new(callback)));
        source.set_priority(PRIORITY_DEFAULT_IDLE);
        source.set_name("idle");
        source
    }

    pub fn new_one_shot(callback: impl FnOnce() + Send + 'static) -> Arc<Source> {
        let mut callback = Some(callback);
        let wrapped = move || {
            if let Some(cb) = callback.take() {
                cb();
            }
            DispatchAction::Remove
        };

        let source = Source::new(IdleSource { one_shot: true });
        source.set_callback(Callback::Plain(Box::new(wrapped)));
        source.set_priority(PRIORITY_DEFAULT_IDLE);
        source.set_name("idle-one-shot");
        source
    }
}
