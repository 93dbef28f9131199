//! Timer source (spec section 4.7): fires after an interval, optionally
//! repeating, optionally aligned to whole-second boundaries with a
//! per-process perturbation so whole-second timers in different processes
//! on the same machine don't all wake in the same millisecond.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{monotonic_micros, Micros};
use crate::source::{Callback, DispatchAction, Source, SourceImpl};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Single process-wide offset, derived from a session-identifying
/// environment variable, that every whole-second timer in this process
/// shares (spec section 6): `EVENTCORE_DEBUG_POLL`'s sibling
/// `EVENTCORE_TIMER_SEED`, falling back to `DBUS_SESSION_BUS_ADDRESS` then
/// `HOSTNAME`. Absence of all three yields a perturbation of exactly zero
/// rather than a random one, so that two runs with no session context
/// behave identically.
fn process_perturbation() -> i64 {
    static PERTURBATION: AtomicI64 = AtomicI64::new(-1);

    let cached = PERTURBATION.load(std::sync::atomic::Ordering::Relaxed);
    if cached >= 0 {
        return cached;
    }

    let seed = std::env::var("EVENTCORE_TIMER_SEED")
        .or_else(|_| std::env::var("DBUS_SESSION_BUS_ADDRESS"))
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default();

    let perturbation = if seed.is_empty() {
        0
    } else {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        (hasher.finish() % MICROS_PER_SECOND as u64) as i64
    };

    PERTURBATION.store(perturbation, std::sync::atomic::Ordering::Relaxed);
    perturbation
}

pub struct TimerSource {
    interval_micros: i64,
    one_shot: bool,
    seconds_granularity: bool,
    perturbation_micros: i64,
}

impl TimerSource {
    /// Fires repeatedly every `interval`.
    pub fn new(interval: Duration, callback: impl FnMut() -> DispatchAction + Send + 'static) -> Arc<Source> {
        Self::build(micros(interval), false, false, callback)
    }

    /// Fires repeatedly every `interval`, rounded up to whole seconds and
    /// perturbed so many such timers don't all wake in the same
    /// millisecond (spec section 4.7).
    pub fn new_seconds(interval: Duration, callback: impl FnMut() -> DispatchAction + Send + 'static) -> Arc<Source> {
        Self::build(micros(interval), false, true, callback)
    }

    /// Fires exactly once after `delay`, then removes itself.
    pub fn new_one_shot(delay: Duration, callback: impl FnOnce() + Send + 'static) -> Arc<Source> {
        let mut callback = Some(callback);
        let wrapped = move || {
            if let Some(cb) = callback.take() {
                cb();
            }
            DispatchAction::Remove
        };
        Self::build(micros(delay), true, false, wrapped)
    }

    fn build(
        interval_micros: i64,
        one_shot: bool,
        seconds_granularity: bool,
        callback: impl FnMut() -> DispatchAction + Send + 'static,
    ) -> Arc<Source> {
        let perturbation_micros = if seconds_granularity { process_perturbation() } else { 0 };
        let now = monotonic_micros();
        let first_ready = Self::compute_next(now, interval_micros, seconds_granularity, perturbation_micros);

        let imp = TimerSource {
            interval_micros,
            one_shot,
            seconds_granularity,
            perturbation_micros,
        };

        let source = Source::new(imp);
        source.set_callback(Callback::Plain(Box::new(callback)));
        source.set_name(if one_shot { "timer-one-shot" } else { "timer" });
        source.set_ready_time(first_ready);
        source
    }

    fn compute_next(now: Micros, interval_micros: i64, seconds_granularity: bool, perturbation_micros: i64) -> Micros {
        let mut next = now + interval_micros;
        if seconds_granularity {
            let shifted = next - perturbation_micros;
            let rounded_up = ((shifted + MICROS_PER_SECOND - 1) / MICROS_PER_SECOND) * MICROS_PER_SECOND;
            next = rounded_up + perturbation_micros;
        }
        next
    }
}

impl SourceImpl for TimerSource {
    fn prepare(&self, source: &Source, now: Micros) -> (bool, Option<i64>) {
        let ready_time = source.ready_time();
        let remaining = ready_time - now;
        (remaining <= 0, Some(remaining.max(0)))
    }

    fn dispatch(&self, source: &Source, callback: &mut Option<Callback>) -> DispatchAction {
        let action = match callback {
            Some(Callback::Plain(f)) => f(),
            _ => return DispatchAction::Remove,
        };

        if self.one_shot || action == DispatchAction::Remove {
            return DispatchAction::Remove;
        }

        let now = monotonic_micros();
        let next = Self::compute_next(now, self.interval_micros, self.seconds_granularity, self.perturbation_micros);
        source.set_ready_time_raw(next);
        DispatchAction::Continue
    }

    fn kind_name(&self) -> &'static str {
        "timer"
    }
}

fn micros(d: Duration) -> i64 {
    d.as_micros().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn repeating_timer_fires_more_than_once() {
        let ctx = Context::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let timer = TimerSource::new(Duration::from_millis(1), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
            DispatchAction::Continue
        });
        timer.attach(&ctx);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            ctx.iteration(true);
            thread::yield_now();
        }

        assert!(fired.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn one_shot_timer_removes_itself_after_firing() {
        let ctx = Context::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let timer = TimerSource::new_one_shot(Duration::from_millis(1), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let id = timer.attach(&ctx);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            ctx.iteration(true);
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ctx.find_source(id).is_none());
    }

    #[test]
    fn compute_next_with_seconds_granularity_lands_on_perturbed_boundary() {
        let next = TimerSource::compute_next(0, MICROS_PER_SECOND, true, 250_000);
        assert_eq!(next, MICROS_PER_SECOND + 250_000);
    }
}
