//! Scenario: a context with ownerless polling enabled runs the manual
//! prepare/query/poll/check/dispatch pipeline without ever `acquire`ing
//! first. A source attached while no iteration is in flight still wakes
//! the next `iteration` promptly rather than requiring a fresh poll cycle
//! to notice it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eventcore::sources::IdleSource;
use eventcore::source::DispatchAction;
use eventcore::Context;

mod util;
use util::init;

#[test]
fn attach_from_the_same_thread_is_observed_on_the_next_iteration() {
    init();

    let ctx = Context::new().unwrap();
    ctx.set_ownerless_polling(true);

    // No acquire() anywhere in this test: ownerless polling lets
    // `iteration` proceed without an owning thread.
    assert!(!ctx.iteration(false), "nothing attached yet, so nothing should dispatch");

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    let idle = IdleSource::new(move || {
        fired2.store(true, Ordering::SeqCst);
        DispatchAction::Remove
    });
    idle.attach(&ctx);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
        ctx.iteration(true);
    }

    assert!(fired.load(Ordering::SeqCst));
}
