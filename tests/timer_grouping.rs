//! Scenario: three repeating timers of different intervals plus a
//! one-shot quit timer. After the loop exits, the faster timers have
//! fired at least as many times as the slower ones, each bounded above
//! by how many whole intervals fit in the run's duration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventcore::sources::TimerSource;
use eventcore::source::DispatchAction;
use eventcore::{Context, Loop};

mod util;
use util::init;

#[test]
fn faster_timers_fire_at_least_as_often_as_slower_ones() {
    init();

    let ctx = Context::new().unwrap();
    let main_loop = Loop::new(ctx.clone());

    let count_100 = Arc::new(AtomicUsize::new(0));
    let count_250 = Arc::new(AtomicUsize::new(0));
    let count_330 = Arc::new(AtomicUsize::new(0));

    let c1 = count_100.clone();
    let t1 = TimerSource::new(Duration::from_millis(100), move || {
        c1.fetch_add(1, Ordering::SeqCst);
        DispatchAction::Continue
    });
    t1.attach(&ctx);

    let c2 = count_250.clone();
    let t2 = TimerSource::new(Duration::from_millis(250), move || {
        c2.fetch_add(1, Ordering::SeqCst);
        DispatchAction::Continue
    });
    t2.attach(&ctx);

    let c3 = count_330.clone();
    let t3 = TimerSource::new(Duration::from_millis(330), move || {
        c3.fetch_add(1, Ordering::SeqCst);
        DispatchAction::Continue
    });
    t3.attach(&ctx);

    let quit_loop = main_loop.clone();
    let quit_timer = TimerSource::new_one_shot(Duration::from_millis(1_050), move || {
        quit_loop.quit();
    });
    quit_timer.attach(&ctx);

    main_loop.run();

    let c100 = count_100.load(Ordering::SeqCst);
    let c250 = count_250.load(Ordering::SeqCst);
    let c330 = count_330.load(Ordering::SeqCst);

    assert!(c100 >= c250, "100ms timer ({c100}) should fire at least as often as the 250ms one ({c250})");
    assert!(c250 >= c330, "250ms timer ({c250}) should fire at least as often as the 330ms one ({c330})");
    assert!(c100 <= 11, "100ms timer fired {c100} times, more than ~1050ms/100ms allows");
    assert!(c250 <= 5, "250ms timer fired {c250} times, more than ~1050ms/250ms allows");
    assert!(c330 <= 4, "330ms timer fired {c330} times, more than ~1050ms/330ms allows");
}
