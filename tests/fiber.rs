use spindle::{Fiber, FiberState};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[test]
fn test_fiber_runs_to_term() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();

    let fiber = Fiber::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), FiberState::Init);

    let state = fiber.swap_in();

    assert_eq!(state, FiberState::Term);
    assert_eq!(fiber.state(), FiberState::Term);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fiber_hold_then_resume() {
    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();

    let fiber = Fiber::new(move || {
        s.fetch_add(1, Ordering::SeqCst);
        Fiber::yield_to_hold();
        s.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(fiber.swap_in(), FiberState::Hold);
    assert_eq!(steps.load(Ordering::SeqCst), 1, "body should stop at the yield");

    assert_eq!(fiber.swap_in(), FiberState::Term);
    assert_eq!(steps.load(Ordering::SeqCst), 2);
}

#[test]
fn test_fiber_yield_to_ready() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_ready();
    });

    assert_eq!(fiber.swap_in(), FiberState::Ready);
    assert_eq!(fiber.swap_in(), FiberState::Term);
}

#[test]
fn test_fiber_reset_reuses_stack() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();

    let fiber = Fiber::with_stack_size(|| {}, 64 * 1024);
    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Term);

    fiber.reset(move || {
        h.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), FiberState::Init);

    assert_eq!(fiber.swap_in(), FiberState::Term);
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
#[should_panic(expected = "cannot be reset")]
fn test_fiber_reset_from_hold_panics() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_hold();
    });

    fiber.swap_in();
    fiber.reset(|| {});
}

#[test]
#[should_panic(expected = "cannot be resumed")]
fn test_fiber_resume_after_term_panics() {
    let fiber = Fiber::new(|| {});

    fiber.swap_in();
    fiber.swap_in();
}

#[test]
fn test_fiber_panic_is_captured() {
    let fiber = Fiber::new(|| {
        panic!("boom");
    });

    assert_eq!(fiber.swap_in(), FiberState::Except);
    assert_eq!(fiber.panic_message().as_deref(), Some("boom"));

    fiber.reset(|| {});
    assert_eq!(fiber.panic_message(), None, "reset clears the panic");
    assert_eq!(fiber.swap_in(), FiberState::Term);
}

#[test]
fn test_fiber_current_id() {
    let seen = Arc::new(AtomicU64::new(0));
    let s = seen.clone();

    let fiber = Fiber::new(move || {
        s.store(Fiber::current_id(), Ordering::SeqCst);
    });
    fiber.swap_in();

    assert_eq!(seen.load(Ordering::SeqCst), fiber.id());
    assert_eq!(Fiber::current_id(), 0, "the test thread runs its main fiber");
    assert!(Fiber::current().is_main());
}

#[test]
fn test_fiber_ids_are_unique() {
    let a = Fiber::new(|| {});
    let b = Fiber::new(|| {});

    assert_ne!(a.id(), b.id());
    assert!(a.id() > 0 && b.id() > 0);
    assert!(Fiber::total() >= 2);
}

#[test]
fn test_fibers_nest_through_the_main_fiber() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let first = {
        let order = order.clone();
        Fiber::new(move || {
            order.lock().push("first:start");
            Fiber::yield_to_hold();
            order.lock().push("first:end");
        })
    };
    let second = {
        let order = order.clone();
        Fiber::new(move || {
            order.lock().push("second");
        })
    };

    first.swap_in();
    second.swap_in();
    first.swap_in();

    assert_eq!(
        *order.lock(),
        vec!["first:start", "second", "first:end"]
    );
}
