use spindle::{Fiber, IoManager, Schedule};

use std::time::{Duration, Instant};

#[spindle::test]
fn test_body_runs_inside_a_fiber() {
    assert!(IoManager::current().is_some());
    assert_ne!(Fiber::current_id(), 0);
}

#[spindle::test(worker_threads = 2)]
fn test_body_can_sleep() {
    let iom = IoManager::current().unwrap();
    let started = Instant::now();

    iom.sleep_ms(20).unwrap();

    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(iom.scheduler().worker_count(), 2);
}

#[spindle::test]
#[should_panic]
fn test_failing_body_fails_the_test() {
    assert_eq!(1 + 1, 3);
}
