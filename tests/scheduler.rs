use spindle::{Builder, Fiber, FiberState, Schedule, Scheduler, Task};

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_two_unpinned_fibers_reach_term() {
    let scheduler = Scheduler::new(2, false, "sched");
    scheduler.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let fibers: Vec<Arc<Fiber>> = (0..2)
        .map(|_| {
            let hits = hits.clone();
            Fiber::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for fiber in &fibers {
        scheduler.schedule(fiber.clone());
    }

    scheduler.stop();

    for fiber in &fibers {
        assert_eq!(fiber.state(), FiberState::Term);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[test]
fn test_schedule_does_not_block() {
    let scheduler = Scheduler::new(2, false, "nonblocking");
    scheduler.start().unwrap();

    let started = Instant::now();
    for _ in 0..8 {
        scheduler.spawn(|| thread::sleep(Duration::from_millis(200)));
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(100),
        "schedule waited {elapsed:?} for its tasks"
    );

    scheduler.stop();
}

#[test]
fn test_pinned_tasks_run_in_order_on_their_worker() {
    let scheduler = Scheduler::new(3, false, "pinned");
    scheduler.start().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..20 {
        let seen = seen.clone();
        scheduler.schedule_on(
            Task::callback(move || {
                seen.lock().push((i, Scheduler::current_worker()));
            }),
            1,
        );
    }

    scheduler.stop();

    let seen = seen.lock();
    let order: Vec<usize> = seen.iter().map(|(i, _)| *i).collect();

    assert_eq!(order, (0..20).collect::<Vec<_>>());
    assert!(seen.iter().all(|(_, worker)| *worker == Some(1)));
}

#[test]
fn test_use_caller_runs_tasks_during_stop() {
    let scheduler = Scheduler::new(1, true, "caller");
    scheduler.start().unwrap();

    let caller = thread::current().id();
    let ran_on = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..5 {
        let ran_on = ran_on.clone();
        scheduler.spawn(move || {
            ran_on.lock().push(thread::current().id());
        });
    }

    assert!(ran_on.lock().is_empty(), "nothing runs before stop");

    scheduler.stop();

    let ran_on = ran_on.lock();
    assert_eq!(ran_on.len(), 5);
    assert!(ran_on.iter().all(|id| *id == caller));
}

#[test]
fn test_use_caller_with_extra_workers() {
    let scheduler = Scheduler::new(3, true, "mixed");
    scheduler.start().unwrap();

    let caller = thread::current().id();
    let on_caller = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    for i in 0..12 {
        let on_caller = on_caller.clone();
        let total = total.clone();
        let task = Task::callback(move || {
            if thread::current().id() == caller {
                on_caller.fetch_add(1, Ordering::SeqCst);
            }
            total.fetch_add(1, Ordering::SeqCst);
        });

        if i % 3 == 0 {
            scheduler.schedule(task.pinned(0));
        } else {
            scheduler.schedule(task);
        }
    }

    scheduler.stop();

    assert_eq!(total.load(Ordering::SeqCst), 12);
    assert!(on_caller.load(Ordering::SeqCst) >= 4, "tasks pinned to 0 run on the caller");
}

#[test]
fn test_panicking_callback_does_not_kill_the_worker() {
    let scheduler = Scheduler::new(1, false, "panics");
    scheduler.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();

    scheduler.spawn(|| panic!("task failure"));
    scheduler.spawn(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_current_scheduler_inside_a_task() {
    let scheduler = Scheduler::new(2, false, "current");
    scheduler.start().unwrap();

    let matched = Arc::new(AtomicUsize::new(0));
    let m = matched.clone();
    let expected = Arc::as_ptr(&scheduler) as usize;

    scheduler.spawn(move || {
        let current = Scheduler::current().expect("worker has a scheduler");
        if current.scheduler() as *const Scheduler as usize == expected {
            m.fetch_add(1, Ordering::SeqCst);
        }
    });

    scheduler.stop();

    assert_eq!(matched.load(Ordering::SeqCst), 1);
    assert!(Scheduler::current().is_none(), "the test thread is not a worker");
}

#[test]
fn test_schedule_all_runs_every_task() {
    let scheduler = Scheduler::new(2, false, "batch");
    scheduler.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..50)
        .map(|_| {
            let hits = hits.clone();
            Task::callback(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    scheduler.schedule_all(tasks);
    scheduler.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 50);
    assert_eq!(scheduler.queued(), 0);
}

#[test]
fn test_worker_threads_are_named() {
    let scheduler = Builder::new().worker_threads(1).name("named").build_scheduler();
    scheduler.start().unwrap();

    let name = Arc::new(Mutex::new(None));
    let n = name.clone();

    scheduler.spawn(move || {
        *n.lock() = thread::current().name().map(str::to_string);
    });

    scheduler.stop();

    assert_eq!(name.lock().as_deref(), Some("named-0"));
}

#[test]
#[should_panic(expected = "worker_threads must be > 0")]
fn test_builder_rejects_zero_workers() {
    let _ = Builder::new().worker_threads(0);
}
