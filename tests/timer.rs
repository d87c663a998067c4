use spindle::TimerManager;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn run_expired(manager: &TimerManager) -> usize {
    let mut callbacks = Vec::new();
    manager.list_expired_callbacks(&mut callbacks);

    for callback in &callbacks {
        callback();
    }

    callbacks.len()
}

#[test]
fn test_next_timer_tracks_add_and_cancel() {
    let manager = TimerManager::new();
    assert_eq!(manager.next_timer(), None);

    let timer = manager.add_timer(100, || {}, false);
    let next = manager.next_timer().expect("one timer armed");
    assert!(next <= 100, "next timer in {next} ms");

    assert!(timer.cancel());
    assert_eq!(manager.next_timer(), None);
    assert!(!timer.cancel(), "second cancel reports the timer gone");
}

#[test]
fn test_next_timer_follows_the_earliest() {
    let manager = TimerManager::new();

    manager.add_timer(1_000, || {}, false);
    let early = manager.add_timer(50, || {}, false);

    assert!(manager.next_timer().unwrap() <= 50);

    early.cancel();
    let next = manager.next_timer().unwrap();
    assert!(next > 50 && next <= 1_000, "next timer in {next} ms");
}

#[test]
fn test_refresh_pushes_the_deadline() {
    let manager = TimerManager::new();
    let timer = manager.add_timer(100, || {}, false);

    thread::sleep(Duration::from_millis(60));
    assert!(manager.next_timer().unwrap() <= 40);

    assert!(timer.refresh());
    let next = manager.next_timer().unwrap();
    assert!(next > 60, "refreshed timer fires in {next} ms");
}

#[test]
fn test_reset_from_now_changes_period() {
    let manager = TimerManager::new();
    let timer = manager.add_timer(5_000, || {}, false);

    assert!(timer.reset(100, true));
    assert_eq!(timer.period(), 100);
    assert!(manager.next_timer().unwrap() <= 100);

    assert!(timer.reset(100, false), "unchanged period is a no-op");
    assert_eq!(manager.len(), 1);
}

#[test]
fn test_cancelled_timer_cannot_be_refreshed_or_reset() {
    let manager = TimerManager::new();
    let timer = manager.add_timer(100, || {}, false);

    timer.cancel();

    assert!(!timer.refresh());
    assert!(!timer.reset(200, true));
    assert!(!manager.has_timer());
}

#[test]
fn test_add_cancel_add_gives_an_independent_timer() {
    let manager = TimerManager::new();

    let first = manager.add_timer(100, || {}, false);
    assert!(first.cancel());

    let second = manager.add_timer(100, || {}, false);

    assert_ne!(first.id(), second.id());
    assert!(!first.is_armed());
    assert!(second.is_armed());
    assert_eq!(manager.len(), 1);
    assert!(!first.cancel());
    assert!(second.cancel());
}

#[test]
fn test_one_shot_timer_fires_once() {
    let manager = TimerManager::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();

    let timer = manager.add_timer(
        10,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    thread::sleep(Duration::from_millis(20));
    assert_eq!(run_expired(&manager), 1);
    assert_eq!(run_expired(&manager), 0);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!timer.is_armed());
    assert!(!timer.cancel());
}

#[test]
fn test_condition_timer_skips_dropped_guard() {
    let manager = TimerManager::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let live = Arc::new(());
    let dead = Arc::new(());

    for guard in [&live, &dead] {
        let h = hits.clone();
        manager.add_condition_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(guard),
            false,
        );
    }
    drop(dead);

    thread::sleep(Duration::from_millis(5));
    assert_eq!(run_expired(&manager), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "only the live guard fires");
}

#[test]
fn test_recurring_timer_keeps_firing_until_cancelled() {
    let manager = TimerManager::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();

    let timer = manager.add_timer(
        10,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    for _ in 0..3 {
        thread::sleep(Duration::from_millis(15));
        run_expired(&manager);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(timer.is_armed());

    timer.cancel();
    thread::sleep(Duration::from_millis(15));
    assert_eq!(run_expired(&manager), 0);
}
