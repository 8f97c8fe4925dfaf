use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fibrio::fiber::{self, Fiber, FiberState};

#[test]
fn handshake_with_two_yields() {
    let step = Arc::new(AtomicUsize::new(0));
    let trace = Arc::new(Mutex::new(Vec::new()));

    let fiber_step = step.clone();
    let fiber_trace = trace.clone();
    let f = Fiber::new(move || {
        fiber_step.store(1, Ordering::SeqCst);
        fiber_trace.lock().unwrap().push("fiber(1)");
        fiber::yield_to_hold();
        fiber_step.store(2, Ordering::SeqCst);
        fiber_trace.lock().unwrap().push("fiber(2)");
    });

    assert_eq!(f.state(), FiberState::Init);
    trace.lock().unwrap().push("main");
    f.resume();
    assert_eq!(step.load(Ordering::SeqCst), 1);
    assert_eq!(f.state(), FiberState::Hold);

    trace.lock().unwrap().push("main");
    f.resume();
    assert_eq!(step.load(Ordering::SeqCst), 2);
    assert_eq!(f.state(), FiberState::Term);
    trace.lock().unwrap().push("main");

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["main", "fiber(1)", "main", "fiber(2)", "main"]
    );
}

#[test]
fn yield_to_ready_leaves_ready_state() {
    let f = Fiber::new(|| {
        fiber::yield_to_ready();
    });
    f.resume();
    assert_eq!(f.state(), FiberState::Ready);
    f.resume();
    assert_eq!(f.state(), FiberState::Term);
}

#[test]
fn current_is_the_executing_fiber() {
    let seen = Arc::new(AtomicU64::new(0));
    let seen2 = seen.clone();
    let f = Fiber::new(move || {
        let cur = fiber::current();
        assert_eq!(cur.state(), FiberState::Exec);
        seen2.store(cur.id(), Ordering::SeqCst);
    });
    let id = f.id();
    f.resume();
    assert_eq!(seen.load(Ordering::SeqCst), id);
    // Back on the thread-root fiber.
    assert_ne!(fiber::current().id(), id);
}

#[test]
fn ids_increase_across_threads() {
    let before = Fiber::new(|| {}).id();
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(std::thread::spawn(|| {
            (0..50).map(|_| Fiber::new(|| {}).id()).collect::<Vec<_>>()
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        let ids = h.join().unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        all.extend(ids);
    }
    assert!(all.iter().all(|&id| id > before));
}

#[test]
fn reset_reuses_the_stack() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h1 = hits.clone();
    let f = Fiber::with_stack_size(
        move || {
            h1.fetch_add(1, Ordering::SeqCst);
        },
        64 * 1024,
    );
    f.resume();
    assert_eq!(f.state(), FiberState::Term);

    let h2 = hits.clone();
    f.reset(move || {
        h2.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(f.state(), FiberState::Init);
    f.resume();
    assert_eq!(f.state(), FiberState::Term);
    assert_eq!(hits.load(Ordering::SeqCst), 11);
}

#[test]
fn panic_is_contained_and_marked() {
    let f = Fiber::new(|| panic!("boom"));
    f.resume();
    assert_eq!(f.state(), FiberState::Except);
    // Terminal absorption: nothing moves the state afterwards.
    assert_eq!(f.state(), FiberState::Except);
    // And the hosting thread is alive and can run more fibers.
    let g = Fiber::new(|| {});
    g.resume();
    assert_eq!(g.state(), FiberState::Term);
}

#[test]
fn current_id_is_zero_before_any_fiber() {
    std::thread::spawn(|| {
        assert_eq!(fiber::current_id(), 0);
        fiber::current();
        assert_ne!(fiber::current_id(), 0);
    })
    .join()
    .unwrap();
}
