use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fibrio::fiber::{self, Fiber, FiberState};
use fibrio::scheduler::{self, Scheduler, Task};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn closures_run_on_workers() {
    let sched = Scheduler::new(2, false, "run");
    sched.start();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let hits = hits.clone();
        sched.spawn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 100
    }));
    sched.stop();
}

#[test]
fn fifo_order_on_a_single_worker() {
    let sched = Scheduler::new(1, false, "fifo");
    sched.start();
    let order = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Task> = (0..50)
        .map(|i| {
            let order = order.clone();
            Task::callback(move || order.lock().unwrap().push(i))
        })
        .collect();
    sched.schedule_batch(tasks);
    assert!(wait_until(Duration::from_secs(5), || {
        order.lock().unwrap().len() == 50
    }));
    sched.stop();
    assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn affinity_partitions_exactly() {
    let sched = Scheduler::new(3, false, "pin");
    sched.start();
    let log = Arc::new(Mutex::new(Vec::new()));
    for target in 0..3 {
        for _ in 0..10 {
            let log = log.clone();
            sched.schedule(
                Task::callback(move || {
                    log.lock()
                        .unwrap()
                        .push((target, scheduler::worker_id().unwrap()));
                })
                .pinned(target),
            );
        }
    }
    assert!(wait_until(Duration::from_secs(5), || {
        log.lock().unwrap().len() == 30
    }));
    sched.stop();

    let mut per_worker: HashMap<usize, usize> = HashMap::new();
    for &(target, ran_on) in log.lock().unwrap().iter() {
        assert_eq!(target, ran_on, "task pinned to {} ran on {}", target, ran_on);
        *per_worker.entry(ran_on).or_default() += 1;
    }
    assert_eq!(per_worker.len(), 3);
    assert!(per_worker.values().all(|&n| n == 10));
}

#[test]
fn ready_yields_are_rescheduled() {
    let sched = Scheduler::new(2, false, "ready");
    sched.start();
    let rounds = Arc::new(AtomicUsize::new(0));
    let rounds2 = rounds.clone();
    let f = Fiber::new(move || {
        for _ in 0..5 {
            rounds2.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
        }
    });
    sched.schedule(Task::fiber(f.clone()));
    assert!(wait_until(Duration::from_secs(5), || {
        f.state() == FiberState::Term
    }));
    assert_eq!(rounds.load(Ordering::SeqCst), 5);
    sched.stop();
}

#[test]
fn switch_to_moves_the_fiber() {
    let sched = Scheduler::new(2, false, "switch");
    sched.start();
    let (tx, rx) = mpsc::channel();
    {
        let sched = sched.clone();
        let tx = tx.clone();
        sched.clone().spawn(move || {
            let here = scheduler::worker_id().unwrap();
            let target = 1 - here;
            sched.switch_to(Some(target));
            tx.send((target, scheduler::worker_id().unwrap())).unwrap();
        });
    }
    let (target, landed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(target, landed);
    sched.stop();
}

#[test]
fn worker_panic_does_not_kill_the_pool() {
    let sched = Scheduler::new(1, false, "panic");
    sched.start();
    sched.spawn(|| panic!("task blew up"));
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    sched.spawn(move || {
        hits2.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    sched.stop();
}

#[test]
fn use_caller_runs_the_queue_during_stop() {
    let sched = Scheduler::new(1, true, "caller");
    sched.start();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let hits = hits.clone();
        sched.spawn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    // The constructing thread is the only worker; nothing ran yet.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}

#[test]
fn use_caller_thread_is_reusable_after_stop() {
    for round in 0..2 {
        let sched = Scheduler::new(1, true, &format!("caller_{}", round));
        sched.start();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        sched.spawn(move || {
            hit2.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn a_running_fiber_in_the_queue_is_skipped_not_stolen() {
    // The fiber enqueues itself while still executing, so a second worker
    // scanning the queue sees an Exec fiber and must leave it alone until
    // the yield lands.
    let sched = Scheduler::new(2, false, "exec_skip");
    sched.start();
    let entered = Arc::new(AtomicUsize::new(0));
    let in_body = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));

    let entered2 = entered.clone();
    let in_body2 = in_body.clone();
    let overlapped2 = overlapped.clone();
    let f = Fiber::new(move || {
        for _ in 0..20 {
            if in_body2.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped2.fetch_add(1, Ordering::SeqCst);
            }
            entered2.fetch_add(1, Ordering::SeqCst);
            let sched = Scheduler::current().unwrap();
            sched.schedule(Task::fiber(fiber::current()));
            in_body2.fetch_sub(1, Ordering::SeqCst);
            fiber::yield_to_hold();
        }
    });
    sched.schedule(Task::fiber(f.clone()));
    assert!(wait_until(Duration::from_secs(5), || {
        f.state() == FiberState::Term
    }));
    assert_eq!(entered.load(Ordering::SeqCst), 20);
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    sched.stop();
}
