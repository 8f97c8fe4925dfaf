//! Periodic and one-shot timers on the I/O manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

use fibrio::IoManager;

fn main() {
    fibrio::log::init().unwrap();
    let io = IoManager::new(1, false, "ticker").unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = ticks.clone();
    let ticker = io.add_timer(
        Duration::from_millis(500),
        move || {
            let n = ticks2.fetch_add(1, Ordering::SeqCst) + 1;
            info!("tick {}", n);
        },
        true,
    );
    io.add_timer(
        Duration::from_secs(3),
        || info!("three seconds in"),
        false,
    );

    std::thread::sleep(Duration::from_secs(5));
    // A recurring timer keeps the reactor alive; disarm it before stopping.
    io.cancel_timer(&ticker);
    io.stop();
    info!("done after {} ticks", ticks.load(Ordering::SeqCst));
}
