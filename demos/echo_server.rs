//! Fiber-per-connection TCP echo server.
//!
//! ```text
//! cargo run --example echo_server [-- -d]
//! ```
//!
//! `-d` runs under the respawning daemon supervisor.

use std::io::{Read, Write};

use log::{error, info};

use fibrio::coio::CoListener;
use fibrio::daemon;
use fibrio::IoManager;

fn serve() -> i32 {
    let io = match IoManager::new(2, false, "echo") {
        Ok(io) => io,
        Err(e) => {
            error!("failed to start io manager: {}", e);
            return 1;
        }
    };
    let listener = match CoListener::bind("0.0.0.0:8020") {
        Ok(l) => l,
        Err(e) => {
            error!("bind failed: {}", e);
            return 1;
        }
    };
    info!("echo server listening on 0.0.0.0:8020");

    let accept_io = io.clone();
    io.spawn(move || loop {
        match listener.accept() {
            Ok(mut stream) => {
                accept_io.spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                info!("echoing {} bytes", n);
                                if let Err(e) = stream.write_all(&buf[..n]) {
                                    error!("send failed: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("recv failed: {}", e);
                                break;
                            }
                        }
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        }
    });

    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn main() {
    fibrio::log::init().unwrap();
    let daemonize = std::env::args().any(|a| a == "-d");
    std::process::exit(daemon::start_daemon(serve, daemonize));
}
