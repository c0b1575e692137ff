//! Hooked sleep example
//!
//! Two jobs sleep for 2s and 1s on an I/O manager with a single worker
//! thread. The hooked `sleep` suspends only the calling fiber, so both
//! finish after about 2s instead of 3s.
//!
//! # Environment Variables
//!
//! - `FIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use fiberio::{hook, kinfo, IoManager, Runtime, RuntimeConfig};
use std::sync::mpsc;
use std::time::Instant;

fn main() {
    let runtime = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let iom = match IoManager::new(&runtime, 1, false, "sleep") {
        Ok(iom) => iom,
        Err(e) => {
            eprintln!("failed to start io manager: {}", e);
            std::process::exit(1);
        }
    };

    let start = Instant::now();
    let (tx, rx) = mpsc::channel();
    for secs in [2, 1] {
        let tx = tx.clone();
        iom.submit(move || {
            kinfo!("sleeping {}s", secs);
            hook::sleep(secs);
            kinfo!("slept {}s", secs);
            let _ = tx.send(secs);
        });
    }
    drop(tx);

    for secs in rx {
        println!("{}s sleeper done at {:.2?}", secs, start.elapsed());
    }
    iom.stop();
    println!("total {:.2?} on one worker thread", start.elapsed());
}
