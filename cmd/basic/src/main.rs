//! Basic fiberio example
//!
//! Runs a handful of jobs and an explicit fiber on a scheduler with two
//! worker threads plus the calling thread, yielding between steps.
//!
//! # Environment Variables
//!
//! - `FIO_FLUSH_EPRINT=1` - Flush log output immediately (useful for crash debugging)
//! - `FIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use fiberio::{current_id, yield_now, Fiber, Runtime, RuntimeConfig, Scheduler};
use fiberio::{kdebug, kinfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// FIO_LOG_LEVEL=debug FIO_FLUSH_EPRINT=1 cargo run -p fiberio-basic
fn main() {
    println!("=== fiberio Basic Example ===\n");

    let runtime = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Two workers, and the main thread joins in when stop() is called
    let sched = Scheduler::new(&runtime, 2, true, "basic");
    if let Err(e) = sched.start() {
        eprintln!("failed to start scheduler: {}", e);
        std::process::exit(1);
    }

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        sched.submit(move || {
            kdebug!("[job {}] started in fiber {}", i, current_id());
            for j in 0..3 {
                kdebug!("[job {}] iteration {}", i, j);
                yield_now();
            }
            kdebug!("[job {}] finished", i);
            c.fetch_add(1, Ordering::SeqCst);
        });
        println!("Submitted job {}", i);
    }

    let c = completed.clone();
    let fiber = Fiber::new(&runtime, move || {
        kdebug!("[fiber] started");
        yield_now();
        kdebug!("[fiber] finished");
        c.fetch_add(1, Ordering::SeqCst);
    });
    println!("Submitted fiber {}", fiber.id());
    sched.submit_fiber(fiber.clone(), None);

    println!("\nStopping; waiting for {} tasks to complete...\n", 4);
    sched.stop();

    let count = completed.load(Ordering::SeqCst);
    kinfo!("{} task(s) completed, fiber ended in {}", count, fiber.state());
    println!("\n=== Example Complete ===");
}
