//! # PriOS Demo
//!
//! Runs the same small workload on bare metal and on the host:
//!
//! | Thread     | Priority | Behavior                                          |
//! |------------|----------|---------------------------------------------------|
//! | `main`     | 31       | holds `RESOURCE` while `urgent` waits for it      |
//! | `urgent`   | 50       | blocks on `RESOURCE`, donating 50 to `main`       |
//! | `producer` | 40       | fills a bounded buffer, waits on `NOT_FULL`       |
//! | `consumer` | 35       | drains the buffer, waits on `NOT_EMPTY`           |
//!
//! ## Expected Output
//!
//! 1. `main` reports priority 50 while `urgent` waits on its lock, and 31
//!    again after releasing it.
//! 2. `producer` and `consumer` alternate through the buffer, each one
//!    sleeping on its condition variable when it cannot make progress.
//! 3. Tick statistics are printed once both workers are done.
//!
//! On the host, arguments are a kernel command line, e.g.
//! `cargo run -- -o mlfqs loglevel=debug`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use core::sync::atomic::{AtomicUsize, Ordering};

use log::info;

use prios::kernel;
use prios::sync::{Condvar, Lock, Semaphore};
use prios::KernelError;

#[cfg(all(target_arch = "arm", target_os = "none"))]
use panic_halt as _;

const ITEMS: usize = 16;
const CAPACITY: usize = 4;

static RESOURCE: Lock = Lock::new();

static BUFFER_LOCK: Lock = Lock::new();
static NOT_EMPTY: Condvar = Condvar::new();
static NOT_FULL: Condvar = Condvar::new();
/// Items in the buffer. Only touched with `BUFFER_LOCK` held.
static QUEUED: AtomicUsize = AtomicUsize::new(0);

static DONE: Semaphore = Semaphore::new(0);

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

fn urgent(_: usize) {
    RESOURCE.acquire();
    info!("urgent: got the resource");
    RESOURCE.release();
}

fn producer(items: usize) {
    for n in 0..items {
        BUFFER_LOCK.acquire();
        while QUEUED.load(Ordering::Relaxed) == CAPACITY {
            NOT_FULL.wait(&BUFFER_LOCK);
        }
        QUEUED.fetch_add(1, Ordering::Relaxed);
        info!("producer: item {}", n);
        NOT_EMPTY.signal(&BUFFER_LOCK);
        BUFFER_LOCK.release();
    }
    DONE.up();
}

fn consumer(items: usize) {
    for n in 0..items {
        BUFFER_LOCK.acquire();
        while QUEUED.load(Ordering::Relaxed) == 0 {
            NOT_EMPTY.wait(&BUFFER_LOCK);
        }
        QUEUED.fetch_sub(1, Ordering::Relaxed);
        info!("consumer: item {}", n);
        NOT_FULL.signal(&BUFFER_LOCK);
        BUFFER_LOCK.release();
    }
    DONE.up();
}

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

fn run() -> Result<(), KernelError> {
    kernel::start()?;

    RESOURCE.acquire();
    kernel::create_thread("urgent", 50, urgent, 0)?;
    info!("main: priority {} while urgent waits", kernel::get_priority());
    RESOURCE.release();
    info!("main: priority {} after release", kernel::get_priority());

    kernel::create_thread("producer", 40, producer, ITEMS)?;
    kernel::create_thread("consumer", 35, consumer, ITEMS)?;
    DONE.down();
    DONE.down();

    kernel::for_each_thread(|t| {
        info!("{:>4} {:<16} {:<8} priority {}", t.tid, t.name, t.status, t.priority);
    });
    kernel::print_stats();
    Ok(())
}

/// Host entry point. Arguments form the kernel command line.
#[cfg(not(target_os = "none"))]
fn main() -> Result<(), KernelError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    kernel::init_from_cmdline(&args.join(" "))?;
    run()
}

/// Firmware entry point. Runs the demo, then leaves the CPU to the idle
/// thread.
#[cfg(all(target_arch = "arm", target_os = "none"))]
#[cortex_m_rt::entry]
fn main() -> ! {
    kernel::init(prios::Config::default());
    run().expect("demo failed");
    kernel::exit()
}
