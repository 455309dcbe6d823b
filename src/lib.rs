//! # PriOS: Priority Operating System
//!
//! A preemptive kernel-thread scheduler for a single CPU, with priority
//! donation through locks and an optional multi-level feedback queue
//! (MLFQS) policy.
//!
//! ## Overview
//!
//! Every thread has a priority between [`config::PRI_MIN`] (0) and
//! [`config::PRI_MAX`] (63). The highest-priority ready thread always
//! runs; threads of equal priority share the CPU round-robin, one time
//! slice at a time. The policy is picked once at boot:
//!
//! - **Priority**: priorities are set by threads. A thread that blocks on
//!   a lock lends its priority to the holder, and onward along the chain
//!   of holders, so a low-priority holder cannot stall a high-priority
//!   waiter behind medium-priority work.
//! - **MLFQS**: priorities are computed from each thread's `nice` value
//!   and its recent CPU usage, decayed by the system load average.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   Application Threads                   │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init() · start() · create_thread() · yield_now()     │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   Ready Queue      │  Sync Primitives  │
//! │  scheduler.rs│   ready_queue.rs   │  sync/            │
//! │  ─ tick()    │   ─ OrderedList    │  ─ Semaphore      │
//! │  ─ pick_next │   ─ Levels (64)    │  ─ Lock           │
//! │  ─ donate()  │                    │  ─ Condvar        │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │       Thread Model (thread.rs) · Fixed Point (17.14)    │
//! │       Tid · Slot · Thread · ThreadTable · ThreadSet     │
//! ├────────────────────────────────────────────────────────┤
//! │      Arch Port (arch/cortex_m4.rs · arch/hosted.rs)     │
//! │    Context Switch · Interrupt Mask · Timer · Console   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: all kernel state is statically sized
//! - **Thread arena**: `[Option<Thread>; MAX_THREADS]` indexed by slot
//! - **Locking**: interrupts masked through [`sync::InterruptGuard`]; the
//!   scheduler lives in an [`sync::IrqLock`] that is never held across a
//!   context switch
//!
//! ## Ports
//!
//! On `thumbv7em-none-eabi` the kernel runs on bare metal. Everywhere else
//! it runs on the [`arch::hosted`] port, where each kernel thread is a host
//! thread and only one of them runs at a time; this is what the tests use.

#![no_std]

#[cfg(not(target_os = "none"))]
extern crate std;

pub mod arch;
pub mod config;
pub mod error;
pub mod fixed_point;
pub mod kernel;
pub mod logger;
pub mod ready_queue;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use config::{Config, Policy};
pub use error::KernelError;
pub use thread::{ThreadInfo, ThreadStatus, Tid};
