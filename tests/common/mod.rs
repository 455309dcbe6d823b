//! Shared setup for the kernel integration tests.
//!
//! The kernel is a process-wide singleton, so tests that boot it take
//! [`boot`]'s guard and run one at a time. Each boot adopts the calling
//! test thread as `main` at priority 31.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::vec::Vec;

use log::LevelFilter;
use prios::{kernel, Config, Policy};

static KERNEL: Mutex<()> = Mutex::new(());

/// Boot a fresh kernel under `policy` and hold it until the guard drops.
pub fn boot(policy: Policy) -> MutexGuard<'static, ()> {
    let guard = KERNEL.lock().unwrap_or_else(PoisonError::into_inner);
    reboot(policy);
    guard
}

/// Replace the running kernel with a fresh one. Callers hold [`boot`]'s
/// guard.
pub fn reboot(policy: Policy) {
    let mut config = Config::new(policy);
    config.log_level = LevelFilter::Warn;
    kernel::init(config);
    kernel::start().unwrap();
}

/// Ordered record of events written by kernel threads. Only one kernel
/// thread runs at a time, so the mutex is never contended.
pub struct Journal(Mutex<Vec<usize>>);

impl Journal {
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub fn push(&self, event: usize) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn take(&self) -> Vec<usize> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
