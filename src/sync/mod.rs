//! # Synchronization Primitives
//!
//! On a single CPU the only mutual exclusion below the scheduler is masking
//! interrupts. This module wraps that in two pieces:
//!
//! - [`InterruptGuard`]: disables interrupts on creation and restores the
//!   previous level on drop, on every exit path.
//! - [`IrqLock`]: a spin lock that can only be taken while holding the
//!   [`CriticalSection`] token an `InterruptGuard` hands out. With interrupts
//!   masked nothing can contend for it, so finding it taken means the
//!   holder re-entered itself, which panics.
//!
//! The blocking primitives built on top:
//!
//! | Primitive     | Blocks? | Wakes            | Notes                          |
//! |---------------|---------|------------------|--------------------------------|
//! | [`Semaphore`] | yes     | highest priority | `try_down`/`up` are ISR-safe   |
//! | [`Lock`]      | yes     | highest priority | owner tracking, donation       |
//! | [`Condvar`]   | yes     | highest priority | Mesa semantics, used with Lock |
//!
//! Nothing that blocks may be called from interrupt context, and no
//! `IrqLock` guard may be held across a block.

use core::marker::PhantomData;
use core::ops::Deref;

use spin::{Mutex, MutexGuard};

use crate::arch;

mod condvar;
mod lock;
mod semaphore;

pub use condvar::Condvar;
pub use lock::Lock;
pub use semaphore::Semaphore;

/// Proof that interrupts are masked. Only an [`InterruptGuard`] creates one.
pub struct CriticalSection {
    // Tied to the CPU that masked its interrupts.
    _not_send: PhantomData<*mut ()>,
}

impl CriticalSection {
    const fn new() -> Self {
        Self { _not_send: PhantomData }
    }
}

/// RAII interrupt mask. Restores the level found at creation when dropped.
pub struct InterruptGuard {
    was_enabled: bool,
    cs: CriticalSection,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = arch::disable_interrupts();
        Self { was_enabled, cs: CriticalSection::new() }
    }

    /// Whether interrupts were enabled before this guard masked them.
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for InterruptGuard {
    type Target = CriticalSection;

    fn deref(&self) -> &CriticalSection {
        &self.cs
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        arch::restore_interrupts(self.was_enabled);
    }
}

/// Execute a closure within a critical section (interrupts disabled).
///
/// The previous interrupt level is restored when the closure returns, so
/// critical sections nest.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     let mut state = STATE.lock(cs);
///     state.count += 1;
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let guard = InterruptGuard::new();
    f(&guard)
}

/// Data shared between threads and interrupt handlers.
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Lock for as long as the critical section lasts.
    ///
    /// # Panics
    /// If the lock is already held, which with interrupts masked can only
    /// be re-entry.
    pub fn lock<'a>(&'a self, _cs: &'a CriticalSection) -> MutexGuard<'a, T> {
        match self.inner.try_lock() {
            Some(guard) => guard,
            None => panic!("IrqLock re-entered"),
        }
    }
}
