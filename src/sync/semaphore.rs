//! Counting semaphore.

use crate::kernel;
use crate::sync::{critical_section, CriticalSection, InterruptGuard, IrqLock};
use crate::thread::{Slot, ThreadSet};

struct State {
    value: u32,
    waiters: ThreadSet,
}

/// A non-negative counter with two atomic operations:
///
/// - `down` waits for the value to become positive, then decrements it.
/// - `up` increments the value and wakes the highest-priority waiter.
pub struct Semaphore {
    state: IrqLock<State>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            state: IrqLock::new(State { value, waiters: ThreadSet::EMPTY }),
        }
    }

    /// Wait until the value is positive, then decrement it.
    ///
    /// # Panics
    /// If called from interrupt context.
    pub fn down(&self) {
        let cs = InterruptGuard::new();
        kernel::assert_can_block();
        let me = kernel::current_slot(&cs);
        while !self.take_or_wait(&cs, me) {
            kernel::block_current(&cs);
        }
    }

    /// Decrement the value if it is positive. Never blocks, so it may be
    /// called from an interrupt handler.
    pub fn try_down(&self) -> bool {
        critical_section(|cs| self.take(cs))
    }

    /// Increment the value and wake the highest-priority waiter, yielding
    /// to it if it outranks the caller. May be called from an interrupt
    /// handler, in which case the yield happens on interrupt return.
    pub fn up(&self) {
        let woke = critical_section(|cs| self.release_one(cs));
        if woke {
            kernel::preempt();
        }
    }

    /// Current value, for diagnostics.
    pub fn value(&self) -> u32 {
        critical_section(|cs| self.state.lock(cs).value)
    }

    pub(crate) fn take(&self, cs: &CriticalSection) -> bool {
        let mut state = self.state.lock(cs);
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            false
        }
    }

    /// Take a unit, or register `me` as a waiter if none is available.
    pub(crate) fn take_or_wait(&self, cs: &CriticalSection, me: Slot) -> bool {
        let mut state = self.state.lock(cs);
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            state.waiters.insert(me);
            false
        }
    }

    /// Wake the highest-priority waiter, if any, and increment the value.
    /// Returns whether a thread was woken.
    pub(crate) fn release_one(&self, cs: &CriticalSection) -> bool {
        let mut state = self.state.lock(cs);
        let woke = kernel::wake_highest(cs, &mut state.waiters);
        state.value += 1;
        woke
    }
}
