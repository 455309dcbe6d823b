//! Condition variable.

use crate::kernel;
use crate::sync::{critical_section, CriticalSection, InterruptGuard, IrqLock, Lock};
use crate::thread::ThreadSet;

/// Each waiter behaves as if it had a private one-shot semaphore:
/// `pending` holds threads not yet signalled, `posted` those signalled but
/// not yet past their wait, and `parked` those actually blocked.
struct Waiters {
    pending: ThreadSet,
    posted: ThreadSet,
    parked: ThreadSet,
}

/// Condition variable with Mesa semantics, always paired with a [`Lock`].
///
/// A signal only makes the waiter runnable. By the time it has re-acquired
/// the lock the condition may have changed again, so waits belong in a
/// loop that re-checks the condition.
pub struct Condvar {
    waiters: IrqLock<Waiters>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: IrqLock::new(Waiters {
                pending: ThreadSet::EMPTY,
                posted: ThreadSet::EMPTY,
                parked: ThreadSet::EMPTY,
            }),
        }
    }

    /// Atomically release `lock` and wait to be signalled, then re-acquire
    /// `lock` before returning.
    ///
    /// # Panics
    /// If the caller does not hold `lock`, or from interrupt context.
    pub fn wait(&self, lock: &Lock) {
        kernel::assert_can_block();
        assert!(lock.held_by_current_thread(), "waiting on a condition without its lock");

        let me = critical_section(|cs| {
            let me = kernel::current_slot(cs);
            self.waiters.lock(cs).pending.insert(me);
            me
        });
        lock.release();

        {
            let cs = InterruptGuard::new();
            loop {
                let mut waiters = self.waiters.lock(&cs);
                if waiters.posted.remove(me) {
                    break;
                }
                waiters.parked.insert(me);
                drop(waiters);
                kernel::block_current(&cs);
            }
        }

        lock.acquire();
    }

    /// Wake the highest-priority waiter, if any.
    ///
    /// # Panics
    /// If the caller does not hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread(), "signalling a condition without its lock");
        if critical_section(|cs| self.signal_one(cs)) {
            kernel::preempt();
        }
    }

    /// Wake every waiter.
    ///
    /// # Panics
    /// If the caller does not hold `lock`.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread(), "signalling a condition without its lock");
        let woke = critical_section(|cs| {
            let mut woke = false;
            while !self.waiters.lock(cs).pending.is_empty() {
                woke |= self.signal_one(cs);
            }
            woke
        });
        if woke {
            kernel::preempt();
        }
    }

    /// Post to the highest-priority pending waiter. Returns whether a
    /// blocked thread was made ready.
    fn signal_one(&self, cs: &CriticalSection) -> bool {
        let mut waiters = self.waiters.lock(cs);
        let slot = match kernel::highest_in(cs, &waiters.pending) {
            Some(slot) => slot,
            None => return false,
        };
        waiters.pending.remove(slot);
        waiters.posted.insert(slot);
        if waiters.parked.remove(slot) {
            kernel::unblock_slot(cs, slot);
            true
        } else {
            false
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
