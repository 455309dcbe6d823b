//! Lock with priority donation.

use crate::kernel;
use crate::sync::{critical_section, CriticalSection, InterruptGuard, IrqLock, Semaphore};
use crate::thread::{LockId, Slot};

struct Owner {
    holder: Option<Slot>,
    /// Assigned on first acquire so locks can be built in a `const`.
    id: Option<LockId>,
}

/// A binary semaphore with an owner.
///
/// Only the holder may release it and the holder may not acquire it again.
/// Under the priority policy, a thread blocking on a held lock donates its
/// priority to the holder (and onward along the chain of holders) until
/// the lock is released.
pub struct Lock {
    sema: Semaphore,
    owner: IrqLock<Owner>,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            sema: Semaphore::new(1),
            owner: IrqLock::new(Owner { holder: None, id: None }),
        }
    }

    fn id(&self, cs: &CriticalSection) -> LockId {
        *self.owner.lock(cs).id.get_or_insert_with(LockId::allocate)
    }

    /// Acquire the lock, sleeping until it is available.
    ///
    /// # Panics
    /// If called from interrupt context or by the current holder.
    pub fn acquire(&self) {
        let cs = InterruptGuard::new();
        kernel::assert_can_block();
        let me = kernel::current_slot(&cs);
        let id = self.id(&cs);
        assert!(
            self.owner.lock(&cs).holder != Some(me),
            "lock acquired twice by the same thread"
        );

        while !self.sema.take_or_wait(&cs, me) {
            kernel::with_scheduler(&cs, |s| s.wait_for_lock(id));
            kernel::block_current(&cs);
        }
        self.take_ownership(&cs, me, id);
    }

    /// Acquire the lock only if it is free. Never blocks and never donates.
    ///
    /// # Panics
    /// If called by the current holder.
    pub fn try_acquire(&self) -> bool {
        critical_section(|cs| {
            let me = kernel::current_slot(cs);
            let id = self.id(cs);
            assert!(
                self.owner.lock(cs).holder != Some(me),
                "lock acquired twice by the same thread"
            );
            if !self.sema.take(cs) {
                return false;
            }
            self.take_ownership(cs, me, id);
            true
        })
    }

    fn take_ownership(&self, cs: &CriticalSection, me: Slot, id: LockId) {
        kernel::with_scheduler(cs, |s| s.lock_acquired(id));
        self.owner.lock(cs).holder = Some(me);
    }

    /// Release the lock, dropping any priority it was lending the caller
    /// and waking the highest-priority waiter.
    ///
    /// # Panics
    /// If the caller does not hold the lock.
    pub fn release(&self) {
        let woke = critical_section(|cs| {
            let me = kernel::current_slot(cs);
            let id = {
                let mut owner = self.owner.lock(cs);
                assert!(
                    owner.holder == Some(me),
                    "lock released by a thread that does not hold it"
                );
                owner.holder = None;
                owner.id
            };
            if let Some(id) = id {
                kernel::with_scheduler(cs, |s| s.release_lock(id));
            }
            self.sema.release_one(cs)
        });
        if woke {
            kernel::preempt();
        }
    }

    /// Whether the running thread holds this lock.
    pub fn held_by_current_thread(&self) -> bool {
        critical_section(|cs| {
            let me = kernel::current_slot(cs);
            self.owner.lock(cs).holder == Some(me)
        })
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
