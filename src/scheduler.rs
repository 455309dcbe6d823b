//! # Scheduler
//!
//! Core scheduling state for PriOS: the thread arena, the ready queue, the
//! all-threads registry, priority donation, and MLFQS bookkeeping. This
//! module is a pure state machine. It never switches stacks or touches
//! interrupt state; `kernel.rs` wraps it in a critical section and drives
//! the port layer around it.
//!
//! ## Switching
//!
//! A context switch is split in two halves so the port can run in between
//! without the scheduler state being borrowed:
//!
//! 1. [`Scheduler::pick_next`]: the caller has already moved the current
//!    thread out of `Running`. Picks the next thread (idle when nothing is
//!    ready) and makes it current.
//! 2. [`Scheduler::finish_switch`]: now executing as the new thread. Marks
//!    it `Running`, restarts its time slice, and frees the previous thread's
//!    record if it was dying.
//!
//! ## Priority Donation
//!
//! Under [`Policy::Priority`], a thread about to block on a held lock walks
//! the chain of lock holders for at most `MAX_DONATION_DEPTH` hops, raising
//! each holder below its own priority. Releasing a lock drops the releaser
//! back to `max(original_priority, highest waiter on any lock still held)`.
//!
//! ## MLFQS
//!
//! Under [`Policy::Mlfqs`], every tick charges the running thread one unit
//! of `recent_cpu`. Once per second `load_avg` and every `recent_cpu` decay;
//! every `PRI_UPDATE_INTERVAL` ticks each priority is recomputed as
//! `clamp(63 - recent_cpu / 4 - 2 * nice, 0, 63)`.

use log::{debug, trace};

use crate::config::{
    Config, Policy, MAX_DONATION_DEPTH, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN,
    PRI_UPDATE_INTERVAL,
};
use crate::error::KernelError;
use crate::fixed_point::Fixed;
use crate::ready_queue::ReadyQueue;
use crate::thread::{
    AddressSpace, LockId, Slot, Thread, ThreadEntry, ThreadSet, ThreadStatus, ThreadTable, Tid,
};

/// Timer ticks split by what the CPU was doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub idle: u64,
    pub kernel: u64,
    pub user: u64,
}

/// Result of [`Scheduler::pick_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub prev: Slot,
    pub next: Slot,
}

/// Result of [`Scheduler::finish_switch`]: work the port must do now that
/// the new thread is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchTail {
    /// Slot whose execution context can be released.
    pub reclaimed: Option<Slot>,
    /// Address space to activate for the new thread.
    pub address_space: Option<AddressSpace>,
}

/// MLFQS priority for the given usage and niceness.
pub fn mlfqs_priority(recent_cpu: Fixed, nice: i8) -> u8 {
    let p = Fixed::from_int(PRI_MAX as i32) - recent_cpu.unscale(4) - Fixed::from_int(nice as i32 * 2);
    p.trunc().clamp(PRI_MIN as i32, PRI_MAX as i32) as u8
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The process-wide scheduler state. One instance lives in `kernel.rs` for
/// the lifetime of the kernel.
pub struct Scheduler {
    config: Config,

    threads: ThreadTable,
    ready: ReadyQueue,

    /// Every live thread. Dying threads leave the registry on exit.
    all: ThreadSet,

    current: Slot,
    /// The thread the kernel booted on. Its record is never reclaimed.
    initial: Slot,
    idle: Option<Slot>,

    next_tid: Tid,

    ticks: u64,
    /// Ticks since the current thread was last switched in.
    slice_ticks: u32,
    stats: TickStats,

    load_avg: Fixed,

    /// Set when the running thread should yield on interrupt return.
    yield_on_return: bool,
}

impl Scheduler {
    /// Create the scheduler, adopting the caller as the running bootstrap
    /// thread `main` in slot 0.
    pub fn new(config: Config) -> Self {
        let mut threads = ThreadTable::new();
        let initial = Slot::new(0);

        let mut main = Thread::new(Tid::FIRST, "main", PRI_DEFAULT, None);
        main.status = ThreadStatus::Running;
        if config.policy == Policy::Mlfqs {
            let p = mlfqs_priority(main.recent_cpu, main.nice);
            main.priority = p;
            main.original_priority = p;
        }
        threads.install(initial, main);

        let mut all = ThreadSet::EMPTY;
        all.insert(initial);

        Self {
            config,
            threads,
            ready: ReadyQueue::new(config.policy),
            all,
            current: initial,
            initial,
            idle: None,
            next_tid: Tid::FIRST.next(),
            ticks: 0,
            slice_ticks: 0,
            stats: TickStats::default(),
            load_avg: Fixed::ZERO,
            yield_on_return: false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn policy(&self) -> Policy {
        self.config.policy
    }

    #[inline]
    pub fn current(&self) -> Slot {
        self.current
    }

    pub fn current_thread(&self) -> &Thread {
        self.threads.thread(self.current)
    }

    pub fn idle(&self) -> Option<Slot> {
        self.idle
    }

    pub fn thread(&self, slot: Slot) -> &Thread {
        self.threads.thread(slot)
    }

    pub fn find(&self, tid: Tid) -> Option<Slot> {
        self.threads.find(tid)
    }

    /// Live threads in slot order.
    pub fn live_threads(&self) -> impl Iterator<Item = (Slot, &Thread)> {
        self.all.iter().map(move |slot| (slot, self.threads.thread(slot)))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn load_avg(&self) -> Fixed {
        self.load_avg
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn highest_ready(&self) -> Option<(Slot, u8)> {
        self.ready.highest_priority_thread()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Find a free slot for a new thread.
    ///
    /// # Returns
    /// - `Ok(slot)`: nothing is modified until [`Self::install_thread`]
    /// - `Err(KernelError::ThreadLimit)`: every slot is in use
    pub fn reserve_slot(&self) -> Result<Slot, KernelError> {
        self.threads.free_slot().ok_or(KernelError::thread_limit())
    }

    /// Install a new `Blocked` thread in a slot returned by
    /// [`Self::reserve_slot`] and add it to the registry.
    ///
    /// Under MLFQS the thread inherits the creator's `nice` and `priority`
    /// is replaced by the computed MLFQS priority.
    ///
    /// # Panics
    /// If `priority > PRI_MAX`.
    pub fn install_thread(&mut self, slot: Slot, name: &str, priority: u8, entry: ThreadEntry) -> Tid {
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);

        let tid = self.next_tid;
        self.next_tid = tid.next();

        let mut thread = Thread::new(tid, name, priority, Some(entry));
        if self.policy() == Policy::Mlfqs {
            thread.nice = self.current_thread().nice;
            let p = mlfqs_priority(thread.recent_cpu, thread.nice);
            thread.priority = p;
            thread.original_priority = p;
        }

        debug!("created thread {} '{}' (priority {})", tid, thread.name, thread.priority);
        self.threads.install(slot, thread);
        self.all.insert(slot);
        tid
    }

    /// Install the idle thread. It always has priority `PRI_MIN`, is never
    /// re-queued by a yield, and runs whenever nothing else is ready.
    pub fn install_idle(&mut self, slot: Slot, entry: ThreadEntry) -> Tid {
        assert!(self.idle.is_none(), "idle thread installed twice");
        let tid = self.install_thread(slot, "idle", PRI_MIN, entry);
        let idle = self.threads.thread_mut(slot);
        idle.priority = PRI_MIN;
        idle.original_priority = PRI_MIN;
        self.idle = Some(slot);
        tid
    }

    /// Move a blocked thread to the ready queue. Does not preempt; callers
    /// check [`Self::should_yield`] afterwards.
    ///
    /// # Panics
    /// If the thread is not `Blocked`.
    pub fn unblock(&mut self, slot: Slot) {
        let t = self.threads.thread_mut(slot);
        assert!(
            t.status == ThreadStatus::Blocked,
            "unblocking thread {} which is {}",
            t.tid,
            t.status
        );
        t.status = ThreadStatus::Ready;
        let priority = t.priority;
        self.ready.insert(slot, priority);
    }

    /// Running → Ready. The idle thread is not queued.
    pub fn yield_current(&mut self) {
        let cur = self.current;
        let t = self.threads.thread_mut(cur);
        t.status = ThreadStatus::Ready;
        let priority = t.priority;
        if Some(cur) != self.idle {
            self.ready.insert(cur, priority);
        }
    }

    /// Running → Blocked.
    pub fn block_current(&mut self) {
        self.threads.thread_mut(self.current).status = ThreadStatus::Blocked;
    }

    /// Running → Dying. The record stays until the next thread reclaims it.
    pub fn exit_current(&mut self) {
        let cur = self.current;
        self.all.remove(cur);
        let t = self.threads.thread_mut(cur);
        t.status = ThreadStatus::Dying;
        debug!("thread {} '{}' exiting", t.tid, t.name);
    }

    /// First half of a context switch. The current thread must already have
    /// left `Running`.
    ///
    /// # Panics
    /// If the current thread is still `Running`, or nothing is ready and
    /// no idle thread exists.
    pub fn pick_next(&mut self) -> Switch {
        let prev = self.current;
        assert!(
            self.threads.thread(prev).status != ThreadStatus::Running,
            "scheduling while the current thread is still running"
        );

        let next = match self.ready.next_thread_to_run() {
            Some(slot) => slot,
            None => match self.idle {
                Some(idle) => idle,
                None => panic!("no thread ready to run"),
            },
        };

        if next != prev {
            trace!(
                "switch {} -> {}",
                self.threads.thread(prev).tid,
                self.threads.thread(next).tid
            );
        }
        self.current = next;
        Switch { prev, next }
    }

    /// Second half of a context switch, run as the new current thread.
    pub fn finish_switch(&mut self, prev: Slot) -> SwitchTail {
        let cur = self.current;
        let t = self.threads.thread_mut(cur);
        t.status = ThreadStatus::Running;
        let address_space = t.address_space;
        self.slice_ticks = 0;

        let dying = self
            .threads
            .get(prev)
            .map_or(false, |t| t.status == ThreadStatus::Dying);
        let reclaimed = if prev != cur && prev != self.initial && dying {
            if let Some(t) = self.threads.remove(prev) {
                debug!("reclaimed thread {} '{}'", t.tid, t.name);
            }
            Some(prev)
        } else {
            None
        };

        SwitchTail { reclaimed, address_space }
    }

    /// The highest-priority member of `set`, ties broken by slot order.
    pub fn highest_in(&self, set: &ThreadSet) -> Option<Slot> {
        set.iter().fold(None, |best: Option<Slot>, slot| match best {
            Some(b) if self.threads.priority(b) >= self.threads.priority(slot) => Some(b),
            _ => Some(slot),
        })
    }

    /// Whether a ready thread outranks the running one. The idle thread
    /// gives way to any ready thread.
    pub fn should_yield(&self) -> bool {
        match self.ready.highest_priority_thread() {
            None => false,
            Some(_) if Some(self.current) == self.idle => true,
            Some((_, p)) => p > self.threads.priority(self.current),
        }
    }

    pub fn set_address_space(&mut self, slot: Slot, space: Option<AddressSpace>) {
        self.threads.thread_mut(slot).address_space = space;
    }

    // -----------------------------------------------------------------------
    // Priorities and donation
    // -----------------------------------------------------------------------

    /// Apply a priority request to the running thread.
    ///
    /// Raising always takes effect. Lowering while a donation is active
    /// only records the request; otherwise the new effective priority is
    /// the request or the highest waiter on a held lock, whichever is
    /// greater. Ignored under MLFQS.
    ///
    /// # Returns
    /// Whether the caller should yield.
    pub fn set_priority_current(&mut self, priority: u8) -> bool {
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        if self.policy() == Policy::Mlfqs {
            return false;
        }
        self.apply_priority_request(self.current, priority);
        self.should_yield()
    }

    /// Set the effective priority of any thread. The running thread gets
    /// the request rules of [`Self::set_priority_current`]; any other
    /// thread keeps its requested priority and takes `priority` as its
    /// effective one, never below the request. A ready thread moves to its
    /// new place in the ready queue, a blocked one is updated in place.
    ///
    /// # Returns
    /// Whether the running thread should yield.
    pub fn set_priority_of(&mut self, slot: Slot, priority: u8) -> bool {
        if slot == self.current {
            return self.set_priority_current(priority);
        }
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        if self.policy() == Policy::Mlfqs {
            return false;
        }
        self.requeue_with(slot, |s| {
            let t = s.threads.thread_mut(slot);
            t.priority = priority.max(t.original_priority);
        });
        self.should_yield()
    }

    fn apply_priority_request(&mut self, slot: Slot, requested: u8) {
        let max_waiter = self.max_waiter_priority(slot);
        let t = self.threads.thread_mut(slot);
        if t.original_priority == requested {
            return;
        }
        if requested > t.priority {
            t.original_priority = requested;
            t.priority = requested;
        } else if t.has_donation() {
            t.original_priority = requested;
        } else {
            t.original_priority = requested;
            t.priority = requested.max(max_waiter);
        }
    }

    /// Run `change` on thread `slot`, moving it to its new place in the
    /// ready queue if it is ready.
    fn requeue_with(&mut self, slot: Slot, change: impl FnOnce(&mut Self)) {
        let queued = self.ready.remove(slot);
        change(self);
        if queued {
            let priority = self.threads.priority(slot);
            self.ready.insert(slot, priority);
        }
    }

    /// Highest effective priority among threads blocked on any lock that
    /// `slot` holds, or `PRI_MIN` if there are none.
    pub fn max_waiter_priority(&self, slot: Slot) -> u8 {
        let held = &self.threads.thread(slot).acquired_locks;
        self.threads
            .iter()
            .filter(|(_, t)| t.status == ThreadStatus::Blocked)
            .filter(|(_, t)| t.lock_waiting_for.map_or(false, |l| held.contains(l)))
            .map(|(_, t)| t.priority)
            .max()
            .unwrap_or(PRI_MIN)
    }

    /// The thread holding `lock`, if any.
    pub fn holder_of(&self, lock: LockId) -> Option<Slot> {
        self.threads
            .iter()
            .find(|(_, t)| t.acquired_locks.contains(lock))
            .map(|(slot, _)| slot)
    }

    /// The running thread is about to block on `lock`. Records the wait and,
    /// under the priority policy, donates along the holder chain.
    pub fn wait_for_lock(&mut self, lock: LockId) {
        self.threads.thread_mut(self.current).lock_waiting_for = Some(lock);
        if self.policy() == Policy::Priority {
            self.donate(lock);
        }
    }

    fn donate(&mut self, lock: LockId) {
        let priority = self.threads.priority(self.current);
        let mut waiting_on = Some(lock);

        for _ in 0..MAX_DONATION_DEPTH {
            let holder = match waiting_on.and_then(|l| self.holder_of(l)) {
                Some(holder) => holder,
                None => break,
            };
            if self.threads.priority(holder) >= priority {
                break;
            }
            trace!("donating priority {} to thread {}", priority, self.threads.thread(holder).tid);
            self.requeue_with(holder, |s| s.threads.thread_mut(holder).priority = priority);
            waiting_on = self.threads.thread(holder).lock_waiting_for;
        }
    }

    /// The running thread now holds `lock`.
    pub fn lock_acquired(&mut self, lock: LockId) {
        let t = self.threads.thread_mut(self.current);
        t.lock_waiting_for = None;
        t.acquired_locks.insert(lock);
    }

    /// The running thread gives up `lock`. Under the priority policy its
    /// effective priority drops to what its remaining locks justify.
    pub fn release_lock(&mut self, lock: LockId) {
        let cur = self.current;
        self.threads.thread_mut(cur).acquired_locks.remove(lock);
        if self.policy() == Policy::Priority {
            let max_waiter = self.max_waiter_priority(cur);
            let t = self.threads.thread_mut(cur);
            let restored = t.original_priority.max(max_waiter);
            if restored != t.priority {
                trace!("thread {} priority {} -> {} on release", t.tid, t.priority, restored);
            }
            t.priority = restored;
        }
    }

    // -----------------------------------------------------------------------
    // MLFQS
    // -----------------------------------------------------------------------

    /// Set the running thread's niceness and, under MLFQS, its priority.
    ///
    /// # Returns
    /// Whether the caller should yield.
    pub fn set_nice(&mut self, nice: i8) -> bool {
        assert!((NICE_MIN..=NICE_MAX).contains(&nice), "nice {} out of range", nice);
        let mlfqs = self.policy() == Policy::Mlfqs;
        let t = self.threads.thread_mut(self.current);
        t.nice = nice;
        if mlfqs {
            let p = mlfqs_priority(t.recent_cpu, t.nice);
            t.priority = p;
            t.original_priority = p;
        }
        self.should_yield()
    }

    /// `load_avg * 100`, rounded.
    pub fn load_avg_x100(&self) -> i32 {
        self.load_avg.scale(100).round()
    }

    /// `recent_cpu * 100` of `slot`, rounded.
    pub fn recent_cpu_x100(&self, slot: Slot) -> i32 {
        self.threads.thread(slot).recent_cpu.scale(100).round()
    }

    fn update_load_avg(&mut self) {
        let running = usize::from(Some(self.current) != self.idle);
        let ready = (self.ready.len() + running) as i32;
        let c59 = Fixed::from_int(59) / Fixed::from_int(60);
        let c1 = Fixed::from_int(1) / Fixed::from_int(60);
        self.load_avg = c59 * self.load_avg + c1.scale(ready);
    }

    fn decay_recent_cpu(&mut self) {
        let twice = self.load_avg.scale(2);
        let coeff = twice / (twice + Fixed::ONE);
        for slot in self.all.iter() {
            let t = self.threads.thread_mut(slot);
            t.recent_cpu = coeff * t.recent_cpu + Fixed::from_int(t.nice as i32);
        }
    }

    fn refresh_priorities(&mut self) {
        for slot in self.all.iter() {
            if Some(slot) == self.idle {
                continue;
            }
            let t = self.threads.thread(slot);
            let p = mlfqs_priority(t.recent_cpu, t.nice);
            if p == t.priority {
                continue;
            }
            self.requeue_with(slot, |s| {
                let t = s.threads.thread_mut(slot);
                t.priority = p;
                t.original_priority = p;
            });
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// Account one timer tick. Runs in interrupt context.
    ///
    /// Preemption is only requested here; the interrupt-return path picks
    /// it up through [`Self::take_yield_request`].
    pub fn tick(&mut self) {
        self.ticks += 1;
        let mlfqs = self.policy() == Policy::Mlfqs;

        let cur = self.current;
        if Some(cur) == self.idle {
            self.stats.idle += 1;
        } else {
            let t = self.threads.thread_mut(cur);
            if t.address_space.is_some() {
                self.stats.user += 1;
            } else {
                self.stats.kernel += 1;
            }
            if mlfqs {
                t.recent_cpu = t.recent_cpu + Fixed::ONE;
            }
        }

        if mlfqs {
            if self.ticks % u64::from(self.config.ticks_per_second) == 0 {
                self.update_load_avg();
                self.decay_recent_cpu();
                debug!("load_avg {} after {} ticks", self.load_avg, self.ticks);
            }
            if self.ticks % PRI_UPDATE_INTERVAL == 0 {
                self.refresh_priorities();
            }
        }

        self.slice_ticks += 1;
        if self.slice_ticks >= self.config.time_slice {
            self.yield_on_return = true;
        }
    }

    /// Ask for a yield when the current interrupt returns.
    pub fn request_yield_on_return(&mut self) {
        self.yield_on_return = true;
    }

    /// Consume a pending yield request.
    pub fn take_yield_request(&mut self) -> bool {
        core::mem::take(&mut self.yield_on_return)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_THREADS, TICK_HZ};

    fn noop(_: usize) {}

    const ENTRY: ThreadEntry = ThreadEntry { func: noop, aux: 0 };

    fn spawn(s: &mut Scheduler, name: &str, priority: u8) -> Slot {
        let slot = s.reserve_slot().unwrap();
        s.install_thread(slot, name, priority, ENTRY);
        s.unblock(slot);
        slot
    }

    /// Leave the current thread ready and run `slot` instead.
    fn switch_to(s: &mut Scheduler, slot: Slot) {
        s.yield_current();
        assert!(s.ready.remove(slot));
        let prev = s.current;
        s.current = slot;
        s.finish_switch(prev);
    }

    fn run_next(s: &mut Scheduler) -> Slot {
        let sw = s.pick_next();
        s.finish_switch(sw.prev);
        sw.next
    }

    fn priority_of(s: &Scheduler, slot: Slot) -> u8 {
        s.thread(slot).priority
    }

    /// Wake the highest waiter in `set` the way the sync primitives do.
    fn wake(s: &mut Scheduler, set: &mut ThreadSet) {
        let slot = s.highest_in(set).unwrap();
        set.remove(slot);
        s.unblock(slot);
    }

    /// Every live thread is running, ready, or in exactly one of `waits`,
    /// and its status agrees.
    fn assert_one_place(s: &Scheduler, waits: &[&ThreadSet]) {
        for (slot, t) in s.threads.iter() {
            if t.status == ThreadStatus::Dying {
                continue;
            }
            let running = slot == s.current;
            let ready = s.ready.contains(slot);
            let waiting = waits.iter().filter(|w| w.contains(slot)).count();
            assert_eq!(
                usize::from(running) + usize::from(ready) + waiting,
                1,
                "thread {} running={} ready={} waiting in {}",
                t.tid,
                running,
                ready,
                waiting
            );
            let expected = if running {
                ThreadStatus::Running
            } else if ready {
                ThreadStatus::Ready
            } else {
                ThreadStatus::Blocked
            };
            assert_eq!(t.status, expected, "thread {}", t.tid);
        }
    }

    #[test]
    fn test_bootstrap_thread_is_running() {
        let s = Scheduler::new(Config::default());
        let main = s.current_thread();
        assert_eq!(main.tid, Tid::FIRST);
        assert_eq!(main.status, ThreadStatus::Running);
        assert_eq!(main.priority, PRI_DEFAULT);
        assert_eq!(s.live_threads().count(), 1);
    }

    #[test]
    fn test_higher_priority_runs_first() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 20);
        let b = spawn(&mut s, "b", 10);

        s.block_current();
        assert_eq!(run_next(&mut s), a);
        s.exit_current();
        assert_eq!(run_next(&mut s), b);
        // `a` was reclaimed by `b`.
        assert!(s.threads.get(a).is_none());
        assert_eq!(s.thread(b).status, ThreadStatus::Running);
    }

    #[test]
    fn test_idle_runs_when_nothing_ready() {
        let mut s = Scheduler::new(Config::default());
        let idle = s.reserve_slot().unwrap();
        s.install_idle(idle, ENTRY);
        s.unblock(idle);
        assert_eq!(s.ready_len(), 1);

        s.block_current();
        assert_eq!(run_next(&mut s), idle);

        // Idle yields without being queued, then is picked again.
        s.yield_current();
        assert_eq!(s.ready_len(), 0);
        assert_eq!(run_next(&mut s), idle);
        assert_eq!(priority_of(&s, idle), PRI_MIN);
    }

    #[test]
    fn test_tids_are_never_reused() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 40);
        let first = s.thread(a).tid;
        s.block_current();
        run_next(&mut s);
        s.exit_current();
        s.unblock(Slot::new(0));
        run_next(&mut s);

        let b = spawn(&mut s, "b", 40);
        assert_eq!(b, a);
        assert!(s.thread(b).tid > first);
    }

    #[test]
    fn test_initial_thread_is_not_reclaimed() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 10);
        s.exit_current();
        assert_eq!(run_next(&mut s), a);
        assert_eq!(s.thread(Slot::new(0)).status, ThreadStatus::Dying);
        assert_eq!(s.live_threads().count(), 1);
    }

    #[test]
    fn test_thread_limit() {
        let mut s = Scheduler::new(Config::default());
        for _ in 1..MAX_THREADS {
            let slot = s.reserve_slot().unwrap();
            s.install_thread(slot, "filler", 10, ENTRY);
        }
        assert_eq!(
            s.reserve_slot(),
            Err(KernelError::ThreadLimit { max: MAX_THREADS })
        );
    }

    #[test]
    fn test_highest_in_set() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 2);
        let b = spawn(&mut s, "b", 7);
        let c = spawn(&mut s, "c", 4);
        let mut set = ThreadSet::EMPTY;
        set.insert(a);
        set.insert(c);
        set.insert(b);
        assert_eq!(s.highest_in(&set), Some(b));
        assert_eq!(s.highest_in(&ThreadSet::EMPTY), None);
    }

    #[test]
    fn test_every_thread_has_one_place() {
        let mut s = Scheduler::new(Config::default());
        let lock = LockId::allocate();
        let mut lock_waiters = ThreadSet::EMPTY;
        let mut sema = ThreadSet::EMPTY;
        let mut cond = ThreadSet::EMPTY;
        macro_rules! check {
            () => {
                assert_one_place(&s, &[&lock_waiters, &sema, &cond])
            };
        }

        let main = s.current();
        let a = spawn(&mut s, "a", 40);
        let b = spawn(&mut s, "b", 35);
        let c = spawn(&mut s, "c", 20);
        check!();

        // main holds the lock; `a` blocks on it and donates.
        s.lock_acquired(lock);
        switch_to(&mut s, a);
        check!();
        s.wait_for_lock(lock);
        lock_waiters.insert(a);
        s.block_current();
        assert_eq!(run_next(&mut s), main);
        check!();

        // Release hands the lock to `a`.
        s.release_lock(lock);
        wake(&mut s, &mut lock_waiters);
        check!();
        assert!(s.should_yield());
        s.yield_current();
        assert_eq!(run_next(&mut s), a);
        s.lock_acquired(lock);
        check!();

        // `a` downs an empty semaphore, `b` waits on a condition.
        sema.insert(a);
        s.block_current();
        assert_eq!(run_next(&mut s), b);
        check!();
        cond.insert(b);
        s.block_current();
        assert_eq!(run_next(&mut s), main);
        check!();

        wake(&mut s, &mut sema);
        check!();
        s.yield_current();
        assert_eq!(run_next(&mut s), a);
        check!();

        wake(&mut s, &mut cond);
        s.release_lock(lock);
        check!();
        s.exit_current();
        assert_eq!(run_next(&mut s), b);
        assert!(s.threads.get(a).is_none());
        check!();

        s.exit_current();
        assert_eq!(run_next(&mut s), main);
        check!();
        assert!(s.ready.contains(c));
    }

    #[test]
    fn test_donation_and_undonation() {
        let mut s = Scheduler::new(Config::default());
        let lock = LockId::allocate();
        let low = spawn(&mut s, "low", 10);
        let high = spawn(&mut s, "high", 40);

        switch_to(&mut s, low);
        s.lock_acquired(lock);

        switch_to(&mut s, high);
        s.wait_for_lock(lock);
        assert_eq!(priority_of(&s, low), 40);
        assert_eq!(s.thread(low).original_priority, 10);
        s.block_current();
        assert_eq!(run_next(&mut s), low);

        s.release_lock(lock);
        assert_eq!(priority_of(&s, low), 10);
        s.unblock(high);
        assert!(s.should_yield());
    }

    #[test]
    fn test_donation_requeues_ready_holder() {
        let mut s = Scheduler::new(Config::default());
        let lock = LockId::allocate();
        let holder = spawn(&mut s, "holder", 5);
        let mid = spawn(&mut s, "mid", 20);
        switch_to(&mut s, holder);
        s.lock_acquired(lock);

        // Back to main; the holder sits in the ready queue at 5.
        switch_to(&mut s, Slot::new(0));
        s.wait_for_lock(lock);
        assert_eq!(s.highest_ready(), Some((holder, PRI_DEFAULT)));
        assert!(s.ready.contains(mid));
    }

    #[test]
    fn test_donation_chain_stops_after_bound() {
        let mut s = Scheduler::new(Config::default());
        let locks: [LockId; 10] = core::array::from_fn(|_| LockId::allocate());
        let mut holders = [Slot::new(0); 10];
        for (i, holder) in holders.iter_mut().enumerate() {
            let slot = s.reserve_slot().unwrap();
            s.install_thread(slot, "chain", 1, ENTRY);
            let t = s.threads.thread_mut(slot);
            t.acquired_locks.insert(locks[i]);
            if i > 0 {
                t.lock_waiting_for = Some(locks[i - 1]);
            }
            *holder = slot;
        }

        s.wait_for_lock(locks[9]);
        for (i, &holder) in holders.iter().enumerate() {
            let expected = if i >= 2 { PRI_DEFAULT } else { 1 };
            assert_eq!(priority_of(&s, holder), expected, "holder {}", i);
        }
    }

    #[test]
    fn test_donation_walk_stops_at_higher_holder() {
        let mut s = Scheduler::new(Config::default());
        let a = LockId::allocate();
        let b = LockId::allocate();
        let top = s.reserve_slot().unwrap();
        s.install_thread(top, "top", 5, ENTRY);
        s.threads.thread_mut(top).acquired_locks.insert(a);
        let mid = s.reserve_slot().unwrap();
        s.install_thread(mid, "mid", 50, ENTRY);
        let t = s.threads.thread_mut(mid);
        t.acquired_locks.insert(b);
        t.lock_waiting_for = Some(a);

        s.wait_for_lock(b);
        assert_eq!(priority_of(&s, mid), 50);
        assert_eq!(priority_of(&s, top), 5);
    }

    #[test]
    fn test_release_keeps_donation_from_other_lock() {
        let mut s = Scheduler::new(Config::default());
        let a = LockId::allocate();
        let b = LockId::allocate();
        let low = spawn(&mut s, "low", 10);
        let m = spawn(&mut s, "m", 20);
        let h = spawn(&mut s, "h", 40);

        switch_to(&mut s, low);
        s.lock_acquired(a);
        s.lock_acquired(b);

        switch_to(&mut s, h);
        s.wait_for_lock(b);
        s.block_current();
        assert_eq!(run_next(&mut s), low);
        assert_eq!(priority_of(&s, low), 40);

        switch_to(&mut s, m);
        s.wait_for_lock(a);
        s.block_current();
        assert_eq!(run_next(&mut s), low);

        s.release_lock(b);
        assert_eq!(priority_of(&s, low), 20);
        s.release_lock(a);
        assert_eq!(priority_of(&s, low), 10);
    }

    #[test]
    fn test_set_priority_rules() {
        let mut s = Scheduler::new(Config::default());
        let lock = LockId::allocate();
        let main = s.current();

        // Raising always applies.
        s.set_priority_current(40);
        assert_eq!(priority_of(&s, main), 40);
        assert_eq!(s.thread(main).original_priority, 40);

        // Lowering with no donation, but a lower waiter on a held lock.
        s.lock_acquired(lock);
        let waiter = s.reserve_slot().unwrap();
        s.install_thread(waiter, "waiter", 25, ENTRY);
        s.threads.thread_mut(waiter).lock_waiting_for = Some(lock);
        s.set_priority_current(10);
        assert_eq!(priority_of(&s, main), 25);
        assert_eq!(s.thread(main).original_priority, 10);

        // Lowering while a donation is in effect only records the request.
        s.set_priority_current(5);
        assert_eq!(priority_of(&s, main), 25);
        assert_eq!(s.thread(main).original_priority, 5);

        s.release_lock(lock);
        assert_eq!(priority_of(&s, main), 5);
    }

    #[test]
    fn test_lowering_priority_yields_to_ready() {
        let mut s = Scheduler::new(Config::default());
        spawn(&mut s, "other", 20);
        assert!(!s.should_yield());
        assert!(s.set_priority_current(10));
    }

    #[test]
    fn test_set_priority_of_ready_thread_requeues() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 10);
        let b = spawn(&mut s, "b", 20);
        assert_eq!(s.highest_ready(), Some((b, 20)));
        assert!(s.set_priority_of(a, 50));
        assert_eq!(s.highest_ready(), Some((a, 50)));
        assert_eq!(s.thread(a).original_priority, 10);
    }

    #[test]
    fn test_set_priority_of_keeps_request_as_floor() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 30);
        assert!(!s.set_priority_of(a, 5));
        assert_eq!(priority_of(&s, a), 30);
        assert_eq!(s.thread(a).original_priority, 30);
        assert_eq!(s.highest_ready(), Some((a, 30)));
    }

    #[test]
    fn test_set_priority_of_overrides_donation_of_ready_holder() {
        let mut s = Scheduler::new(Config::default());
        let lock = LockId::allocate();
        let holder = spawn(&mut s, "holder", 10);
        switch_to(&mut s, holder);
        s.lock_acquired(lock);
        switch_to(&mut s, Slot::new(0));
        s.wait_for_lock(lock);
        assert_eq!(priority_of(&s, holder), PRI_DEFAULT);

        assert!(!s.set_priority_of(holder, 20));
        assert_eq!(priority_of(&s, holder), 20);
        assert_eq!(s.thread(holder).original_priority, 10);
        assert_eq!(s.highest_ready(), Some((holder, 20)));

        // Never below the holder's own request.
        s.set_priority_of(holder, 2);
        assert_eq!(priority_of(&s, holder), 10);
        assert_eq!(s.highest_ready(), Some((holder, 10)));
    }

    #[test]
    fn test_set_priority_of_blocked_thread_in_place() {
        let mut s = Scheduler::new(Config::default());
        let a = spawn(&mut s, "a", 40);
        switch_to(&mut s, a);
        s.block_current();
        assert_eq!(run_next(&mut s), Slot::new(0));

        assert!(!s.set_priority_of(a, 50));
        assert_eq!(priority_of(&s, a), 50);
        assert_eq!(s.thread(a).original_priority, 40);
        assert_eq!(s.thread(a).status, ThreadStatus::Blocked);
        assert!(!s.ready.contains(a));
    }

    #[test]
    fn test_priority_never_below_original() {
        let mut s = Scheduler::new(Config::default());
        let lock = LockId::allocate();
        s.lock_acquired(lock);
        for p in [50, 3, 63, 0, 31] {
            s.set_priority_current(p);
            let t = s.current_thread();
            assert!(t.priority >= t.original_priority);
        }
        s.release_lock(lock);
        let t = s.current_thread();
        assert_eq!(t.priority, t.original_priority);
    }

    #[test]
    fn test_time_slice_requests_yield() {
        let mut s = Scheduler::new(Config::default());
        for _ in 1..Config::default().time_slice {
            s.tick();
            assert!(!s.take_yield_request());
        }
        s.tick();
        assert!(s.take_yield_request());
        assert!(!s.take_yield_request());
    }

    #[test]
    fn test_tick_statistics() {
        let mut s = Scheduler::new(Config::default());
        let idle = s.reserve_slot().unwrap();
        s.install_idle(idle, ENTRY);
        s.unblock(idle);

        s.tick();
        s.set_address_space(s.current(), AddressSpace::new(0x1000));
        s.tick();
        s.block_current();
        run_next(&mut s);
        s.tick();

        assert_eq!(s.stats(), TickStats { idle: 1, kernel: 1, user: 1 });
    }

    #[test]
    fn test_mlfqs_priority_formula() {
        assert_eq!(mlfqs_priority(Fixed::ZERO, 0), 63);
        assert_eq!(mlfqs_priority(Fixed::from_int(100), 0), 38);
        assert_eq!(mlfqs_priority(Fixed::from_int(10), 0), 60);
        assert_eq!(mlfqs_priority(Fixed::ZERO, 20), 23);
        assert_eq!(mlfqs_priority(Fixed::ZERO, -20), 63);
        assert_eq!(mlfqs_priority(Fixed::from_int(400), 20), 0);
    }

    #[test]
    fn test_mlfqs_spinning_thread() {
        let mut s = Scheduler::new(Config::new(Policy::Mlfqs));
        let main = s.current();
        assert_eq!(priority_of(&s, main), PRI_MAX);

        for tick in 1..=100u32 {
            s.tick();
            if tick % 4 == 0 {
                let expected = 63 - tick / 4;
                assert_eq!(priority_of(&s, main) as u32, expected);
            }
        }
        assert_eq!(s.thread(main).recent_cpu, Fixed::from_int(100));
        assert_eq!(s.recent_cpu_x100(main), 10_000);
        assert_eq!(priority_of(&s, main), 38);
        assert!(s.ticks() < u64::from(TICK_HZ));
    }

    #[test]
    fn test_mlfqs_load_avg_after_one_second() {
        let mut config = Config::new(Policy::Mlfqs);
        config.ticks_per_second = 100;
        let mut s = Scheduler::new(config);
        for _ in 0..100 {
            s.tick();
        }
        assert_eq!(s.load_avg().raw(), 273);
        assert_eq!(s.load_avg_x100(), 2);
        assert_eq!(s.recent_cpu_x100(s.current()), 322);
    }

    #[test]
    fn test_mlfqs_refresh_moves_ready_threads() {
        let mut s = Scheduler::new(Config::new(Policy::Mlfqs));
        let other = spawn(&mut s, "other", PRI_DEFAULT);
        assert_eq!(priority_of(&s, other), PRI_MAX);
        switch_to(&mut s, other);
        for _ in 0..8 {
            s.tick();
        }
        // `other` ran 8 ticks; main is queued untouched at 63.
        assert_eq!(priority_of(&s, other), 61);
        switch_to(&mut s, Slot::new(0));
        assert_eq!(s.highest_ready(), Some((other, 61)));
    }

    #[test]
    fn test_mlfqs_nice_is_inherited_and_set_priority_ignored() {
        let mut s = Scheduler::new(Config::new(Policy::Mlfqs));
        s.set_nice(5);
        assert_eq!(s.current_thread().priority, 53);
        let child = spawn(&mut s, "child", 10);
        assert_eq!(s.thread(child).nice, 5);
        assert_eq!(priority_of(&s, child), 53);

        assert!(!s.set_priority_current(10));
        assert_eq!(s.current_thread().priority, 53);
    }

    #[test]
    fn test_mlfqs_disables_donation() {
        let mut s = Scheduler::new(Config::new(Policy::Mlfqs));
        let lock = LockId::allocate();
        let holder = s.reserve_slot().unwrap();
        s.install_thread(holder, "holder", 0, ENTRY);
        s.threads.thread_mut(holder).acquired_locks.insert(lock);
        s.set_nice(-20);
        s.threads.thread_mut(holder).priority = 10;

        s.wait_for_lock(lock);
        assert_eq!(priority_of(&s, holder), 10);
    }

    #[test]
    #[should_panic(expected = "still running")]
    fn test_schedule_requires_transition() {
        let mut s = Scheduler::new(Config::default());
        s.pick_next();
    }
}
