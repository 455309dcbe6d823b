//! # Kernel
//!
//! Top-level kernel initialization and public thread API for PriOS.
//!
//! The kernel owns the global [`Scheduler`] and drives the port layer
//! around it: every state change happens inside a critical section, and
//! the actual stack switch happens between [`Scheduler::pick_next`] and
//! [`Scheduler::finish_switch`] with interrupts still masked but the
//! scheduler state unlocked.
//!
//! ## Startup Sequence
//!
//! ```text
//! boot
//!   └─► main()
//!         ├─► kernel::init(config)      ← adopt caller as thread `main`
//!         ├─► kernel::start()           ← create idle, enable interrupts
//!         │     └─► waits until idle has run once
//!         └─► kernel::create_thread()   ← (×N), preempts if outranked
//! ```
//!
//! ## Context Rules
//!
//! Operations that may block (`Semaphore::down`, `Lock::acquire`,
//! `Condvar::wait`, [`block`], [`yield_now`], [`exit`]) panic when called
//! from interrupt context. [`tick`] runs in interrupt context and only
//! requests preemption; the port performs the yield on interrupt return.

use heapless::Vec;
use log::{debug, info};

use crate::arch;
use crate::config::{Config, Policy, MAX_THREADS, PRI_MAX, PRI_MIN};
use crate::error::KernelError;
use crate::logger;
use crate::scheduler::{Scheduler, Switch, TickStats};
use crate::sync::{critical_section, CriticalSection, InterruptGuard, IrqLock, Semaphore};
use crate::thread::{AddressSpace, Slot, ThreadEntry, ThreadFunc, ThreadInfo, ThreadSet, Tid};

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Global scheduler instance, set by [`init`].
static SCHEDULER: IrqLock<Option<Scheduler>> = IrqLock::new(None);

/// Upped once by the idle thread so [`start`] knows it exists.
static IDLE_STARTED: Semaphore = Semaphore::new(0);

/// Run `f` on the global scheduler.
///
/// # Panics
/// If [`init`] has not run, or if called from inside another `f`.
pub(crate) fn with_scheduler<R>(cs: &CriticalSection, f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut guard = SCHEDULER.lock(cs);
    match guard.as_mut() {
        Some(scheduler) => f(scheduler),
        None => panic!("kernel not initialized"),
    }
}

fn with_scheduler_cs<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    critical_section(|cs| with_scheduler(cs, f))
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Initialize the PriOS kernel, turning the caller into the thread `main`.
///
/// Must be called before any other kernel function. Calling it again
/// discards all previous kernel state.
pub fn init(config: Config) {
    // The logger can only be installed once per program; a repeated init
    // only changes the level.
    let _ = logger::init(config.log_level, arch::console_write);

    critical_section(|cs| {
        arch::init();
        *SCHEDULER.lock(cs) = Some(Scheduler::new(config));
    });

    info!(
        "PriOS initialized: {:?} policy, {} Hz, slice {} ticks",
        config.policy, config.ticks_per_second, config.time_slice
    );
}

/// Parse `cmdline` (see [`Config::from_cmdline`]) and initialize with it.
pub fn init_from_cmdline(cmdline: &str) -> Result<(), KernelError> {
    let config = Config::from_cmdline(cmdline)?;
    init(config);
    Ok(())
}

/// Start preemptive scheduling: create the idle thread, start the timer,
/// and enable interrupts. Returns once the idle thread is established.
pub fn start() -> Result<(), KernelError> {
    spawn("idle", PRI_MIN, ThreadEntry { func: idle_main, aux: 0 }, true)?;

    let hz = with_scheduler_cs(|s| s.config().ticks_per_second);
    arch::start_timer(hz);
    arch::enable_interrupts();

    IDLE_STARTED.down();
    info!("scheduler started");
    Ok(())
}

/// Create a thread named `name` that runs `func(aux)` and exits when it
/// returns.
///
/// The thread is ready on return. If it outranks the caller, the caller
/// yields to it first.
///
/// # Returns
/// - `Ok(tid)`: identifier of the new thread
/// - `Err(KernelError::ThreadLimit)`: every thread slot is in use
/// - `Err(KernelError::ContextUnavailable)`: the port could not provide a
///   stack or host thread
///
/// # Example
/// ```ignore
/// fn worker(n: usize) { log::info!("worker {}", n); }
///
/// let tid = kernel::create_thread("worker", 40, worker, 7)?;
/// ```
pub fn create_thread(name: &str, priority: u8, func: ThreadFunc, aux: usize) -> Result<Tid, KernelError> {
    assert!(priority <= PRI_MAX, "priority {} out of range", priority);
    spawn(name, priority, ThreadEntry { func, aux }, false)
}

fn spawn(name: &str, priority: u8, entry: ThreadEntry, idle: bool) -> Result<Tid, KernelError> {
    let tid = critical_section(|cs| {
        let slot = with_scheduler(cs, |s| s.reserve_slot())?;
        arch::prepare_context(slot)?;
        Ok::<_, KernelError>(with_scheduler(cs, |s| {
            let tid = if idle {
                s.install_idle(slot, entry)
            } else {
                s.install_thread(slot, name, priority, entry)
            };
            s.unblock(slot);
            tid
        }))
    })?;
    preempt();
    Ok(tid)
}

fn idle_main(_: usize) {
    IDLE_STARTED.up();
    loop {
        let guard = InterruptGuard::new();
        block_current(&guard);
        // Re-enables interrupts and halts until the next one.
        arch::wait_for_interrupt();
        drop(guard);
    }
}

/// Identifier of the running thread.
pub fn current_tid() -> Tid {
    with_scheduler_cs(|s| s.current_thread().tid)
}

/// Give up the CPU. The caller stays ready and may be picked again at once.
///
/// # Panics
/// If called from interrupt context.
pub fn yield_now() {
    assert!(!arch::in_interrupt(), "yield from interrupt context");
    let guard = InterruptGuard::new();
    with_scheduler(&guard, |s| s.yield_current());
    schedule(&guard);
}

/// Put the running thread to sleep until [`unblock`] is called on it.
/// Requires interrupts to be masked, proven by `cs`.
///
/// # Panics
/// If called from interrupt context.
pub fn block(cs: &CriticalSection) {
    block_current(cs);
}

/// Make a blocked thread ready. Never preempts the caller, so it may be
/// called from an interrupt handler.
///
/// # Panics
/// If the thread is not blocked.
pub fn unblock(tid: Tid) -> Result<(), KernelError> {
    with_scheduler_cs(|s| {
        let slot = s.find(tid).ok_or(KernelError::NoSuchThread)?;
        s.unblock(slot);
        Ok(())
    })
}

/// Terminate the running thread. Its record is freed by the next thread
/// to run.
pub fn exit() -> ! {
    assert!(!arch::in_interrupt(), "exit from interrupt context");
    let guard = InterruptGuard::new();
    with_scheduler(&guard, |s| s.exit_current());
    schedule(&guard);
    panic!("dying thread was scheduled again");
}

/// Effective priority of the running thread.
pub fn get_priority() -> u8 {
    with_scheduler_cs(|s| s.current_thread().priority)
}

/// Request a new priority for the running thread. Ignored under MLFQS.
///
/// Lowering takes effect only as far as donations allow. Yields if a
/// ready thread now outranks the caller.
pub fn set_priority(priority: u8) {
    if with_scheduler_cs(|s| s.set_priority_current(priority)) {
        yield_now_or_on_return();
    }
}

/// Apply a priority request to any thread. Ignored under MLFQS.
pub fn set_thread_priority(tid: Tid, priority: u8) -> Result<(), KernelError> {
    let outranked = with_scheduler_cs(|s| {
        let slot = s.find(tid).ok_or(KernelError::NoSuchThread)?;
        Ok::<_, KernelError>(s.set_priority_of(slot, priority))
    })?;
    if outranked {
        yield_now_or_on_return();
    }
    Ok(())
}

/// Niceness of the running thread.
pub fn get_nice() -> i8 {
    with_scheduler_cs(|s| s.current_thread().nice)
}

/// Set the running thread's niceness. Under MLFQS this recomputes its
/// priority and yields if a ready thread now outranks it.
pub fn set_nice(nice: i8) {
    if with_scheduler_cs(|s| s.set_nice(nice)) {
        yield_now_or_on_return();
    }
}

/// System load average times 100, rounded.
pub fn load_avg() -> i32 {
    with_scheduler_cs(|s| s.load_avg_x100())
}

/// The running thread's `recent_cpu` times 100, rounded.
pub fn recent_cpu() -> i32 {
    with_scheduler_cs(|s| s.recent_cpu_x100(s.current()))
}

/// Active scheduling policy.
pub fn policy() -> Policy {
    with_scheduler_cs(|s| s.policy())
}

/// Snapshot of thread `tid`, if it exists.
pub fn thread_info(tid: Tid) -> Option<ThreadInfo> {
    with_scheduler_cs(|s| s.find(tid).map(|slot| ThreadInfo::from(s.thread(slot))))
}

/// Call `f` once per live thread, with interrupts masked.
///
/// `f` sees a snapshot and may call back into the kernel.
pub fn for_each_thread(mut f: impl FnMut(&ThreadInfo)) {
    critical_section(|cs| {
        let snapshot: Vec<ThreadInfo, MAX_THREADS> = with_scheduler(cs, |s| {
            s.live_threads().map(|(_, t)| ThreadInfo::from(t)).collect()
        });
        snapshot.iter().for_each(&mut f);
    });
}

/// Attach (or with `None`, detach) a user address space to thread `tid`.
/// Its ticks then count as user time, and the space is activated
/// whenever the thread is switched in.
pub fn set_address_space(tid: Tid, space: Option<AddressSpace>) -> Result<(), KernelError> {
    critical_section(|cs| {
        let (slot, current) = with_scheduler(cs, |s| {
            let slot = s.find(tid).ok_or(KernelError::NoSuchThread)?;
            s.set_address_space(slot, space);
            Ok::<_, KernelError>((slot, s.current()))
        })?;
        if slot == current {
            arch::activate_address_space(space);
        }
        Ok(())
    })
}

/// Idle, kernel and user tick counts so far.
pub fn tick_stats() -> TickStats {
    with_scheduler_cs(|s| s.stats())
}

/// Log tick statistics.
pub fn print_stats() {
    let stats = tick_stats();
    info!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        stats.idle, stats.kernel, stats.user
    );
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Timer interrupt entry point. Accounts the tick and, when the running
/// thread's slice is used up, requests a yield on interrupt return.
pub fn tick() {
    with_scheduler_cs(|s| s.tick());
}

/// Consume a pending yield-on-return request. Ports call this as an
/// interrupt returns and yield if it is set.
pub fn take_yield_request() -> bool {
    with_scheduler_cs(|s| s.take_yield_request())
}

// ---------------------------------------------------------------------------
// Scheduling internals
// ---------------------------------------------------------------------------

pub(crate) fn assert_can_block() {
    assert!(!arch::in_interrupt(), "blocking operation called from interrupt context");
}

pub(crate) fn current_slot(cs: &CriticalSection) -> Slot {
    with_scheduler(cs, |s| s.current())
}

/// Running → Blocked, then switch away. Returns once unblocked and
/// scheduled again.
pub(crate) fn block_current(cs: &CriticalSection) {
    assert_can_block();
    with_scheduler(cs, |s| s.block_current());
    schedule(cs);
}

/// Remove the highest-priority member of `set` and make it ready.
pub(crate) fn wake_highest(cs: &CriticalSection, set: &mut ThreadSet) -> bool {
    with_scheduler(cs, |s| match s.highest_in(set) {
        Some(slot) => {
            set.remove(slot);
            s.unblock(slot);
            true
        }
        None => false,
    })
}

pub(crate) fn highest_in(cs: &CriticalSection, set: &ThreadSet) -> Option<Slot> {
    with_scheduler(cs, |s| s.highest_in(set))
}

pub(crate) fn unblock_slot(cs: &CriticalSection, slot: Slot) {
    with_scheduler(cs, |s| s.unblock(slot));
}

/// Yield if a ready thread outranks the running one. In interrupt context
/// the yield is deferred to interrupt return.
pub(crate) fn preempt() {
    if with_scheduler_cs(|s| s.should_yield()) {
        yield_now_or_on_return();
    }
}

fn yield_now_or_on_return() {
    if arch::in_interrupt() {
        with_scheduler_cs(|s| s.request_yield_on_return());
    } else {
        yield_now();
    }
}

/// Switch to the next thread. The current thread must already have left
/// `Running`, and interrupts must be masked.
fn schedule(cs: &CriticalSection) {
    assert!(!arch::interrupts_enabled(), "schedule() with interrupts enabled");

    let Switch { prev, next } = with_scheduler(cs, |s| s.pick_next());
    let prev = if prev != next {
        // SAFETY: interrupts are masked, the scheduler lock is released,
        // and `next` has a context prepared by `arch::prepare_context` or
        // saved by an earlier switch.
        unsafe { arch::switch_threads(prev, next) }
    } else {
        prev
    };
    schedule_tail(prev);
}

/// Finish a switch as the newly running thread: mark it running, check
/// its stack, reclaim `prev` if it died, and activate its address space.
pub(crate) fn schedule_tail(prev: Slot) {
    let (tail, current) = with_scheduler_cs(|s| (s.finish_switch(prev), s.current()));

    assert!(
        arch::stack_intact(current),
        "stack overflow in thread slot {}",
        current.index()
    );
    if let Some(slot) = tail.reclaimed {
        arch::release_context(slot);
    }
    arch::activate_address_space(tail.address_space);
}

/// First code run by every new thread, entered from the port with the
/// slot of the thread that switched to it.
pub(crate) fn thread_trampoline(prev: Slot) -> ! {
    schedule_tail(prev);

    let entry = with_scheduler_cs(|s| s.current_thread().entry);
    let entry = match entry {
        Some(entry) => entry,
        None => panic!("thread started without an entry point"),
    };
    debug!("thread {} starting", current_tid());

    arch::enable_interrupts();
    (entry.func)(entry.aux);
    exit()
}
