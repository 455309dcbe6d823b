//! # Hosted Port
//!
//! Runs PriOS on an ordinary operating system, for tests and the host demo.
//!
//! ## Execution Model
//!
//! Every kernel thread is backed by a host thread, but only one of them
//! holds the *baton* at a time. `switch_threads` hands the baton to the
//! next thread and parks the caller until someone hands it back, so kernel
//! code only ever runs on one host thread at once.
//!
//! Each context gets a fresh serial number; a slot's serial is cleared when
//! the slot is reclaimed and every [`init`] starts a new generation. A host
//! thread whose context is retired either way unwinds out of the kernel and
//! ends, so reclaimed threads do not pile up on the host.
//!
//! ## Interrupts
//!
//! The interrupt level and the "in interrupt" flag are per host thread.
//! A kernel thread only switches out with interrupts masked and resumes
//! with them still masked, which is exactly what the flag tracks. Timer
//! interrupts are injected with [`timer_interrupt`]; the idle thread
//! injects one each time it waits.
//!
//! ## Failure Propagation
//!
//! A panic on any kernel thread poisons the baton: every host thread of
//! the same kernel that waits for it panics with the original message, so
//! a test blocked in the kernel fails instead of hanging. The same happens
//! when the idle thread spins too long with every other thread blocked.

use core::cell::Cell;
use core::fmt;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use std::panic::{self, AssertUnwindSafe};
use std::boxed::Box;
use std::string::{String, ToString};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::{format, thread};

use crate::config::MAX_THREADS;
use crate::error::KernelError;
use crate::kernel;
use crate::thread::{AddressSpace, Slot};

/// Idle ticks in a row, with no switch in between, that count as deadlock.
pub const DEADLOCK_IDLE_TICKS: u64 = 10_000;

struct Cpu {
    generation: u64,
    /// Serial of the context holding the baton.
    running: u64,
    /// Slot that handed over the baton, collected by the receiver.
    prev: Option<Slot>,
    /// Serial of the context bound to each slot; 0 when none.
    serials: [u64; MAX_THREADS],
    poison: Option<String>,
}

static CPU: Mutex<Cpu> = Mutex::new(Cpu {
    generation: 0,
    running: 0,
    prev: None,
    serials: [0; MAX_THREADS],
    poison: None,
});
static BATON: Condvar = Condvar::new();

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
static LIVE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);
static IDLE_STREAK: AtomicU64 = AtomicU64::new(0);
static ACTIVE_SPACE: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static INTR_ENABLED: Cell<bool> = const { Cell::new(true) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    static OWNS_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Unwind payload that ends the host thread of a retired context.
struct Retired;

fn lock_cpu() -> MutexGuard<'static, Cpu> {
    CPU.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Leave the kernel for good. A host thread spawned by
/// [`prepare_context`] unwinds back to its entry and exits; any other host
/// thread has nowhere to return to and parks.
fn retire() -> ! {
    if OWNS_CONTEXT.with(Cell::get) {
        panic::resume_unwind(Box::new(Retired));
    }
    loop {
        thread::park();
    }
}

/// Block until context `serial` of `slot` holds the baton.
///
/// # Panics
/// If the baton is poisoned.
fn wait_turn(mut cpu: MutexGuard<'static, Cpu>, slot: Slot, serial: u64, generation: u64) -> MutexGuard<'static, Cpu> {
    loop {
        if cpu.generation != generation || cpu.serials[slot.index()] != serial {
            drop(cpu);
            retire();
        }
        if let Some(message) = cpu.poison.clone() {
            drop(cpu);
            panic!("{}", message);
        }
        if cpu.running == serial {
            return cpu;
        }
        cpu = BATON.wait(cpu).unwrap_or_else(PoisonError::into_inner);
    }
}

fn poison(message: String) {
    let mut cpu = lock_cpu();
    if cpu.poison.is_none() {
        cpu.poison = Some(message);
    }
    BATON.notify_all();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Port interface
// ---------------------------------------------------------------------------

/// Start a new kernel generation with the calling host thread in slot 0.
pub fn init() {
    let serial = new_serial();
    let mut cpu = lock_cpu();
    cpu.generation += 1;
    cpu.running = serial;
    cpu.prev = None;
    cpu.serials = [0; MAX_THREADS];
    cpu.serials[0] = serial;
    cpu.poison = None;
    // Wake leftovers from the previous generation so they park for good.
    BATON.notify_all();
    drop(cpu);

    IDLE_STREAK.store(0, Ordering::Relaxed);
    ACTIVE_SPACE.store(0, Ordering::Relaxed);
    IN_INTERRUPT.with(|f| f.set(false));
}

pub fn interrupts_enabled() -> bool {
    INTR_ENABLED.with(Cell::get)
}

pub fn disable_interrupts() -> bool {
    INTR_ENABLED.with(|f| f.replace(false))
}

pub fn restore_interrupts(enabled: bool) {
    INTR_ENABLED.with(|f| f.set(enabled));
}

pub fn enable_interrupts() {
    INTR_ENABLED.with(|f| f.set(true));
}

pub fn in_interrupt() -> bool {
    IN_INTERRUPT.with(Cell::get)
}

/// Spawn the host thread that will run `slot`. It waits for the baton and
/// then enters the kernel trampoline.
pub fn prepare_context(slot: Slot) -> Result<(), KernelError> {
    let serial = new_serial();
    let generation = {
        let mut cpu = lock_cpu();
        cpu.serials[slot.index()] = serial;
        cpu.generation
    };

    LIVE_CONTEXTS.fetch_add(1, Ordering::SeqCst);
    thread::Builder::new()
        .name(format!("prios-slot-{}", slot.index()))
        .spawn(move || {
            INTR_ENABLED.with(|f| f.set(false));
            OWNS_CONTEXT.with(|f| f.set(true));

            let result = panic::catch_unwind(AssertUnwindSafe(move || {
                let prev = {
                    let mut cpu = wait_turn(lock_cpu(), slot, serial, generation);
                    cpu.prev.take().unwrap_or(slot)
                };
                kernel::thread_trampoline(prev);
            }));
            match result {
                Err(payload) if payload.is::<Retired>() => {}
                Err(payload) => {
                    let name = thread::current().name().unwrap_or("kernel thread").to_string();
                    poison(format!("{} panicked: {}", name, panic_message(&*payload)));
                }
                Ok(()) => {}
            }
            LIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
        })
        .map(|_| ())
        .map_err(|_| {
            LIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
            lock_cpu().serials[slot.index()] = 0;
            KernelError::ContextUnavailable
        })
}

/// Host threads spawned for kernel contexts that have not ended yet.
/// Retired contexts end asynchronously, shortly after reclamation.
pub fn live_contexts() -> usize {
    LIVE_CONTEXTS.load(Ordering::SeqCst)
}

/// Hand the baton from `cur` to `next` and wait to be resumed.
///
/// # Safety
/// Interrupts must be masked and `next` must have a prepared or saved
/// context.
pub unsafe fn switch_threads(cur: Slot, next: Slot) -> Slot {
    IDLE_STREAK.store(0, Ordering::Relaxed);

    let mut cpu = lock_cpu();
    let serial = cpu.serials[cur.index()];
    let generation = cpu.generation;
    cpu.running = cpu.serials[next.index()];
    cpu.prev = Some(cur);
    BATON.notify_all();

    let mut cpu = wait_turn(cpu, cur, serial, generation);
    cpu.prev.take().unwrap_or(cur)
}

/// Retire the host thread bound to `slot`; it unwinds and ends.
pub fn release_context(slot: Slot) {
    lock_cpu().serials[slot.index()] = 0;
    BATON.notify_all();
}

pub fn activate_address_space(space: Option<AddressSpace>) {
    ACTIVE_SPACE.store(space.map_or(0, NonZeroUsize::get), Ordering::Relaxed);
}

/// Address space most recently activated, for inspection by tests.
pub fn active_address_space() -> Option<AddressSpace> {
    NonZeroUsize::new(ACTIVE_SPACE.load(Ordering::Relaxed))
}

/// Host stacks are guarded by the host.
pub fn stack_intact(_slot: Slot) -> bool {
    true
}

/// Enable interrupts and deliver the next timer tick.
///
/// # Panics
/// After `DEADLOCK_IDLE_TICKS` calls with no context switch in between,
/// which means every other thread is blocked and nothing can wake them.
pub fn wait_for_interrupt() {
    enable_interrupts();
    let streak = IDLE_STREAK.fetch_add(1, Ordering::Relaxed) + 1;
    if streak > DEADLOCK_IDLE_TICKS {
        panic!("deadlock: every kernel thread is blocked");
    }
    timer_interrupt();
}

/// Ticks are injected by [`timer_interrupt`].
pub fn start_timer(_ticks_per_second: u32) {}

pub fn console_write(args: fmt::Arguments<'_>) {
    std::eprintln!("{}", args);
}

/// Deliver one timer interrupt to the running kernel thread, then yield
/// if the tick asked for preemption. Ignored while interrupts are masked.
pub fn timer_interrupt() {
    if !interrupts_enabled() {
        return;
    }
    disable_interrupts();
    IN_INTERRUPT.with(|f| f.set(true));
    kernel::tick();
    IN_INTERRUPT.with(|f| f.set(false));
    let preempt = kernel::take_yield_request();
    enable_interrupts();

    if preempt {
        kernel::yield_now();
    }
}

/// Run `f` as if inside an interrupt handler, then honor any yield it
/// requested on return.
pub fn in_interrupt_context<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = disable_interrupts();
    IN_INTERRUPT.with(|flag| flag.set(true));
    let result = f();
    IN_INTERRUPT.with(|flag| flag.set(false));
    let preempt = kernel::take_yield_request();
    restore_interrupts(was_enabled);

    if preempt {
        kernel::yield_now();
    }
    result
}
