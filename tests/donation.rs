//! Priority donation through locks on the hosted port.

mod common;

use std::sync::atomic::{AtomicU8, Ordering};

use common::{boot, Journal};
use prios::config::PRI_DEFAULT;
use prios::sync::{Lock, Semaphore};
use prios::{kernel, Policy, Tid};

static JOURNAL: Journal = Journal::new();

// ---------------------------------------------------------------------------
// Single donation
// ---------------------------------------------------------------------------

static LOCK: Lock = Lock::new();
static LOW_DONATED: AtomicU8 = AtomicU8::new(0);
static LOW_RESTORED: AtomicU8 = AtomicU8::new(0);
static LOW_SEEN_BY_HIGH: AtomicU8 = AtomicU8::new(0);
static LOW_TID: std::sync::Mutex<Option<Tid>> = std::sync::Mutex::new(None);

fn high(_: usize) {
    LOCK.acquire();
    JOURNAL.push(30);
    let low = LOW_TID.lock().unwrap().unwrap();
    LOW_SEEN_BY_HIGH.store(kernel::thread_info(low).unwrap().priority, Ordering::SeqCst);
    LOCK.release();
}

fn low(_: usize) {
    LOCK.acquire();
    kernel::create_thread("high", 30, high, 0).unwrap();
    LOW_DONATED.store(kernel::get_priority(), Ordering::SeqCst);
    LOCK.release();
    LOW_RESTORED.store(kernel::get_priority(), Ordering::SeqCst);
    JOURNAL.push(10);
}

#[test]
fn test_donation_to_lock_holder() {
    let _kernel = boot(Policy::Priority);
    JOURNAL.take();

    let tid = kernel::create_thread("low", 10, low, 0).unwrap();
    *LOW_TID.lock().unwrap() = Some(tid);
    kernel::set_priority(5);

    assert_eq!(LOW_DONATED.load(Ordering::SeqCst), 30);
    assert_eq!(LOW_SEEN_BY_HIGH.load(Ordering::SeqCst), 10);
    assert_eq!(LOW_RESTORED.load(Ordering::SeqCst), 10);
    assert_eq!(JOURNAL.take(), [30, 10], "high must run as soon as the lock is released");

    kernel::set_priority(PRI_DEFAULT);
}

// ---------------------------------------------------------------------------
// Nested donation: H waits on B held by M, M waits on A held by L
// ---------------------------------------------------------------------------

static LOCK_A: Lock = Lock::new();
static LOCK_B: Lock = Lock::new();
static DONE: Semaphore = Semaphore::new(0);

static L_DONATED: AtomicU8 = AtomicU8::new(0);
static M_SEEN_BY_L: AtomicU8 = AtomicU8::new(0);
static M_AFTER_A: AtomicU8 = AtomicU8::new(0);
static M_AFTER_B: AtomicU8 = AtomicU8::new(0);
static L_AFTER: AtomicU8 = AtomicU8::new(0);
static M_TID: std::sync::Mutex<Option<Tid>> = std::sync::Mutex::new(None);

fn nested_high(_: usize) {
    LOCK_B.acquire();
    JOURNAL.push(30);
    LOCK_B.release();
    DONE.up();
}

fn nested_medium(_: usize) {
    LOCK_B.acquire();
    kernel::create_thread("high", 30, nested_high, 0).unwrap();
    LOCK_A.acquire();
    JOURNAL.push(20);
    LOCK_A.release();
    M_AFTER_A.store(kernel::get_priority(), Ordering::SeqCst);
    LOCK_B.release();
    M_AFTER_B.store(kernel::get_priority(), Ordering::SeqCst);
    DONE.up();
}

fn nested_low(_: usize) {
    LOCK_A.acquire();
    let medium = kernel::create_thread("medium", 20, nested_medium, 0).unwrap();
    *M_TID.lock().unwrap() = Some(medium);

    L_DONATED.store(kernel::get_priority(), Ordering::SeqCst);
    M_SEEN_BY_L.store(kernel::thread_info(medium).unwrap().priority, Ordering::SeqCst);
    LOCK_A.release();
    L_AFTER.store(kernel::get_priority(), Ordering::SeqCst);
    JOURNAL.push(10);
    DONE.up();
}

#[test]
fn test_nested_donation() {
    let _kernel = boot(Policy::Priority);
    JOURNAL.take();

    kernel::create_thread("low", 10, nested_low, 0).unwrap();
    for _ in 0..3 {
        DONE.down();
    }

    assert_eq!(L_DONATED.load(Ordering::SeqCst), 30);
    assert_eq!(M_SEEN_BY_L.load(Ordering::SeqCst), 30);
    // Still lent 30 through lock B after giving up lock A.
    assert_eq!(M_AFTER_A.load(Ordering::SeqCst), 30);
    assert_eq!(M_AFTER_B.load(Ordering::SeqCst), 20);
    assert_eq!(L_AFTER.load(Ordering::SeqCst), 10);
    assert_eq!(JOURNAL.take(), [20, 30, 10]);
}

// ---------------------------------------------------------------------------
// Priority requests while holding a donation
// ---------------------------------------------------------------------------

static HELD: Lock = Lock::new();

fn contender(_: usize) {
    HELD.acquire();
    HELD.release();
}

#[test]
fn test_lowering_while_donated_is_deferred() {
    let _kernel = boot(Policy::Priority);

    HELD.acquire();
    kernel::create_thread("contender", 40, contender, 0).unwrap();
    assert_eq!(kernel::get_priority(), 40);

    kernel::set_priority(20);
    assert_eq!(kernel::get_priority(), 40, "a donation outranks the request");

    HELD.release();
    assert_eq!(kernel::get_priority(), 20);
    kernel::set_priority(PRI_DEFAULT);
}

#[test]
fn test_no_donation_under_mlfqs() {
    let _kernel = boot(Policy::Mlfqs);

    let before = kernel::get_priority();
    HELD.acquire();
    let tid = kernel::create_thread("contender", 40, contender, 0).unwrap();
    // Same computed priority as main: let it run into the lock.
    kernel::yield_now();
    assert_eq!(kernel::thread_info(tid).unwrap().status, prios::ThreadStatus::Blocked);
    assert_eq!(kernel::get_priority(), before);

    HELD.release();
    kernel::yield_now();
    assert!(kernel::thread_info(tid).is_none());
}
