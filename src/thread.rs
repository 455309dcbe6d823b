//! # Thread Control Block
//!
//! Defines the thread model for PriOS: the per-thread record, its lifecycle
//! states, the fixed-capacity arena that owns every record, and the small
//! handle types (`Slot`, `LockId`, `ThreadSet`) other components use to
//! refer to threads and locks without owning them.
//!
//! ## Ownership
//!
//! Thread records live only inside the [`ThreadTable`] held by the
//! scheduler. Everything else names a thread by its [`Slot`] (an arena
//! index, reused after reclamation) or its [`Tid`] (monotonic, never
//! reused). Locks are named by [`LockId`]; a thread's `lock_waiting_for`
//! and `acquired_locks` are back-references, never ownership.

use core::fmt;
use core::num::{NonZeroU32, NonZeroUsize};
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{MAX_HELD_LOCKS, MAX_THREADS, NICE_DEFAULT, THREAD_MAGIC, THREAD_NAME_LEN};
use crate::fixed_point::Fixed;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Thread identifier handed to callers. Allocated monotonically, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(NonZeroU32);

impl Tid {
    pub const FIRST: Tid = Tid(NonZeroU32::MIN);

    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// The identifier allocated after this one.
    pub(crate) fn next(self) -> Tid {
        match self.0.checked_add(1) {
            Some(n) => Tid(n),
            None => panic!("thread identifiers exhausted"),
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Index of a thread record in the [`ThreadTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u8);

impl Slot {
    /// # Panics
    /// If `index >= MAX_THREADS`.
    pub const fn new(index: usize) -> Self {
        assert!(index < MAX_THREADS, "thread slot out of range");
        Slot(index as u8)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a [`crate::sync::Lock`], assigned on first use.
///
/// This is the membership token that lets a holder's `acquired_locks` and a
/// waiter's `lock_waiting_for` name a lock without pointing at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(NonZeroU32);

static NEXT_LOCK_ID: AtomicU32 = AtomicU32::new(1);

impl LockId {
    pub(crate) fn allocate() -> LockId {
        let raw = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
        match NonZeroU32::new(raw) {
            Some(n) => LockId(n),
            None => panic!("lock identifiers exhausted"),
        }
    }
}

/// Opaque address-space token attached by the process loader. Threads that
/// carry one run user code; the port activates it after every switch.
pub type AddressSpace = NonZeroUsize;

/// Entry point of a kernel thread. The argument is the opaque `aux` value
/// passed to [`crate::kernel::create_thread`].
pub type ThreadFunc = fn(usize);

/// Function and argument a new thread starts with.
#[derive(Debug, Clone, Copy)]
pub struct ThreadEntry {
    pub func: ThreadFunc,
    pub aux: usize,
}

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a thread.
///
/// ```text
///   create ──► Blocked ──unblock──► Ready ──schedule──► Running
///                 ▲                   ▲                  │ │ │
///                 │                   └──yield/preempt───┘ │ │
///                 └──────────── wait on a primitive ───────┘ │
///                                                  exit      ▼
///                         reclaimed by next thread ◄──── Dying
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Eligible to run, waiting in the ready queue.
    Ready,
    /// Executing on the CPU. Exactly one thread is in this state.
    Running,
    /// Waiting on a primitive or explicitly blocked.
    Blocked,
    /// Exited; its record is freed by the next thread that runs.
    Dying,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Dying => "dying",
        };
        f.pad(name)
    }
}

// ---------------------------------------------------------------------------
// Thread name
// ---------------------------------------------------------------------------

/// Thread name stored inline, truncated to `THREAD_NAME_LEN` bytes on a
/// character boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadName {
    bytes: [u8; THREAD_NAME_LEN],
    len: u8,
}

impl ThreadName {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(THREAD_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; THREAD_NAME_LEN];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self { bytes, len: end as u8 }
    }

    pub fn as_str(&self) -> &str {
        // Built from a `&str` cut on a character boundary.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl Deref for ThreadName {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for ThreadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ThreadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Thread sets
// ---------------------------------------------------------------------------

/// Unordered set of threads, one bit per slot. Used for wait collections
/// and the all-threads registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadSet(u64);

impl ThreadSet {
    pub const EMPTY: ThreadSet = ThreadSet(0);

    #[inline]
    pub fn insert(&mut self, slot: Slot) -> bool {
        let fresh = !self.contains(slot);
        self.0 |= 1 << slot.index();
        fresh
    }

    #[inline]
    pub fn remove(&mut self, slot: Slot) -> bool {
        let present = self.contains(slot);
        self.0 &= !(1 << slot.index());
        present
    }

    #[inline]
    pub fn contains(&self, slot: Slot) -> bool {
        self.0 & (1 << slot.index()) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in slot order.
    pub fn iter(&self) -> impl Iterator<Item = Slot> {
        let bits = self.0;
        (0..MAX_THREADS)
            .filter(move |i| bits & (1 << i) != 0)
            .map(Slot::new)
    }
}

// ---------------------------------------------------------------------------
// Held locks
// ---------------------------------------------------------------------------

/// The locks a thread currently holds.
#[derive(Debug, Clone, Copy)]
pub struct HeldLocks {
    ids: [Option<LockId>; MAX_HELD_LOCKS],
}

impl HeldLocks {
    pub const fn new() -> Self {
        Self { ids: [None; MAX_HELD_LOCKS] }
    }

    /// # Panics
    /// If the thread already holds `MAX_HELD_LOCKS` locks.
    pub fn insert(&mut self, id: LockId) {
        match self.ids.iter_mut().find(|entry| entry.is_none()) {
            Some(entry) => *entry = Some(id),
            None => panic!("thread holds more than {} locks", MAX_HELD_LOCKS),
        }
    }

    pub fn remove(&mut self, id: LockId) -> bool {
        match self.ids.iter_mut().find(|entry| **entry == Some(id)) {
            Some(entry) => {
                *entry = None;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: LockId) -> bool {
        self.ids.contains(&Some(id))
    }

    pub fn is_empty(&self) -> bool {
        self.ids.iter().all(Option::is_none)
    }
}

// ---------------------------------------------------------------------------
// Thread record
// ---------------------------------------------------------------------------

/// Thread control block.
///
/// The record holds scheduling state only; the execution context (saved
/// registers, stack) belongs to the port and is keyed by the same [`Slot`].
#[derive(Debug, Clone)]
pub struct Thread {
    pub tid: Tid,
    pub name: ThreadName,
    pub status: ThreadStatus,

    /// Effective priority, possibly raised by donation.
    pub priority: u8,
    /// Priority last requested through the API, independent of donation.
    pub original_priority: u8,

    /// MLFQS niceness.
    pub nice: i8,
    /// MLFQS recent CPU usage.
    pub recent_cpu: Fixed,

    /// Lock this thread is blocked trying to acquire.
    pub lock_waiting_for: Option<LockId>,
    /// Locks this thread holds.
    pub acquired_locks: HeldLocks,

    /// Address space of the user process this thread runs, if any.
    pub address_space: Option<AddressSpace>,

    /// Where a newly created thread starts; `None` for the bootstrap thread.
    pub entry: Option<ThreadEntry>,

    pub magic: u32,
}

impl Thread {
    /// A new record in the `Blocked` state.
    pub fn new(tid: Tid, name: &str, priority: u8, entry: Option<ThreadEntry>) -> Self {
        Self {
            tid,
            name: ThreadName::new(name),
            status: ThreadStatus::Blocked,
            priority,
            original_priority: priority,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            lock_waiting_for: None,
            acquired_locks: HeldLocks::new(),
            address_space: None,
            entry,
            magic: THREAD_MAGIC,
        }
    }

    /// Whether the record passes its magic check.
    #[inline]
    pub fn is_intact(&self) -> bool {
        self.magic == THREAD_MAGIC
    }

    /// Whether priority donation is currently inflating this thread.
    #[inline]
    pub fn has_donation(&self) -> bool {
        self.priority != self.original_priority
    }
}

/// Copy of the externally interesting fields of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub name: ThreadName,
    pub status: ThreadStatus,
    pub priority: u8,
    pub original_priority: u8,
    pub nice: i8,
    pub recent_cpu: Fixed,
}

impl From<&Thread> for ThreadInfo {
    fn from(t: &Thread) -> Self {
        Self {
            tid: t.tid,
            name: t.name,
            status: t.status,
            priority: t.priority,
            original_priority: t.original_priority,
            nice: t.nice,
            recent_cpu: t.recent_cpu,
        }
    }
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

/// Fixed-capacity arena of thread records indexed by [`Slot`].
pub struct ThreadTable {
    slots: [Option<Thread>; MAX_THREADS],
}

impl ThreadTable {
    const EMPTY: Option<Thread> = None;

    pub const fn new() -> Self {
        Self { slots: [Self::EMPTY; MAX_THREADS] }
    }

    /// First unused slot, if any.
    pub fn free_slot(&self) -> Option<Slot> {
        self.slots.iter().position(Option::is_none).map(Slot::new)
    }

    /// Place `thread` in `slot`.
    ///
    /// # Panics
    /// If the slot is occupied.
    pub fn install(&mut self, slot: Slot, thread: Thread) {
        let entry = &mut self.slots[slot.index()];
        assert!(entry.is_none(), "thread slot {} already in use", slot.index());
        *entry = Some(thread);
    }

    /// Free `slot`, returning the record that occupied it.
    pub fn remove(&mut self, slot: Slot) -> Option<Thread> {
        self.slots[slot.index()].take()
    }

    pub fn get(&self, slot: Slot) -> Option<&Thread> {
        self.slots[slot.index()].as_ref()
    }

    /// # Panics
    /// If the slot is empty or its record fails the magic check.
    pub fn thread(&self, slot: Slot) -> &Thread {
        match self.slots[slot.index()].as_ref() {
            Some(t) if t.is_intact() => t,
            Some(_) => panic!("thread record in slot {} is corrupted", slot.index()),
            None => panic!("no thread in slot {}", slot.index()),
        }
    }

    /// # Panics
    /// If the slot is empty or its record fails the magic check.
    pub fn thread_mut(&mut self, slot: Slot) -> &mut Thread {
        match self.slots[slot.index()].as_mut() {
            Some(t) if t.is_intact() => t,
            Some(_) => panic!("thread record in slot {} is corrupted", slot.index()),
            None => panic!("no thread in slot {}", slot.index()),
        }
    }

    #[inline]
    pub fn priority(&self, slot: Slot) -> u8 {
        self.thread(slot).priority
    }

    /// Slot of the thread with identifier `tid`.
    pub fn find(&self, tid: Tid) -> Option<Slot> {
        self.iter().find(|(_, t)| t.tid == tid).map(|(slot, _)| slot)
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &Thread)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (Slot::new(i), t)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|t| t.is_some()).count()
    }
}
