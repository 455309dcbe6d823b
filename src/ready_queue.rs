//! # Ready Queue
//!
//! Holds every thread that is eligible to run but not running. Two
//! disciplines, chosen once at boot from the [`Policy`]:
//!
//! - **Ordered**: one list kept in descending priority order. Order among
//!   equal priorities is unspecified.
//! - **Levels**: 64 FIFO queues indexed by priority. Selection scans from
//!   `PRI_MAX` down and takes the head of the first non-empty level.
//!
//! The queue caches the priority a thread was inserted with. A thread whose
//! priority changes while queued must be removed and re-inserted.

use heapless::{Deque, Vec};

use crate::config::{Policy, MAX_THREADS, PRI_COUNT, PRI_MAX};
use crate::thread::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    slot: Slot,
    priority: u8,
}

/// Strict-priority list, highest priority first.
pub struct OrderedList {
    entries: Vec<Entry, MAX_THREADS>,
}

impl OrderedList {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn insert(&mut self, slot: Slot, priority: u8) {
        // Behind every entry of equal or higher priority.
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        if self.entries.insert(at, Entry { slot, priority }).is_err() {
            panic!("ready list overflow");
        }
    }

    fn remove(&mut self, slot: Slot) -> bool {
        match self.entries.iter().position(|e| e.slot == slot) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    fn peek(&self) -> Option<(Slot, u8)> {
        self.entries.first().map(|e| (e.slot, e.priority))
    }

    fn pop(&mut self) -> Option<Slot> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).slot)
        }
    }
}

/// One FIFO per priority level.
pub struct Levels {
    levels: [Deque<Slot, MAX_THREADS>; PRI_COUNT],
    len: usize,
}

impl Levels {
    pub fn new() -> Self {
        Self {
            levels: core::array::from_fn(|_| Deque::new()),
            len: 0,
        }
    }

    fn insert(&mut self, slot: Slot, priority: u8) {
        if self.levels[priority as usize].push_back(slot).is_err() {
            panic!("ready level {} overflow", priority);
        }
        self.len += 1;
    }

    fn remove(&mut self, slot: Slot) -> bool {
        for level in self.levels.iter_mut() {
            if !level.iter().any(|&s| s == slot) {
                continue;
            }
            // Rotate once through the level, dropping `slot` and keeping
            // the order of the rest.
            for _ in 0..level.len() {
                if let Some(s) = level.pop_front() {
                    if s != slot {
                        let _ = level.push_back(s);
                    }
                }
            }
            self.len -= 1;
            return true;
        }
        false
    }

    fn peek(&self) -> Option<(Slot, u8)> {
        (0..=PRI_MAX)
            .rev()
            .find_map(|p| self.levels[p as usize].front().map(|&s| (s, p)))
    }

    fn pop(&mut self) -> Option<Slot> {
        let (_, priority) = self.peek()?;
        self.len -= 1;
        self.levels[priority as usize].pop_front()
    }
}

/// The ready container for the active policy.
pub enum ReadyQueue {
    Ordered(OrderedList),
    Levels(Levels),
}

impl ReadyQueue {
    pub fn new(policy: Policy) -> Self {
        match policy {
            Policy::Priority => Self::Ordered(OrderedList::new()),
            Policy::Mlfqs => Self::Levels(Levels::new()),
        }
    }

    /// Add `slot` at `priority`.
    ///
    /// # Panics
    /// If `slot` is already queued.
    pub fn insert(&mut self, slot: Slot, priority: u8) {
        assert!(!self.contains(slot), "thread slot {} queued twice", slot.index());
        assert!(priority <= PRI_MAX, "priority {} out of range", priority);
        match self {
            Self::Ordered(list) => list.insert(slot, priority),
            Self::Levels(levels) => levels.insert(slot, priority),
        }
    }

    /// Remove `slot` wherever it is queued. Returns whether it was present.
    pub fn remove(&mut self, slot: Slot) -> bool {
        match self {
            Self::Ordered(list) => list.remove(slot),
            Self::Levels(levels) => levels.remove(slot),
        }
    }

    pub fn contains(&self, slot: Slot) -> bool {
        match self {
            Self::Ordered(list) => list.entries.iter().any(|e| e.slot == slot),
            Self::Levels(levels) => levels.levels.iter().any(|l| l.iter().any(|&s| s == slot)),
        }
    }

    /// The thread that would run next and its queued priority, without
    /// removing it.
    pub fn highest_priority_thread(&self) -> Option<(Slot, u8)> {
        match self {
            Self::Ordered(list) => list.peek(),
            Self::Levels(levels) => levels.peek(),
        }
    }

    /// Remove and return the thread that should run next.
    pub fn next_thread_to_run(&mut self) -> Option<Slot> {
        match self {
            Self::Ordered(list) => list.pop(),
            Self::Levels(levels) => levels.pop(),
        }
    }

    /// Number of queued threads, across every level.
    pub fn len(&self) -> usize {
        match self {
            Self::Ordered(list) => list.entries.len(),
            Self::Levels(levels) => levels.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
