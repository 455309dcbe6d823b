//! # PriOS Configuration
//!
//! Compile-time constants governing the scheduler, plus the boot-time
//! [`Config`] selected once by [`crate::kernel::init`].
//! All limits are fixed at compile time; no dynamic allocation.

use core::str::FromStr;

use log::LevelFilter;
use static_assertions::const_assert;

use crate::error::KernelError;

/// Maximum number of threads alive at once (idle and bootstrap included).
/// Bounds the thread arena; wait collections are 64-bit sets, so this
/// may not exceed 64.
pub const MAX_THREADS: usize = 32;

/// Lowest priority. Reserved in practice for the idle thread.
pub const PRI_MIN: u8 = 0;

/// Priority given to the bootstrap thread and the usual default.
pub const PRI_DEFAULT: u8 = 31;

/// Highest priority.
pub const PRI_MAX: u8 = 63;

/// Number of distinct priority levels (one MLFQS queue per level).
pub const PRI_COUNT: usize = PRI_MAX as usize + 1;

/// Niceness bounds for the MLFQS policy.
pub const NICE_MIN: i8 = -20;
pub const NICE_DEFAULT: i8 = 0;
pub const NICE_MAX: i8 = 20;

/// Default timer frequency in Hz. Determines how often `load_avg` and
/// `recent_cpu` are decayed (once per second).
pub const TICK_HZ: u32 = 1000;

/// Ticks a thread may run before the tick handler requests preemption.
pub const TIME_SLICE: u32 = 4;

/// MLFQS priorities are recomputed every this many ticks.
pub const PRI_UPDATE_INTERVAL: u64 = 4;

/// Hops followed along a donation chain before giving up.
pub const MAX_DONATION_DEPTH: usize = 8;

/// Locks a single thread may hold at the same time.
pub const MAX_HELD_LOCKS: usize = 16;

/// Bytes kept of a thread's name.
pub const THREAD_NAME_LEN: usize = 16;

/// Random value stored in every thread record; a mismatch means the record
/// was overwritten (typically by a stack overflow).
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Per-thread stack size in bytes on bare-metal ports.
pub const STACK_SIZE: usize = 2048;

/// Word written at the lowest address of every bare-metal stack.
pub const STACK_CANARY: u32 = 0xdead_c0de;

const_assert!(MAX_THREADS <= 64);
const_assert!(MAX_THREADS >= 2);
const_assert!(PRI_MIN < PRI_DEFAULT && PRI_DEFAULT < PRI_MAX);
const_assert!(NICE_MIN < NICE_DEFAULT && NICE_DEFAULT < NICE_MAX);
const_assert!(STACK_SIZE % 8 == 0);

// ---------------------------------------------------------------------------
// Boot configuration
// ---------------------------------------------------------------------------

/// Ready-queue discipline, chosen once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// One priority-ordered ready list with priority donation through locks.
    Priority,
    /// Multi-level feedback queue: 64 FIFO levels, priorities derived from
    /// `recent_cpu` and `nice`, no donation.
    Mlfqs,
}

/// Boot-time kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub policy: Policy,
    /// Timer interrupts per second.
    pub ticks_per_second: u32,
    /// Ticks before a running thread is preempted.
    pub time_slice: u32,
    /// Maximum level the kernel logger lets through.
    pub log_level: LevelFilter,
}

impl Config {
    pub const fn new(policy: Policy) -> Self {
        Self {
            policy,
            ticks_per_second: TICK_HZ,
            time_slice: TIME_SLICE,
            log_level: LevelFilter::Info,
        }
    }

    /// Parse a kernel command line such as `"-o mlfqs loglevel=debug"`.
    ///
    /// Recognized words:
    /// - `-o mlfqs`: use the MLFQS policy
    /// - `loglevel=<off|error|warn|info|debug|trace>`
    /// - `tick_hz=<n>`: timer frequency (non-zero)
    /// - `time_slice=<n>`: preemption slice in ticks (non-zero)
    pub fn from_cmdline(cmdline: &str) -> Result<Self, KernelError> {
        let mut config = Self::default();
        let mut words = cmdline.split_whitespace();

        while let Some(word) = words.next() {
            if word == "-o" {
                match words.next() {
                    Some("mlfqs") => config.policy = Policy::Mlfqs,
                    _ => return Err(KernelError::UnknownOption),
                }
            } else if let Some(level) = word.strip_prefix("loglevel=") {
                config.log_level =
                    LevelFilter::from_str(level).map_err(|_| KernelError::BadOptionValue)?;
            } else if let Some(hz) = word.strip_prefix("tick_hz=") {
                config.ticks_per_second = parse_nonzero(hz)?;
            } else if let Some(slice) = word.strip_prefix("time_slice=") {
                config.time_slice = parse_nonzero(slice)?;
            } else {
                return Err(KernelError::UnknownOption);
            }
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Policy::Priority)
    }
}

fn parse_nonzero(value: &str) -> Result<u32, KernelError> {
    match value.parse::<u32>() {
        Ok(0) | Err(_) => Err(KernelError::BadOptionValue),
        Ok(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cmdline_is_default() {
        assert_eq!(Config::from_cmdline("").unwrap(), Config::default());
        assert_eq!(Config::default().policy, Policy::Priority);
    }

    #[test]
    fn test_mlfqs_option() {
        let config = Config::from_cmdline("-o mlfqs").unwrap();
        assert_eq!(config.policy, Policy::Mlfqs);
        assert_eq!(config.ticks_per_second, TICK_HZ);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_cmdline("loglevel=trace tick_hz=100 time_slice=8").unwrap();
        assert_eq!(config.log_level, LevelFilter::Trace);
        assert_eq!(config.ticks_per_second, 100);
        assert_eq!(config.time_slice, 8);
    }

    #[test]
    fn test_rejects_unknown_and_bad_values() {
        assert_eq!(Config::from_cmdline("-q"), Err(KernelError::UnknownOption));
        assert_eq!(Config::from_cmdline("-o rr"), Err(KernelError::UnknownOption));
        assert_eq!(Config::from_cmdline("tick_hz=0"), Err(KernelError::BadOptionValue));
        assert_eq!(Config::from_cmdline("loglevel=loud"), Err(KernelError::BadOptionValue));
    }
}
