//! Kernel error types.
//!
//! Only conditions a caller can reasonably recover from are reported as
//! errors. Broken invariants (blocking in an interrupt handler, releasing a
//! lock one does not hold, a corrupted thread record) are panics: on bare
//! metal the panic handler halts the CPU.

use core::fmt;

use crate::config::MAX_THREADS;

/// Recoverable kernel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every thread slot is in use; no thread was created.
    ThreadLimit { max: usize },

    /// The port could not set up an execution context for a new thread;
    /// no thread was created.
    ContextUnavailable,

    /// No live thread has the given identifier.
    NoSuchThread,

    /// Unrecognized word on the kernel command line.
    UnknownOption,

    /// A recognized option carried a value that could not be used.
    BadOptionValue,
}

impl KernelError {
    pub const fn thread_limit() -> Self {
        Self::ThreadLimit { max: MAX_THREADS }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadLimit { max } => write!(f, "thread limit reached ({} threads)", max),
            Self::ContextUnavailable => write!(f, "no execution context available for new thread"),
            Self::NoSuchThread => write!(f, "no such thread"),
            Self::UnknownOption => write!(f, "unknown kernel command-line option"),
            Self::BadOptionValue => write!(f, "invalid value for kernel command-line option"),
        }
    }
}
