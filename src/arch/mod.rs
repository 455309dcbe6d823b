//! # Architecture Abstraction Layer
//!
//! The narrow boundary between the portable scheduler and the CPU. Every
//! port provides the same set of functions, re-exported from here:
//!
//! | Function                 | Contract                                               |
//! |--------------------------|--------------------------------------------------------|
//! | `init`                   | adopt the boot context as slot 0                       |
//! | `interrupts_enabled`     | current interrupt level                                |
//! | `disable_interrupts`     | mask, returning whether they were enabled              |
//! | `restore_interrupts`     | return to a level from `disable_interrupts`            |
//! | `enable_interrupts`      | unmask                                                 |
//! | `in_interrupt`           | whether an interrupt handler is executing              |
//! | `prepare_context`        | give a slot a fresh context that enters the trampoline |
//! | `switch_threads`         | save current, resume next, return who switched to us   |
//! | `release_context`        | the slot's thread is gone for good                     |
//! | `activate_address_space` | install a thread's address space after a switch        |
//! | `stack_intact`           | stack canary check                                     |
//! | `wait_for_interrupt`     | enable interrupts and halt, atomically                 |
//! | `start_timer`            | start the periodic tick                                |
//! | `console_write`          | log sink                                               |
//!
//! - `cortex_m4`: ARMv7E-M bare metal.
//! - `hosted`: kernel threads on host threads, for tests and the host demo.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
use cortex_m4 as port;

#[cfg(not(target_os = "none"))]
pub mod hosted;
#[cfg(not(target_os = "none"))]
use hosted as port;

#[cfg(all(target_os = "none", not(target_arch = "arm")))]
compile_error!("PriOS has no port for this target");

pub(crate) use port::{
    activate_address_space, console_write, disable_interrupts, enable_interrupts, in_interrupt,
    init, interrupts_enabled, prepare_context, release_context, restore_interrupts, stack_intact,
    start_timer, switch_threads, wait_for_interrupt,
};
