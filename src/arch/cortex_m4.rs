//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2, soft-float ABI).
//! Implements the thread switch routine, SysTick configuration, and the
//! PendSV-based yield on interrupt return.
//!
//! ## Context Switch Mechanism
//!
//! Threads and handlers all run on MSP. A switch is an ordinary function
//! call: `prios_switch` pushes the callee-saved registers and the return
//! address on the current stack, stores SP in the current slot's save
//! area, loads the next slot's SP and pops the same frame back. `r0` is
//! never touched, so the resumed thread sees the slot of the thread that
//! switched to it as the return value.
//!
//! A fresh stack is laid out as if it had been switched away from, with
//! the return address pointing at [`thread_entry`].
//!
//! ```text
//! [stack top]
//!   pc   (thread_entry)
//!   r11 … r4 (0)
//!   r3   (0, keeps the frame 8-byte aligned)   <- saved SP
//!   …
//! [stack bottom]
//!   STACK_CANARY
//! ```
//!
//! ## Preemption
//!
//! SysTick accounts the tick and, if the kernel wants a yield, pends
//! PendSV. PendSV runs last, when no other handler is active, and returns
//! into `preempt_trampoline` in thread mode instead of the interrupted
//! code. The trampoline yields like any thread would, then restores the
//! interrupted registers and flags and jumps back.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0xFF (lowest)
//! - PendSV: 0xFF (lowest)

use core::arch::global_asm;
use core::fmt;
use core::ptr::{addr_of, addr_of_mut};

use cortex_m::interrupt;
use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{ITM, SCB};
use cortex_m::register::primask;
use cortex_m_rt::exception;
use log::trace;

use crate::config::{MAX_THREADS, STACK_CANARY, STACK_SIZE};
use crate::error::KernelError;
use crate::kernel;
use crate::thread::{AddressSpace, Slot};

/// Core clock after reset (16 MHz internal oscillator on the STM32F4).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Words in the frame `prios_switch` saves: r3–r11 and the return address.
const SWITCH_FRAME_WORDS: usize = 10;

#[repr(C, align(8))]
struct Stack([u8; STACK_SIZE]);

const EMPTY_STACK: Stack = Stack([0; STACK_SIZE]);

/// Stacks for every slot except 0, which keeps the boot stack.
static mut STACKS: [Stack; MAX_THREADS] = [EMPTY_STACK; MAX_THREADS];

/// Saved stack pointer of every thread that is switched out.
static mut SAVED_SP: [usize; MAX_THREADS] = [0; MAX_THREADS];

extern "C" {
    fn prios_switch(prev: usize, save_sp: *mut usize, next_sp: usize) -> usize;
}

global_asm!(
    ".section .text.prios_switch,\"ax\",%progbits",
    ".global prios_switch",
    ".type prios_switch,%function",
    ".thumb_func",
    "prios_switch:",
    "push {{r3-r11, lr}}",
    "mov r3, sp",
    "str r3, [r1]",
    "mov sp, r2",
    "pop {{r3-r11, pc}}",
    ".size prios_switch, . - prios_switch",
);

// ---------------------------------------------------------------------------
// Interrupt state
// ---------------------------------------------------------------------------

pub fn init() {}

pub fn interrupts_enabled() -> bool {
    primask::read().is_inactive()
}

pub fn disable_interrupts() -> bool {
    let was_enabled = interrupts_enabled();
    interrupt::disable();
    was_enabled
}

pub fn restore_interrupts(enabled: bool) {
    if enabled {
        // SAFETY: returning to a level observed earlier on this thread.
        unsafe { interrupt::enable() }
    }
}

pub fn enable_interrupts() {
    // SAFETY: the kernel only enables interrupts outside critical sections.
    unsafe { interrupt::enable() }
}

pub fn in_interrupt() -> bool {
    !matches!(SCB::vect_active(), VectActive::ThreadMode)
}

/// Halt until an interrupt is pending, then take it. With PRIMASK set a
/// pending interrupt still ends `wfi`, so no wakeup is lost in between.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
    enable_interrupts();
}

// ---------------------------------------------------------------------------
// Thread contexts
// ---------------------------------------------------------------------------

/// Lay out a fresh stack for `slot` that enters [`thread_entry`].
pub fn prepare_context(slot: Slot) -> Result<(), KernelError> {
    if slot.index() == 0 {
        return Err(KernelError::ContextUnavailable);
    }

    // SAFETY: the slot is free, so no thread runs on this stack and nothing
    // else references it; interrupts are masked by the caller.
    unsafe {
        let base = addr_of_mut!(STACKS[slot.index()]) as *mut u32;
        base.write_volatile(STACK_CANARY);

        let top = base.add(STACK_SIZE / 4);
        let frame = top.sub(SWITCH_FRAME_WORDS);
        for i in 0..SWITCH_FRAME_WORDS - 1 {
            frame.add(i).write(0);
        }
        frame.add(SWITCH_FRAME_WORDS - 1).write(thread_entry as usize as u32);

        *addr_of_mut!(SAVED_SP[slot.index()]) = frame as usize;
    }
    Ok(())
}

/// Save the running thread in `cur` and resume `next`.
///
/// # Safety
/// Interrupts must be masked and `next` must hold a context written by
/// [`prepare_context`] or saved by an earlier switch.
pub unsafe fn switch_threads(cur: Slot, next: Slot) -> Slot {
    let save = addr_of_mut!(SAVED_SP[cur.index()]) as *mut usize;
    let next_sp = *addr_of!(SAVED_SP[next.index()]);
    Slot::new(prios_switch(cur.index(), save, next_sp))
}

/// Stacks are static; a reclaimed slot's stack is rewritten by the next
/// `prepare_context`.
pub fn release_context(slot: Slot) {
    trace!("released context of slot {}", slot.index());
}

/// The Cortex-M4 has no MMU; user address spaces are not switched.
pub fn activate_address_space(_space: Option<AddressSpace>) {}

pub fn stack_intact(slot: Slot) -> bool {
    if slot.index() == 0 {
        return true;
    }
    // SAFETY: reads one aligned word of a static array.
    unsafe { (addr_of!(STACKS[slot.index()]) as *const u32).read_volatile() == STACK_CANARY }
}

extern "C" fn thread_entry(prev: usize) -> ! {
    kernel::thread_trampoline(Slot::new(prev))
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Start SysTick at `ticks_per_second` and give SysTick and PendSV the
/// lowest priority.
pub fn start_timer(ticks_per_second: u32) {
    // SAFETY: called once from `kernel::start` on the only core; the kernel
    // is the sole user of SYST and the system handler priorities.
    let mut cp = unsafe { cortex_m::Peripherals::steal() };

    cp.SYST.set_reload(SYSTEM_CLOCK_HZ / ticks_per_second - 1);
    cp.SYST.clear_current();
    cp.SYST.set_clock_source(SystClkSource::Core);
    cp.SYST.enable_counter();
    cp.SYST.enable_interrupt();

    // SAFETY: lowering priorities cannot break a priority-based critical
    // section; the kernel uses PRIMASK only.
    unsafe {
        cp.SCB.set_priority(SystemHandler::SysTick, 0xFF);
        cp.SCB.set_priority(SystemHandler::PendSV, 0xFF);
    }
}

/// SysTick exception handler: scheduler tick entry point.
#[exception]
fn SysTick() {
    kernel::tick();
    if kernel::take_yield_request() {
        SCB::set_pendsv();
    }
}

// ---------------------------------------------------------------------------
// PendSV (yield on interrupt return)
// ---------------------------------------------------------------------------

extern "C" fn prios_preempt() {
    kernel::yield_now();
}

// PendSV pushes a second exception frame below the hardware one, aimed at
// `preempt_trampoline`, and returns through it. The trampoline finds the
// interrupted frame at SP: r0 r1 r2 r3 r12 lr pc xPSR, plus a pad word if
// xPSR bit 9 is set. After yielding it reloads r12 and lr, moves r0–r3
// next to the saved pc, restores the flags and pops everything at once.
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "sub sp, #32",
    "ldr r0, =preempt_trampoline",
    "str r0, [sp, #24]",
    "mov r0, #0x01000000",
    "str r0, [sp, #28]",
    "bx lr",
    ".size PendSV, . - PendSV",
    "",
    ".section .text.preempt_trampoline,\"ax\",%progbits",
    ".global preempt_trampoline",
    ".type preempt_trampoline,%function",
    ".thumb_func",
    "preempt_trampoline:",
    "bl {preempt}",
    "ldr r12, [sp, #16]",
    "ldr lr, [sp, #20]",
    "ldr r0, [sp, #28]",
    "add r1, sp, #12",
    "tst r0, #0x200",
    "it ne",
    "addne r1, r1, #4",
    "ldr r2, [sp, #24]",
    "orr r2, r2, #1",
    "str r2, [r1, #16]",
    "ldr r2, [sp, #12]",
    "str r2, [r1, #12]",
    "ldr r2, [sp, #8]",
    "str r2, [r1, #8]",
    "ldr r2, [sp, #4]",
    "str r2, [r1, #4]",
    "ldr r2, [sp, #0]",
    "str r2, [r1, #0]",
    "msr apsr_nzcvqg, r0",
    "mov sp, r1",
    "pop {{r0-r3, pc}}",
    ".size preempt_trampoline, . - preempt_trampoline",
    preempt = sym prios_preempt,
);

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Log sink writing to ITM stimulus port 0.
pub fn console_write(args: fmt::Arguments<'_>) {
    // SAFETY: the logger is the only writer of stimulus port 0.
    let itm = unsafe { &mut *(ITM::PTR as *mut cortex_m::peripheral::itm::RegisterBlock) };
    cortex_m::itm::write_fmt(&mut itm.stim[0], args);
    cortex_m::itm::write_str(&mut itm.stim[0], "\n");
}
