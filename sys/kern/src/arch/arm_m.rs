// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7E-M.
//!
//! # Exception roles
//!
//! The kernel uses three service routines, in strictly descending
//! priority:
//!
//! - `SysTick` maintains the kernel timestamp and asks for a scheduler run
//!   through its hook (unless the tick barrier is raised).
//! - `SVCall` implements the `SVC` instruction used to make syscalls. It
//!   runs the dispatcher in Handler mode and writes the result back into
//!   the caller's stacked r0. It never switches context itself.
//! - `PendSV` performs all context switches. Anybody who wants one --
//!   the tick hook, a blocking syscall -- pokes the PendSV pending bit,
//!   and the switch happens once every higher-priority handler has
//!   drained.
//!
//! Splitting the switch away from `SVCall` keeps syscall entry cheap and
//! means the expensive full save/restore only happens when a switch is
//! actually wanted. This is the arrangement most books on the Cortex-M
//! recommend, and it's also why the save/restore code below lives in
//! `PendSV` alone.
//!
//! # Context image
//!
//! A preempted task's volatile state lives on its own stack, not in the
//! task record: the hardware stacks r0-r3/r12/lr/pc/xPSR on exception
//! entry, and `PendSV` pushes r4-r11 plus the EXC_RETURN word below that
//! (and s16-s31 when the task has live floating-point state). The task
//! record only stores the resulting stack pointer. `task::seed_stack`
//! fabricates exactly this image for a fresh task, which is how the first
//! "restore" of a task becomes its first instruction.
//!
//! # First switch and shutdown
//!
//! Before the first switch, PSP is zero -- a sentinel. `PendSV` notices
//! and, instead of saving task state, banks the kernel's own r4-r11/lr
//! and the main stack pointer in `MAIN_STACK_CONTEXT`. When the scheduler
//! later returns zero (Finite-mode shutdown), `PendSV` unbanks that
//! context and returns to Thread mode on the main stack, which lands
//! execution right back in `start()`.

use core::arch::global_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use tarn_abi::{Code, Control, Sysnum};

/// Log stub. The kernel logs only at boot milestones and on its way down,
/// so by default this compiles to nothing.
#[cfg(not(any(feature = "klog-itm", feature = "klog-semihosting")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if $cond1 != $cond2 {
            panic!("Assertion failed!");
        }
    };
}

/// Implemented priority bits in the NVIC. This is SoC-specific; 3 is
/// common across the Cortex-M4 parts we target.
const NVIC_PRIO_BITS: u32 = 3;

/// To allow our clock frequency to be easily determined from a debugger,
/// we store it in memory.
#[no_mangle]
static CLOCK_FREQ_KHZ: AtomicU32 = AtomicU32::new(0);

/// Main stack pointer banked by the first `PendSV`, consumed by the
/// shutdown path. Zero means "no banked context".
#[no_mangle]
static MAIN_STACK_CONTEXT: AtomicU32 = AtomicU32::new(0);

// Because debuggers need to know the clock frequency, and because the
// usage accounting needs it to calibrate cycles against ticks, this should
// be set as early in boot as it can be.
pub fn set_clock_freq(khz: u32) {
    CLOCK_FREQ_KHZ.store(khz, Ordering::Relaxed);
}

pub fn clock_freq_khz() -> u32 {
    CLOCK_FREQ_KHZ.load(Ordering::Relaxed)
}

/// Reads the CONTROL special register into the ABI view used by the
/// runtime predicates.
pub fn control() -> Control {
    let c = cortex_m::register::control::read();
    let mut out = Control::empty();
    if !c.npriv().is_privileged() {
        out |= Control::NPRIV;
    }
    if !c.spsel().is_msp() {
        out |= Control::SPSEL;
    }
    if c.fpca().is_active() {
        out |= Control::FPCA;
    }
    out
}

/// Sets the privilege level Thread mode will have once the current
/// exception returns. Called by the scheduler just before dispatching the
/// selected task.
pub fn set_thread_privilege(privileged: bool) {
    use cortex_m::register::control::{self, Npriv};

    let mut c = control::read();
    c.set_npriv(if privileged {
        Npriv::Privileged
    } else {
        Npriv::Unprivileged
    });
    // Safety: we're in Handler mode adjusting Thread-mode state, which is
    // exactly what this register is for. The ISB makes the change visible
    // before the exception return.
    unsafe {
        control::write(c);
    }
    cortex_m::asm::isb();
}

/// Writes the Process stack pointer. Used once at boot to plant the
/// first-switch sentinel (zero).
pub fn set_psp(sp: usize) {
    // Safety: PSP is not the active stack here; we only ever run this from
    // main-stack Thread mode.
    unsafe {
        cortex_m::register::psp::write(sp as u32);
    }
}

/// Reads the Process stack pointer.
pub fn psp() -> usize {
    cortex_m::register::psp::read() as usize
}

/// Sets the PendSV pending bit, requesting a context switch once all
/// higher-priority handlers have drained.
pub fn pend_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Invalidates any exclusive monitor the preempted task may have open, so
/// its interrupted LDREX/STREX sequence fails cleanly and retries.
pub fn clear_exclusive() {
    // Safety: CLREX has no effect beyond the local monitor.
    unsafe {
        core::arch::asm!("clrex", options(nostack, preserves_flags));
    }
}

/// Issues a supervisor call: syscall number in r0, parameter-record
/// pointer in r1, result code back in r0. Everything else is preserved by
/// the handler.
pub fn syscall(nr: Sysnum, arg: *mut ()) -> Code {
    let mut code = nr as u32;
    unsafe {
        core::arch::asm!(
            "svc #0",
            inout("r0") code,
            in("r1") arg,
            options(nostack),
        );
    }
    // The dispatcher only ever produces valid codes; anything else means
    // the kernel and this stub disagree about the ABI.
    Code::try_from(code).unwrap_or(Code::AssertionFailed)
}

/// Turns on the DWT cycle counter used for CPU usage accounting.
pub fn enable_cycle_counter() {
    let dwt = unsafe { &*cortex_m::peripheral::DWT::PTR };
    const CYCCNTENA: u32 = 1 << 0;
    // Safety: enabling a counter; no memory-safety implications.
    unsafe {
        dwt.ctrl.modify(|v| v | CYCCNTENA);
    }
}

/// Reads and restarts the cycle counter. The scheduler calls this on
/// entry, so the value is "cycles since the previous scheduling".
pub fn cycles_take() -> u32 {
    let dwt = unsafe { &*cortex_m::peripheral::DWT::PTR };
    let cycles = dwt.cyccnt.read();
    // Safety: resetting a free-running counter.
    unsafe {
        dwt.cyccnt.write(0);
    }
    cycles
}

/// Reads the cycle counter without restarting it. Together with
/// `cycles_take` at scheduler entry this approximates the scheduler's own
/// cost.
pub fn cycles_read() -> u32 {
    let dwt = unsafe { &*cortex_m::peripheral::DWT::PTR };
    dwt.cyccnt.read()
}

/// Assigns the exception priorities the kernel relies on: tick highest,
/// supervisor call just below it, PendSV lowest. Peripheral interrupts
/// are the application's business but must stay between SVCall and
/// PendSV.
pub fn setup_exception_priorities() {
    let shift = 8 - NVIC_PRIO_BITS;
    // Safety: we're purely assigning priorities, which can't cause
    // surprise preemption of anything that matters yet; the register API
    // is just conservatively unsafe.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SVCall (exception 11).
        scb.shpr[7].write(tarn_abi::SYSCALL_EXC_PRIORITY << shift);
        // PendSV (exception 14): lowest configurable.
        scb.shpr[10]
            .write(tarn_abi::scheduler_exc_priority(NVIC_PRIO_BITS) << shift);
        // SysTick (exception 15): highest.
        scb.shpr[11].write(tarn_abi::TICK_EXC_PRIORITY << shift);
    }
}

/// Programs and starts the tick timer with the given reload value
/// (core-clock cycles per tick).
pub fn start_tick_timer(reload: u32) {
    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(reload - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt, clocked from the core.
        syst.csr.modify(|v| v | 0b111);
    }
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Parks the processor. Used after unrecoverable conditions and by the
/// trampolines' unreachable tails.
pub fn park() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::time::on_tick();
}

/// The Rust side of the SVCall handler, reached once the assembly stub
/// has fished the arguments out of the caller's exception frame.
#[no_mangle]
unsafe extern "C" fn syscall_entry(nr: u32, arg: u32) -> u32 {
    u32::from(crate::syscalls::dispatch(nr, arg as *mut ()))
}

/// The Rust side of the PendSV handler, after the assembly stub has saved
/// the preempted context. Returns the stack pointer to resume, or zero to
/// shut the kernel down.
#[no_mangle]
unsafe extern "C" fn schedule_entry(current_sp: u32) -> u32 {
    crate::sched::schedule(current_sp as usize) as u32
}

// Handler for the SVC instruction. The caller's r0/r1 were stacked by
// exception entry; we pass them to the dispatcher and write the result
// code over the stacked r0, where the task picks it up on return. The
// full context stays on the task stack untouched -- if the call needs a
// switch it pends PendSV, which tail-chains after us.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Fetch the stacked r0 (syscall number) and r1 (parameter pointer).
        mrs r2, psp
        ldm r2, {{r0, r1}}

        push {{r4, lr}}
        bl syscall_entry
        pop {{r4, lr}}

        @ Deposit the result code into the stacked r0.
        mrs r2, psp
        str r0, [r2]
        bx lr
"}

// Handler for PendSV: the context switch itself. See the module docs for
// the first-switch / shutdown choreography.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ PSP == 0 marks the first switch: the interrupted context is the
        @ kernel's own, on the main stack.
        mrs r0, psp
        cbz r0, 2f

        @ If the task has live floating-point state the hardware stacked
        @ s0-s15 already; save the high registers next to them.
        tst lr, #0x10
        it eq
        vstmdbeq r0!, {{s16-s31}}

        @ Software-saved half of the context image: r4-r11 + EXC_RETURN.
        stmdb r0!, {{r4-r11, lr}}

    1:  bl schedule_entry
        @ r0 is now the stack pointer of the task to resume, or zero to
        @ shut down.
        cbz r0, 3f

        ldmia r0!, {{r4-r11, lr}}
        tst lr, #0x10
        it eq
        vldmiaeq r0!, {{s16-s31}}
        msr psp, r0
        bx lr

    2:  @ First switch: bank the kernel context so a Finite-mode shutdown
        @ can land back in start(). r3 is pushed purely to keep the stack
        @ 8-byte aligned across the call.
        stmdb sp!, {{r3, r4-r11, lr}}
        movw r1, #:lower16:MAIN_STACK_CONTEXT
        movt r1, #:upper16:MAIN_STACK_CONTEXT
        str sp, [r1]
        movs r0, #0
        b 1b

    3:  @ Shutdown: abandon whatever is on the main stack below the banked
        @ context and return to Thread mode where the first switch left it.
        movw r1, #:lower16:MAIN_STACK_CONTEXT
        movt r1, #:upper16:MAIN_STACK_CONTEXT
        ldr r1, [r1]
        mov sp, r1
        ldmia sp!, {{r3, r4-r11, lr}}
        bx lr
"}

// A hard fault parks the processor in a recognizable spin: a breakpoint
// (handed to the debugger when one is attached) followed by a tight loop.
// Kernel state is left untouched for post-mortem inspection.
global_asm! {"
    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
    1:  bkpt #0xF
        b 1b
"}
