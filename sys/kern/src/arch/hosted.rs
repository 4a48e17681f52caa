// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the machine, so the kernel's logic can run under
//! the native test harness.
//!
//! The simulation is deliberately thin: a CONTROL register, a PSP, a
//! PendSV pending latch, and a cycle counter, all as plain atomics. There
//! is no preemption -- tests advance the tick and invoke the scheduler by
//! hand, playing the role of the hardware. Syscalls skip the SVC
//! instruction and call the dispatcher directly, which is equivalent
//! because the dispatcher never relies on Handler mode itself.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use tarn_abi::{Code, Control, Sysnum};

macro_rules! klog {
    ($s:expr) => { eprintln!($s) };
    ($s:expr, $($tt:tt)*) => { eprintln!($s, $($tt)*) };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        assert_eq!($cond1, $cond2)
    };
}

static CLOCK_FREQ_KHZ: AtomicU32 = AtomicU32::new(0);
static SIM_CONTROL: AtomicU32 = AtomicU32::new(0);
static SIM_PSP: AtomicUsize = AtomicUsize::new(0);
static PENDSV_LATCH: AtomicBool = AtomicBool::new(false);
static SIM_CYCLES: AtomicU32 = AtomicU32::new(0);

pub fn set_clock_freq(khz: u32) {
    CLOCK_FREQ_KHZ.store(khz, Ordering::Relaxed);
}

pub fn clock_freq_khz() -> u32 {
    CLOCK_FREQ_KHZ.load(Ordering::Relaxed)
}

pub fn control() -> Control {
    Control::from_bits_truncate(SIM_CONTROL.load(Ordering::Relaxed))
}

/// Test hook: pretend to be a particular kind of caller.
pub fn set_control(c: Control) {
    SIM_CONTROL.store(c.bits(), Ordering::Relaxed);
}

/// On hardware this adjusts Thread-mode privilege for the task about to
/// run. The simulation also sets SPSEL, since dispatching a task is the
/// only reason the scheduler calls this.
pub fn set_thread_privilege(privileged: bool) {
    let mut c = Control::SPSEL;
    if !privileged {
        c |= Control::NPRIV;
    }
    SIM_CONTROL.store(c.bits(), Ordering::Relaxed);
}

pub fn set_psp(sp: usize) {
    SIM_PSP.store(sp, Ordering::Relaxed);
}

pub fn psp() -> usize {
    SIM_PSP.load(Ordering::Relaxed)
}

pub fn pend_switch() {
    PENDSV_LATCH.store(true, Ordering::Relaxed);
}

/// Test hook: consume the pending-switch latch, the way PendSV firing
/// would.
pub fn take_pending_switch() -> bool {
    PENDSV_LATCH.swap(false, Ordering::Relaxed)
}

pub fn clear_exclusive() {}

pub fn syscall(nr: Sysnum, arg: *mut ()) -> Code {
    // The SVC handler runs at a priority where nothing it does can be
    // preempted by the tick; the hosted harness is single-threaded, so a
    // direct call has the same property.
    crate::syscalls::dispatch(nr as u32, arg)
}

pub fn enable_cycle_counter() {}

pub fn cycles_take() -> u32 {
    SIM_CYCLES.swap(0, Ordering::Relaxed)
}

pub fn cycles_read() -> u32 {
    SIM_CYCLES.load(Ordering::Relaxed)
}

/// Test hook: pretend the machine burned this many cycles since the last
/// scheduling.
pub fn add_cycles(n: u32) {
    SIM_CYCLES.fetch_add(n, Ordering::Relaxed);
}

pub fn setup_exception_priorities() {}

pub fn start_tick_timer(_reload: u32) {}

pub fn wait_for_interrupt() {}

pub fn park() -> ! {
    panic!("kernel parked");
}

/// Test hook: put the simulated machine back in its reset state.
pub fn reset() {
    CLOCK_FREQ_KHZ.store(0, Ordering::Relaxed);
    SIM_CONTROL.store(0, Ordering::Relaxed);
    SIM_PSP.store(0, Ordering::Relaxed);
    PENDSV_LATCH.store(false, Ordering::Relaxed);
    SIM_CYCLES.store(0, Ordering::Relaxed);
}
