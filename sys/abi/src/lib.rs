// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.
//!
//! Everything in here is part of the contract between a task and the kernel:
//! result codes, priorities, the syscall numbering, and the exact shape of
//! the context image the kernel lays down on a fresh task stack. Changing
//! any of it changes the ABI.

// Allow std-y things to be used in test. Note that this attribute is a bit
// of a trap for the programmer, because rust-analyzer by default seems to
// build things with test set. This means it's easy to introduce code
// incompatible with no_std without your editor hassling you about it.
#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Sentinel written to the last word of every task buffer. The scheduler
/// asserts this value on every visit to a task; a mismatch means the buffer
/// has been overrun and the kernel is no longer trustworthy.
pub const STACK_SENTINEL: u32 = 0xDEAD_BEEF;

/// EXC_RETURN value used to enter a task for the first time: return to
/// Thread mode, resume on the Process stack, no floating-point state.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Initial xPSR for a fresh task: just the Thumb bit.
pub const INITIAL_XPSR: u32 = 1 << 24;

/// EXC_RETURN bit that is *clear* when the exception stacked floating-point
/// state (i.e. an extended frame is on the stack).
pub const EXC_RETURN_STD_FRAME: u32 = 1 << 4;

/// Number of integer registers in a full context image: the eight
/// hardware-stacked words, the eight callee-saved registers, and the
/// EXC_RETURN word.
pub const INTEGER_CONTEXT_WORDS: usize = 17;

/// Worst-case additional words when the FPU is in play: S0-S15 + FPSCR +
/// alignment reserve stacked by hardware, plus S16-S31 saved by the kernel.
pub const FP_CONTEXT_WORDS: usize = 16 + 2 + 16;

/// Words a task stack must be able to absorb for one full context save.
pub const CONTEXT_WORDS: usize = INTEGER_CONTEXT_WORDS + FP_CONTEXT_WORDS;

/// Minimum scratch stack left to a task below its context image, in bytes.
pub const MIN_TASK_STACK: usize = 128;

/// Timeout value meaning "wait forever". As a deadline it degrades into
/// a tick count no real system reaches.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Exception priority for the tick timer: highest.
pub const TICK_EXC_PRIORITY: u8 = 0;

/// Exception priority for the supervisor call: just below the tick.
pub const SYSCALL_EXC_PRIORITY: u8 = 1;

/// Exception priority for the pendable service exception that runs the
/// scheduler: the lowest the NVIC can express. Peripheral interrupts are
/// expected to sit between the supervisor call and this.
pub const fn scheduler_exc_priority(nvic_prio_bits: u32) -> u8 {
    ((1u32 << nvic_prio_bits) - 1) as u8
}

/// Unified result code returned by every kernel entry point, and recorded in
/// a task's wait record when an operation completes asynchronously.
///
/// The kernel never unwinds across its boundary; errors are values. `Waiting`
/// is not an error: it means the synchronous half of a call completed and the
/// final result will be delivered through the caller's task state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Code {
    Success = 0,
    Error = 1,
    InvalidCaller = 2,
    InvalidParams = 3,
    InvalidBuffer = 4,
    InvalidBufferAlignment = 5,
    InvalidBufferSize = 6,
    InvalidState = 7,
    InvalidOperation = 8,
    Timeout = 9,
    Waiting = 10,
    Retry = 11,
    BufferFull = 12,
    Empty = 13,
    Locked = 14,
    AlreadyInitialized = 15,
    NotInitialized = 16,
    NoCurrentTask = 17,
    AssertionFailed = 18,
}

impl Code {
    pub fn is_success(self) -> bool {
        self == Code::Success
    }
}

impl From<Code> for u32 {
    fn from(c: Code) -> Self {
        c as u32
    }
}

/// We're using an explicit `TryFrom` impl instead of `FromPrimitive` because
/// the kernel doesn't currently depend on `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Code {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        Ok(match x {
            0 => Self::Success,
            1 => Self::Error,
            2 => Self::InvalidCaller,
            3 => Self::InvalidParams,
            4 => Self::InvalidBuffer,
            5 => Self::InvalidBufferAlignment,
            6 => Self::InvalidBufferSize,
            7 => Self::InvalidState,
            8 => Self::InvalidOperation,
            9 => Self::Timeout,
            10 => Self::Waiting,
            11 => Self::Retry,
            12 => Self::BufferFull,
            13 => Self::Empty,
            14 => Self::Locked,
            15 => Self::AlreadyInitialized,
            16 => Self::NotInitialized,
            17 => Self::NoCurrentTask,
            18 => Self::AssertionFailed,
            _ => return Err(()),
        })
    }
}

/// How the kernel was asked to run.
///
/// `Finite` permits an orderly shutdown back onto the pre-boot main stack;
/// `Forever` rejects it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(u32)]
pub enum RunMode {
    #[default]
    Undefined = 0,
    Forever = 1,
    Finite = 2,
}

/// Task priority. Numerically lower is more important, which keeps the
/// scheduler's scan loop simple.
///
/// `Boot` and the `Kernel*` levels run privileged in Thread mode; everything
/// else runs unprivileged. Driver tasks are pinned to reserved kernel
/// levels regardless of what the caller asked for.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Priority {
    Boot = 0,
    Kernel0 = 1,
    Kernel1 = 2,
    Kernel2 = 3,
    User0 = 4,
    User1 = 5,
    User2 = 6,
    Idle = 7,
}

impl Priority {
    pub const COUNT: usize = 8;

    /// Reserved level for storage driver tasks.
    pub const DRIVER_STORAGE: Self = Self::Kernel2;
    /// Reserved level for UART driver tasks.
    pub const DRIVER_UART: Self = Self::Kernel2;

    pub const KERNEL_HIGHEST: Self = Self::Kernel0;
    pub const USER_LOWEST: Self = Self::User2;

    /// All levels, most important first. The scheduler's scan order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Boot,
        Self::Kernel0,
        Self::Kernel1,
        Self::Kernel2,
        Self::User0,
        Self::User1,
        Self::User2,
        Self::Idle,
    ];

    /// Index into per-priority queue arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        (self as u8) < (other as u8)
    }

    /// Tasks at this level run with privileged Thread-mode execution.
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            Self::Boot | Self::Kernel0 | Self::Kernel1 | Self::Kernel2
        )
    }

    /// Levels a caller may legally request through `task_start`; `Boot` and
    /// `Idle` are reserved for the kernel's own bookend tasks.
    pub fn is_startable(self) -> bool {
        !matches!(self, Self::Boot | Self::Idle)
    }
}

impl core::convert::TryFrom<u8> for Priority {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, ()> {
        Ok(match x {
            0 => Self::Boot,
            1 => Self::Kernel0,
            2 => Self::Kernel1,
            3 => Self::Kernel2,
            4 => Self::User0,
            5 => Self::User1,
            6 => Self::User2,
            7 => Self::Idle,
            _ => return Err(()),
        })
    }
}

/// Flavor of a task. Driver types get a reserved priority and a private
/// data region carved out of the top of their buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TaskType {
    Generic = 0,
    DriverStorage = 1,
    DriverUart = 2,
}

impl TaskType {
    pub fn is_driver(self) -> bool {
        !matches!(self, Self::Generic)
    }
}

/// States of the task state machine.
///
/// ```text
/// Ready --schedule--> Running --yield/delay/wait--> Waiting --wake--> Ready
/// Ready/Running/Waiting --terminate--> Terminated (absorbing)
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TaskState {
    Terminated = 0,
    Waiting = 1,
    Ready = 2,
    Running = 3,
}

/// The blocking predicates a task can wait on with a timeout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SignalKind {
    SemaphoreAcquire = 0,
    SemaphoreRelease = 1,
    MutexLock = 2,
    MutexUnlock = 3,
}

impl core::convert::TryFrom<u32> for SignalKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        Ok(match x {
            0 => Self::SemaphoreAcquire,
            1 => Self::SemaphoreRelease,
            2 => Self::MutexLock,
            3 => Self::MutexUnlock,
            _ => return Err(()),
        })
    }
}

/// Syscall numbering. The number travels in r0 of the supervisor call; a
/// pointer to the call-specific parameter record travels in r1.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    BootEnded = 0,
    TaskStart = 1,
    Yield = 2,
    WaitForSignal = 3,
    DelayFrom = 4,
    PeriodicDelay = 5,
    StorageAccess = 6,
    TaskTerminate = 7,
    Shutdown = 8,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        Ok(match x {
            0 => Self::BootEnded,
            1 => Self::TaskStart,
            2 => Self::Yield,
            3 => Self::WaitForSignal,
            4 => Self::DelayFrom,
            5 => Self::PeriodicDelay,
            6 => Self::StorageAccess,
            7 => Self::TaskTerminate,
            8 => Self::Shutdown,
            _ => return Err(()),
        })
    }
}

/// Direction of a driver job.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum DriverOp {
    Read = 0,
    Write = 1,
}

bitflags::bitflags! {
    /// View of the CONTROL special register, used by the runtime predicates
    /// that classify the caller of an API entry point.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Control: u32 {
        /// Thread mode runs unprivileged.
        const NPRIV = 1 << 0;
        /// Thread mode uses the Process stack pointer.
        const SPSEL = 1 << 1;
        /// Floating-point context is active.
        const FPCA = 1 << 2;
    }
}

impl Control {
    /// Is the current execution context a task? Tasks always run Thread
    /// mode on the Process stack.
    pub fn in_task(self) -> bool {
        self.contains(Self::SPSEL)
    }

    /// Is the current execution context a *privileged* task?
    pub fn in_privileged_task(self) -> bool {
        self.contains(Self::SPSEL) && !self.contains(Self::NPRIV)
    }

    /// Is the current execution context privileged at all? Handler mode and
    /// main-stack Thread mode (i.e. pre-boot `main`) both qualify.
    pub fn privileged(self) -> bool {
        !self.contains(Self::SPSEL)
    }
}

/// Entry point of a task. Receives the parameter word passed to
/// `task_start` and produces the task's return value.
///
/// `extern "C"` because the kernel fabricates the first call: the parameter
/// arrives in r0 of a synthetic exception frame.
pub type TaskEntry = extern "C" fn(usize) -> u32;

/// The full integer context image laid down at the top of a fresh task
/// stack, low address first. The lower half (`r4`..`exc_return`) is what
/// the kernel saves and restores by hand; the upper half is the standard
/// hardware-stacked exception frame.
///
/// The first restore of this image transfers control to the task entry
/// point with its parameter in r0 and the trampoline in lr.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ContextFrame {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    /// EXC_RETURN code restored into lr inside the context-switch handler.
    pub exc_return: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

impl ContextFrame {
    pub const WORDS: usize = INTEGER_CONTEXT_WORDS;
    pub const BYTES: usize = Self::WORDS * 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_frame_matches_abi_layout() {
        assert_eq!(core::mem::size_of::<ContextFrame>(), 68);
        assert_eq!(core::mem::offset_of!(ContextFrame, exc_return), 8 * 4);
        assert_eq!(core::mem::offset_of!(ContextFrame, r0), 9 * 4);
        assert_eq!(core::mem::offset_of!(ContextFrame, xpsr), 16 * 4);
    }

    #[test]
    fn code_round_trips_through_u32() {
        for v in 0..=18u32 {
            let c = Code::try_from(v).unwrap();
            assert_eq!(u32::from(c), v);
        }
        assert!(Code::try_from(19).is_err());
    }

    #[test]
    fn priority_ordering_and_privilege() {
        assert!(Priority::Boot.is_more_important_than(Priority::Kernel0));
        assert!(Priority::User2.is_more_important_than(Priority::Idle));
        assert!(!Priority::Idle.is_more_important_than(Priority::Idle));
        assert!(Priority::Kernel2.is_privileged());
        assert!(!Priority::User0.is_privileged());
        assert!(!Priority::Idle.is_privileged());
        assert!(!Priority::Boot.is_startable());
    }

    #[test]
    fn control_predicates() {
        let main = Control::empty();
        assert!(main.privileged() && !main.in_task());

        let kernel_task = Control::SPSEL;
        assert!(kernel_task.in_task());
        assert!(kernel_task.in_privileged_task());
        assert!(!kernel_task.privileged());

        let user_task = Control::SPSEL | Control::NPRIV;
        assert!(user_task.in_task());
        assert!(!user_task.in_privileged_task());
    }
}
