// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's public surface.
//!
//! Every entry point starts by classifying its caller through the
//! CONTROL register -- in a task? privileged? -- and refuses the wrong
//! context up front with `InvalidCaller`. Everything that affects
//! scheduling then funnels through the supervisor call, privileged
//! callers included; the uniform route keeps the kernel's view of "who
//! is running" consistent with the hardware's.
//!
//! Calls that block (`task_wait_for_signal`, `task_storage_access`)
//! return `Waiting` from their synchronous half; by the time the caller
//! runs again the final outcome is in place, and these wrappers read it
//! back so their callers never see `Waiting` at all.

use core::ptr::NonNull;

use tarn_abi::{
    Code, DriverOp, Priority, RunMode, SignalKind, Sysnum, TaskEntry,
    TaskState, TaskType,
};

use crate::arch;
use crate::driver::{self, StorageAccess};
use crate::startup;
use crate::syscalls::{DelayFrom, TaskLaunch, TerminateTask, WaitForSignal};
use crate::task::TaskControl;
use crate::time::{self, Ticks};

fn into_result(code: Code) -> Result<(), Code> {
    if code.is_success() {
        Ok(())
    } else {
        Err(code)
    }
}

/// Byte size of the buffer `init` needs.
pub fn init_buffer_size() -> usize {
    startup::buffer_size()
}

/// Minimum byte size of a task buffer of the given type. For storage
/// drivers, `storage_jobs` is the requested job-queue depth.
pub fn task_min_buffer_size(
    task_type: TaskType,
    storage_jobs: usize,
) -> usize {
    match task_type {
        TaskType::Generic | TaskType::DriverUart => {
            TaskControl::GENERIC_MIN_BUFFER
        }
        TaskType::DriverStorage => {
            TaskControl::GENERIC_MIN_BUFFER
                + driver::storage_region_size(storage_jobs)
        }
    }
}

/// Installs the kernel into `buffer`. Main stack only, before any
/// scheduling.
///
/// # Safety
///
/// `buffer` must be writable, 8-byte aligned, at least
/// `init_buffer_size()` bytes, and owned by the kernel from here on.
pub unsafe fn init(buffer: *mut u8) -> Result<(), Code> {
    if arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }
    startup::init(buffer)
}

/// Boots the kernel in Finite mode and starts scheduling with `entry` as
/// the boot task. Returns only after some privileged task calls
/// [`terminate`]; by then the tick hook is gone and the kernel is
/// uninstalled.
pub fn start(entry: TaskEntry, param: usize) -> Result<(), Code> {
    if arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }
    startup::syscall_boot(RunMode::Finite, entry, param)?;

    // On hardware, the context switch pended by the boot call preempts
    // right here, and this path resumes -- on the banked main stack --
    // only once a Finite-mode terminate unwinds scheduling.
    startup::syscall_shutdown()
}

/// Boots the kernel in Forever mode: [`terminate`] is refused and
/// scheduling never unwinds.
pub fn forever(entry: TaskEntry, param: usize) -> ! {
    uassert!(!arch::control().in_task());
    uassert!(startup::installed());

    let r = startup::syscall_boot(RunMode::Forever, entry, param);
    uassert!(r.is_ok());

    // Unreachable once the first switch happens; parked for good measure.
    arch::park()
}

/// Ends scheduling (Finite mode only): the next scheduler pass restores
/// the pre-boot main stack and [`start`] returns.
pub fn terminate() -> Result<(), Code> {
    if !arch::control().in_privileged_task() {
        return Err(Code::InvalidCaller);
    }
    into_result(arch::syscall(Sysnum::Shutdown, core::ptr::null_mut()))
}

/// Registers a generic task. Privileged tasks only.
///
/// # Safety
///
/// `buffer` must be writable, at least
/// `task_min_buffer_size(Generic, 0)` bytes, and owned by the kernel
/// until the task terminates and its storage is reused.
pub unsafe fn task_start(
    buffer: *mut u8,
    buffer_size: usize,
    entry: TaskEntry,
    param: usize,
    priority: Priority,
    description: &'static str,
) -> Result<(), Code> {
    if !arch::control().in_privileged_task() {
        return Err(Code::InvalidCaller);
    }
    if !priority.is_startable() {
        return Err(Code::InvalidParams);
    }

    let mut launch = TaskLaunch {
        buffer,
        buffer_size,
        entry,
        param,
        priority,
        description,
        task_type: TaskType::Generic,
        storage_jobs: 0,
    };
    into_result(arch::syscall(
        Sysnum::TaskStart,
        (&mut launch as *mut TaskLaunch).cast(),
    ))
}

/// Registers a driver task. The kernel pins the priority to the
/// reserved level for the driver type; the one passed by the caller is
/// irrelevant. Privileged tasks only.
///
/// # Safety
///
/// As for [`task_start`], with the storage variant's minimum computed
/// for `storage_jobs`.
pub unsafe fn task_driver_start(
    buffer: *mut u8,
    buffer_size: usize,
    entry: TaskEntry,
    param: usize,
    description: &'static str,
    driver_type: TaskType,
    storage_jobs: usize,
) -> Result<(), Code> {
    if !arch::control().in_privileged_task() {
        return Err(Code::InvalidCaller);
    }
    if !driver_type.is_driver() {
        return Err(Code::InvalidParams);
    }

    let mut launch = TaskLaunch {
        buffer,
        buffer_size,
        entry,
        param,
        // Placeholder; driver init substitutes the reserved level.
        priority: Priority::Idle,
        description,
        task_type: driver_type,
        storage_jobs,
    };
    into_result(arch::syscall(
        Sysnum::TaskStart,
        (&mut launch as *mut TaskLaunch).cast(),
    ))
}

/// Terminates a task. A null `buffer` terminates the caller, which then
/// never returns from this call. Privileged tasks only.
///
/// # Safety
///
/// A non-null `buffer` must hold a live task previously started from it.
pub unsafe fn task_terminate(
    buffer: *mut u8,
    ret_value: u32,
) -> Result<(), Code> {
    if !arch::control().in_privileged_task() {
        return Err(Code::InvalidCaller);
    }
    let mut args = TerminateTask {
        task: buffer.cast(),
        ret_value,
    };
    into_result(arch::syscall(
        Sysnum::TaskTerminate,
        (&mut args as *mut TerminateTask).cast(),
    ))
}

/// The calling task's control record, or `None` outside of scheduling.
pub fn task_self() -> Option<NonNull<TaskControl>> {
    startup::with_kernel(|k| k.current_task).ok().flatten()
}

/// Gives up the remainder of the slice.
pub fn task_yield() -> Result<(), Code> {
    if !arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }
    into_result(arch::syscall(Sysnum::Yield, core::ptr::null_mut()))
}

/// Suspends the caller for `ticks`, measured from now.
pub fn task_delay(ticks: u64) -> Result<(), Code> {
    task_delay_from(ticks, time::now())
}

/// Suspends the caller until `from + ticks`.
pub fn task_delay_from(ticks: u64, from: Ticks) -> Result<(), Code> {
    if !arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }
    let mut args = DelayFrom { ticks, from };
    into_result(arch::syscall(
        Sysnum::DelayFrom,
        (&mut args as *mut DelayFrom).cast(),
    ))
}

/// Suspends the caller until `ticks` past its previous cadence point,
/// keeping periodic work aligned to an absolute cadence regardless of
/// scheduling jitter. Zero re-bases the cadence at the current tick.
pub fn task_periodic_delay(ticks: u64) -> Result<(), Code> {
    if !arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }
    let mut ticks = ticks;
    into_result(arch::syscall(
        Sysnum::PeriodicDelay,
        (&mut ticks as *mut u64).cast(),
    ))
}

/// Blocks on a signal: semaphore acquire/release or mutex lock/unlock
/// against `object`, giving up after `timeout` ticks (`0` polls,
/// `WAIT_FOREVER` doesn't give up).
///
/// Returns `Ok` once the signal is acquired; `Err(Timeout)` if it never
/// was.
pub fn task_wait_for_signal(
    kind: SignalKind,
    object: *mut (),
    timeout: u64,
) -> Result<(), Code> {
    if !arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }

    let mut args = WaitForSignal {
        kind,
        object,
        timeout,
    };
    let code = arch::syscall(
        Sysnum::WaitForSignal,
        (&mut args as *mut WaitForSignal).cast(),
    );

    let code = if code == Code::Waiting {
        // The syscall armed the wait and the scheduler parked us; by the
        // time we execute again the wait has resolved one way or the
        // other, and the outcome is on our task record.
        task_self()
            .map(|t| unsafe { t.as_ref() }.sig_result())
            .unwrap_or(Code::Error)
    } else {
        code
    };
    into_result(code)
}

/// Hands a job to the named storage driver task and blocks until the
/// driver completes it.
///
/// # Safety
///
/// `buf` must be valid for `count` sectors of the named device in the
/// direction `op` says.
pub unsafe fn task_storage_access(
    description: &'static str,
    op: DriverOp,
    buf: *mut u8,
    sector: u32,
    count: u32,
) -> Result<(), Code> {
    if !arch::control().in_task() {
        return Err(Code::InvalidCaller);
    }

    // The descriptor lives on our stack for the whole life of the job;
    // that's sound because we sleep until the driver is done with it.
    let mut access = StorageAccess::new(description, op, buf, sector, count);
    let code = arch::syscall(
        Sysnum::StorageAccess,
        (&mut access as *mut StorageAccess).cast(),
    );

    let code = if code == Code::Waiting {
        access.result
    } else {
        code
    };
    into_result(code)
}

/// Reads the return value of a terminated task out of its buffer.
///
/// # Safety
///
/// `buffer` must hold a task previously started from it (terminated or
/// not; a live one is refused, not misread).
pub unsafe fn task_return_value(buffer: *const u8) -> Result<u32, Code> {
    if buffer.is_null() {
        return Err(Code::InvalidParams);
    }
    let task = &*buffer.cast::<TaskControl>();
    if !task.sentinel_ok() {
        return Err(Code::InvalidBuffer);
    }
    if task.state() != TaskState::Terminated {
        return Err(Code::InvalidState);
    }
    Ok(task.return_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tarn_abi::Control;

    extern "C" fn nop_entry(_arg: usize) -> u32 {
        0
    }

    #[test]
    fn min_buffer_sizes_are_word_aligned_and_ordered() {
        let generic = task_min_buffer_size(TaskType::Generic, 0);
        assert_eq!(generic, TaskControl::GENERIC_MIN_BUFFER);
        assert_eq!(generic % 4, 0);

        let storage = task_min_buffer_size(TaskType::DriverStorage, 4);
        assert!(storage > generic);

        // More queue depth, more buffer.
        assert!(
            task_min_buffer_size(TaskType::DriverStorage, 8) > storage
        );
    }

    #[test]
    fn init_refuses_task_context_and_bad_buffers() {
        let _world = testutil::fresh_world();

        crate::arch::set_control(Control::SPSEL);
        assert_eq!(
            unsafe { init(8 as *mut u8) },
            Err(Code::InvalidCaller)
        );

        crate::arch::set_control(Control::empty());
        assert_eq!(
            unsafe { init(core::ptr::null_mut()) },
            Err(Code::InvalidParams)
        );
        assert_eq!(
            unsafe { init(12 as *mut u8) },
            Err(Code::InvalidBufferAlignment)
        );
    }

    #[test]
    fn init_twice_is_refused() {
        let kw = testutil::fresh_kernel();
        let _ = kw;
        let mut other = vec![0u64; init_buffer_size() / 8 + 1];
        assert_eq!(
            unsafe { init(other.as_mut_ptr().cast()) },
            Err(Code::AlreadyInitialized)
        );
    }

    #[test]
    fn task_calls_refuse_the_wrong_caller_class() {
        let _kw = testutil::fresh_kernel();

        // Unprivileged task: may wait and yield, may not start tasks.
        crate::arch::set_control(Control::SPSEL | Control::NPRIV);
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        assert_eq!(
            unsafe {
                task_start(
                    buf.base(),
                    buf.len(),
                    nop_entry,
                    0,
                    Priority::User0,
                    "t",
                )
            },
            Err(Code::InvalidCaller)
        );
        assert_eq!(
            unsafe { task_terminate(core::ptr::null_mut(), 0) },
            Err(Code::InvalidCaller)
        );
        assert_eq!(terminate(), Err(Code::InvalidCaller));

        // Not a task at all: no yielding, no delays.
        crate::arch::set_control(Control::empty());
        assert_eq!(task_yield(), Err(Code::InvalidCaller));
        assert_eq!(task_delay(10), Err(Code::InvalidCaller));
        assert_eq!(task_periodic_delay(10), Err(Code::InvalidCaller));
    }

    #[test]
    fn task_start_screens_reserved_priorities() {
        let _kw = testutil::fresh_kernel();
        crate::arch::set_control(Control::SPSEL);
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        for reserved in [Priority::Boot, Priority::Idle] {
            assert_eq!(
                unsafe {
                    task_start(
                        buf.base(),
                        buf.len(),
                        nop_entry,
                        0,
                        reserved,
                        "nope",
                    )
                },
                Err(Code::InvalidParams)
            );
        }
    }

    #[test]
    fn return_value_requires_a_terminated_task() {
        let _kw = testutil::fresh_kernel();
        crate::arch::set_control(Control::SPSEL);

        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        unsafe {
            task_start(
                buf.base(),
                buf.len(),
                nop_entry,
                0,
                Priority::User2,
                "rv",
            )
            .unwrap();
        }

        assert_eq!(
            unsafe { task_return_value(buf.base()) },
            Err(Code::InvalidState)
        );
        assert_eq!(
            unsafe { task_return_value(core::ptr::null()) },
            Err(Code::InvalidParams)
        );

        // A buffer that never went through task start: its sentinel word
        // is still zero, which gives it away.
        let mut junk =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let r = unsafe {
            junk.base().cast::<TaskControl>().write(TaskControl::new(
                junk.len(),
                "junk",
                TaskType::Generic,
                Priority::User0,
            ));
            task_return_value(junk.base())
        };
        assert_eq!(r, Err(Code::InvalidBuffer));
    }
}
