// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! The supervisor-call stub hands every call to `dispatch`: a number and
//! a pointer to a call-specific parameter record on the caller's stack.
//! Each implementation has the shape
//!
//! ```ignore
//! fn syscall(k: &mut Kernel, args: *mut Args) -> Result<Code, Code>;
//! ```
//!
//! where `Ok` carries the synchronous outcome (`Success`, or `Waiting`
//! when the final result will be delivered through the caller's task
//! state) and `Err` carries a refusal. The dispatcher flattens the two
//! into the single code that travels back in r0; nothing here unwinds.
//!
//! Blocking works by construction: a call that suspends its caller
//! records the wait on the task, requests a scheduler run, and returns
//! `Waiting`. The pendable service exception fires as soon as the SVC
//! returns, parks the task, and the deferred result is sitting in the
//! task record by the time it next runs.

use core::ptr::NonNull;

use tarn_abi::{
    Code, Priority, RunMode, SignalKind, Sysnum, TaskEntry, TaskState,
    TaskType, WAIT_FOREVER,
};

use crate::driver::{self, StorageAccess};
use crate::mutex::Mutex;
use crate::sched;
use crate::semaphore::Semaphore;
use crate::startup::{self, Kernel};
use crate::task::{SigAction, TaskControl};
use crate::time::{self, Ticks};

/// Parameter record for starting a task.
pub struct TaskLaunch {
    pub buffer: *mut u8,
    pub buffer_size: usize,
    pub entry: TaskEntry,
    pub param: usize,
    pub priority: Priority,
    pub description: &'static str,
    pub task_type: TaskType,
    /// Job-queue depth for storage driver tasks; ignored otherwise.
    pub storage_jobs: usize,
}

/// Parameter record for the signal wait.
pub struct WaitForSignal {
    pub kind: SignalKind,
    pub object: *mut (),
    /// Ticks until the wait gives up; 0 polls, `WAIT_FOREVER` never
    /// expires.
    pub timeout: u64,
}

/// Parameter record for an absolute-base delay.
pub struct DelayFrom {
    pub ticks: u64,
    pub from: Ticks,
}

/// Parameter record for terminating a task. A null `task` terminates the
/// caller.
pub struct TerminateTask {
    pub task: *mut TaskControl,
    pub ret_value: u32,
}

/// Entry point shared by the SVC stub and the hosted harness.
pub(crate) fn dispatch(nr: u32, arg: *mut ()) -> Code {
    let result = startup::with_kernel(|k| {
        let Ok(nr) = Sysnum::try_from(nr) else {
            return Code::InvalidParams;
        };
        let r = match nr {
            Sysnum::BootEnded => boot_ended(k),
            Sysnum::TaskStart => task_start(k, arg.cast()),
            Sysnum::Yield => task_yield(),
            Sysnum::WaitForSignal => wait_for_signal(k, arg.cast()),
            Sysnum::DelayFrom => delay_from(k, arg.cast()),
            Sysnum::PeriodicDelay => periodic_delay(k, arg.cast()),
            Sysnum::StorageAccess => storage_access(k, arg.cast()),
            Sysnum::TaskTerminate => task_terminate(k, arg.cast()),
            Sysnum::Shutdown => shutdown(k),
        };
        r.unwrap_or_else(|code| code)
    });
    result.unwrap_or(Code::NotInitialized)
}

/// Validates a launch record and builds the task in its buffer: zero,
/// control record, sentinel, driver region, context image, ready queue.
/// Shared between the TaskStart syscall and the kernel's own bookend
/// tasks.
pub(crate) fn launch_task(
    k: &mut Kernel,
    launch: &TaskLaunch,
) -> Result<(), Code> {
    if launch.buffer.is_null() || launch.description.is_empty() {
        return Err(Code::InvalidParams);
    }
    if launch.buffer as usize & 0b111 != 0 {
        return Err(Code::InvalidBufferAlignment);
    }
    let min = crate::api::task_min_buffer_size(
        launch.task_type,
        launch.storage_jobs,
    );
    if launch.buffer_size < min || launch.buffer_size & 0b11 != 0 {
        return Err(Code::InvalidBufferSize);
    }

    // Safety: the buffer was vouched for by the (privileged) caller and
    // passed the size/alignment checks; the kernel owns it from here.
    unsafe {
        core::ptr::write_bytes(launch.buffer, 0, launch.buffer_size);

        let task_ptr = launch.buffer.cast::<TaskControl>();
        task_ptr.write(TaskControl::new(
            launch.buffer_size,
            launch.description,
            launch.task_type,
            launch.priority,
        ));
        let task = &mut *task_ptr;
        task.write_sentinel();

        if launch.task_type.is_driver() {
            // May pin the priority and carve a private region out of the
            // stack.
            driver::driver_init(task, launch)?;
        }

        task.seed_stack(launch.entry, launch.param);

        let handle = NonNull::new_unchecked(task_ptr);
        k.ready[task.priority().index()]
            .push_tail(TaskControl::node(handle));
    }
    Ok(())
}

/// The idle task: scheduled when nothing else is ready, in whatever mode
/// its priority class dictates.
extern "C" fn idle_main(_arg: usize) -> u32 {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// The boot task has returned successfully: its storage is recycled into
/// the idle task and scheduling continues without a current task.
fn boot_ended(k: &mut Kernel) -> Result<Code, Code> {
    let handle = k.current_task.take().ok_or(Code::NoCurrentTask)?;

    let (buffer, buffer_size) = {
        let task = unsafe { handle.as_ref() };
        (handle.as_ptr().cast::<u8>(), task.size())
    };
    let launch = TaskLaunch {
        buffer,
        buffer_size,
        entry: idle_main,
        param: 0,
        priority: Priority::Idle,
        description: startup::IDLE_TASK_NAME,
        task_type: TaskType::Generic,
        storage_jobs: 0,
    };
    // The slot just hosted the boot task; failure to rebuild it as the
    // idle task means kernel state is corrupt.
    uassert!(launch_task(k, &launch).is_ok());

    sched::call_pending();
    Ok(Code::Success)
}

fn task_start(k: &mut Kernel, arg: *mut TaskLaunch) -> Result<Code, Code> {
    let launch = unsafe { arg.as_ref() }.ok_or(Code::InvalidParams)?;
    launch_task(k, launch)?;
    Ok(Code::Success)
}

fn task_yield() -> Result<Code, Code> {
    sched::call_pending();
    Ok(Code::Success)
}

// Signal actions. These run both at call time (on behalf of the caller)
// and inside the scheduler's waiting-queue sweep (on behalf of the
// waiting task), so they must stay callable from Handler mode and must
// take the acting task explicitly.

fn sig_semaphore_acquire(_who: NonNull<TaskControl>, obj: *mut ()) -> bool {
    let sem = unsafe { &*(obj as *const Semaphore) };
    sem.acquire()
}

fn sig_semaphore_release(_who: NonNull<TaskControl>, obj: *mut ()) -> bool {
    let sem = unsafe { &*(obj as *const Semaphore) };
    sem.release()
}

fn sig_mutex_lock(who: NonNull<TaskControl>, obj: *mut ()) -> bool {
    let mutex = unsafe { &mut *(obj as *mut Mutex) };
    mutex.lock(who).is_ok()
}

fn sig_mutex_unlock(who: NonNull<TaskControl>, obj: *mut ()) -> bool {
    let mutex = unsafe { &mut *(obj as *mut Mutex) };
    mutex.unlock(who).is_ok()
}

fn wait_for_signal(
    k: &mut Kernel,
    arg: *mut WaitForSignal,
) -> Result<Code, Code> {
    let current = k.current_task.ok_or(Code::NoCurrentTask)?;
    let p = unsafe { arg.as_mut() }.ok_or(Code::InvalidParams)?;
    if p.object.is_null() {
        return Err(Code::InvalidParams);
    }

    let action: SigAction = match p.kind {
        SignalKind::SemaphoreAcquire => sig_semaphore_acquire,
        SignalKind::SemaphoreRelease => sig_semaphore_release,
        SignalKind::MutexLock => sig_mutex_lock,
        SignalKind::MutexUnlock => sig_mutex_unlock,
    };

    wait_for_signal_inner(current, action, p.object, p.timeout)
}

/// The generalized wait: try once; report immediately on success or a
/// zero timeout; otherwise arm the task's wait record and let the
/// scheduler retry until the deadline.
pub(crate) fn wait_for_signal_inner(
    task: NonNull<TaskControl>,
    action: SigAction,
    object: *mut (),
    timeout: u64,
) -> Result<Code, Code> {
    if action(task, object) {
        return Ok(Code::Success);
    }
    if timeout == 0 {
        return Ok(Code::Timeout);
    }

    // Safety: `task` is the current task (or a sleeper being armed by
    // the current task's syscall); nobody else holds a reference.
    let t = unsafe { &mut *task.as_ptr() };
    t.set_sig_wait(action, object);
    t.set_suspended_until(time::now().saturating_add(timeout));
    sched::call_pending();

    Ok(Code::Waiting)
}

/// Puts `task` to sleep: takes its sleep semaphore and waits forever for
/// it to come back. Release by anyone else is the wakeup.
pub(crate) fn task_sleep(
    task: NonNull<TaskControl>,
) -> Result<Code, Code> {
    let t = unsafe { task.as_ref() };
    if t.is_asleep() {
        return Ok(Code::Success);
    }

    // Bounded retry: the tick interrupt can break an exclusive pair.
    let mut acquired = false;
    for _ in 0..8 {
        if t.sleep_sem().acquire() {
            acquired = true;
            break;
        }
    }
    uassert!(acquired);

    wait_for_signal_inner(
        task,
        sig_semaphore_acquire,
        t.sleep_sem() as *const Semaphore as *mut (),
        WAIT_FOREVER,
    )
}

/// Wakes a sleeping task by releasing its sleep semaphore; the pending
/// acquisition succeeds on the next scheduler pass. Waking an awake task
/// is a no-op success.
pub(crate) fn task_wakeup(
    k: &Kernel,
    task: NonNull<TaskControl>,
) -> Result<Code, Code> {
    // A sleeping task is inactive, so it cannot be the one running this
    // code; that would be a bug.
    if k.current_task == Some(task) {
        return Err(Code::AssertionFailed);
    }

    let t = unsafe { task.as_ref() };
    if t.is_asleep() {
        let mut released = false;
        for _ in 0..8 {
            if t.sleep_sem().release() {
                released = true;
                break;
            }
        }
        if !released {
            return Err(Code::Error);
        }
        sched::call_pending();
    }
    Ok(Code::Success)
}

fn delay_from(k: &mut Kernel, arg: *mut DelayFrom) -> Result<Code, Code> {
    let current = k.current_task.ok_or(Code::NoCurrentTask)?;
    let p = unsafe { arg.as_ref() }.ok_or(Code::InvalidParams)?;

    let t = unsafe { &mut *current.as_ptr() };
    t.set_suspended_until(p.from.saturating_add(p.ticks));
    sched::call_pending();
    Ok(Code::Success)
}

fn periodic_delay(k: &mut Kernel, arg: *mut u64) -> Result<Code, Code> {
    let current = k.current_task.ok_or(Code::NoCurrentTask)?;
    let ticks = *unsafe { arg.as_ref() }.ok_or(Code::InvalidParams)?;

    let t = unsafe { &mut *current.as_ptr() };

    // Zero re-bases the cadence at the current tick; the next periodic
    // delay counts from here.
    if ticks == 0 {
        t.set_last_suspension(time::now());
        return Ok(Code::Success);
    }

    // Absolute cadence: the wake point depends only on the previous one,
    // not on when this call happened to run.
    t.set_suspended_until(t.last_suspension().saturating_add(ticks));
    sched::call_pending();
    Ok(Code::Success)
}

/// Finds a task by priority and description *identity* among the waiting
/// queue, the ready queue, and the current task.
fn find_task(
    k: &Kernel,
    priority: Priority,
    description: &'static str,
) -> Option<NonNull<TaskControl>> {
    let i = priority.index();
    for queue in [&k.waiting[i], &k.ready[i]] {
        let mut cursor = queue.head();
        while let Some(node) = cursor {
            cursor = unsafe { node.as_ref().next() };
            let task = unsafe { TaskControl::from_node(node) };
            let t = unsafe { task.as_ref() };
            if core::ptr::eq(
                t.description().as_ptr(),
                description.as_ptr(),
            ) {
                return Some(task);
            }
        }
    }

    if let Some(current) = k.current_task {
        let t = unsafe { current.as_ref() };
        if t.priority() == priority
            && core::ptr::eq(t.description().as_ptr(), description.as_ptr())
        {
            return Some(current);
        }
    }
    None
}

/// Routes a storage job to the named driver task: the caller goes to
/// sleep, the job lands in the driver's queue, the driver is woken. The
/// driver's `job_done` releases the caller again.
fn storage_access(
    k: &mut Kernel,
    arg: *mut StorageAccess,
) -> Result<Code, Code> {
    let current = k.current_task.ok_or(Code::NoCurrentTask)?;
    let sa = unsafe { arg.as_mut() }.ok_or(Code::InvalidParams)?;
    if sa.buf.is_null() || sa.count == 0 || sa.description.is_empty() {
        return Err(Code::InvalidParams);
    }

    let drv = find_task(k, Priority::DRIVER_STORAGE, sa.description)
        .ok_or(Code::NotInitialized)?;

    sa.result = Code::NotInitialized;
    sa.sem = unsafe { current.as_ref() }.sleep_sem() as *const Semaphore;

    // Sleep first: the driver may finish the job (and release the
    // semaphore) the moment it's woken.
    task_sleep(current)?;
    if let Err(e) = driver::storage_job_add_raw(drv, sa) {
        // The job never went in, so nobody would ever wake us: undo the
        // sleep before reporting.
        let t = unsafe { &mut *current.as_ptr() };
        t.cancel_sig_wait(e);
        let mut released = false;
        for _ in 0..8 {
            if t.sleep_sem().release() {
                released = true;
                break;
            }
        }
        uassert!(released);
        return Err(e);
    }
    task_wakeup(k, drv)?;

    Ok(Code::Waiting)
}

fn task_terminate(
    k: &mut Kernel,
    arg: *mut TerminateTask,
) -> Result<Code, Code> {
    let current = k.current_task.ok_or(Code::NoCurrentTask)?;
    let p = unsafe { arg.as_mut() }.ok_or(Code::InvalidParams)?;

    let target = match NonNull::new(p.task) {
        // Null target: the caller is terminating itself.
        None => {
            uassert_eq!(
                unsafe { current.as_ref() }.state(),
                TaskState::Running
            );
            current
        }
        Some(t) => {
            if unsafe { t.as_ref() }.state() == TaskState::Terminated {
                // Terminating the terminated is refused, not ignored, so
                // the caller learns its handle is stale.
                return Err(Code::InvalidState);
            }
            t
        }
    };

    let state = unsafe { target.as_ref() }.state();
    let i = unsafe { target.as_ref() }.priority().index();
    match state {
        TaskState::Running => {
            uassert_eq!(k.current_task, Some(target));
            k.current_task = None;
        }
        // Safety: queue membership follows task state by invariant.
        TaskState::Ready => unsafe {
            k.ready[i].detach(TaskControl::node(target));
        },
        TaskState::Waiting => unsafe {
            k.waiting[i].detach(TaskControl::node(target));
        },
        TaskState::Terminated => {
            uassert!(false);
            return Err(Code::InvalidState);
        }
    }

    unsafe {
        (*target.as_ptr()).set_terminated(p.ret_value, time::now());
    }

    if k.current_task.is_none() {
        // Self-termination: someone else must be chosen to run; the
        // caller's stack will never unwind out of this syscall.
        sched::call_pending();
    } else {
        uassert!(k.current_task != Some(target));
    }
    Ok(Code::Success)
}

/// Finite-mode kernel termination: stamps the end time; the next
/// scheduler pass unwinds onto the pre-boot main stack.
fn shutdown(k: &mut Kernel) -> Result<Code, Code> {
    if k.run_mode != RunMode::Finite {
        return Err(Code::InvalidOperation);
    }
    k.terminated_at = Some(time::now());
    sched::call_pending();
    Ok(Code::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use core::ptr::null_mut;

    extern "C" fn nop_entry(_arg: usize) -> u32 {
        0
    }

    #[test]
    fn dispatch_without_kernel_reports_not_initialized() {
        let _world = testutil::fresh_world();
        assert_eq!(
            dispatch(Sysnum::Yield as u32, null_mut()),
            Code::NotInitialized
        );
    }

    #[test]
    fn dispatch_rejects_unknown_numbers() {
        let _kw = testutil::fresh_kernel();
        assert_eq!(dispatch(99, null_mut()), Code::InvalidParams);
    }

    #[test]
    fn launch_rejects_misaligned_buffers() {
        let _kw = testutil::fresh_kernel();
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER + 8);
        let misaligned = unsafe { buf.base().add(4) };

        let launch = TaskLaunch {
            buffer: misaligned,
            buffer_size: TaskControl::GENERIC_MIN_BUFFER,
            entry: nop_entry,
            param: 0,
            priority: Priority::User0,
            description: "misaligned",
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        let r = startup::with_kernel(|k| launch_task(k, &launch)).unwrap();
        assert_eq!(r, Err(Code::InvalidBufferAlignment));
    }

    #[test]
    fn launch_rejects_undersized_and_ragged_buffers() {
        let _kw = testutil::fresh_kernel();
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER + 16);

        let mut launch = TaskLaunch {
            buffer: buf.base(),
            buffer_size: TaskControl::GENERIC_MIN_BUFFER - 4,
            entry: nop_entry,
            param: 0,
            priority: Priority::User0,
            description: "small",
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        let r = startup::with_kernel(|k| launch_task(k, &launch)).unwrap();
        assert_eq!(r, Err(Code::InvalidBufferSize));

        // Right size class, but not a multiple of 4.
        launch.buffer_size = TaskControl::GENERIC_MIN_BUFFER + 2;
        let r = startup::with_kernel(|k| launch_task(k, &launch)).unwrap();
        assert_eq!(r, Err(Code::InvalidBufferSize));
    }

    #[test]
    fn launch_places_task_in_its_ready_queue() {
        let _kw = testutil::fresh_kernel();
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let launch = TaskLaunch {
            buffer: buf.base(),
            buffer_size: buf.len(),
            entry: nop_entry,
            param: 7,
            priority: Priority::User1,
            description: "queued",
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        startup::with_kernel(|k| launch_task(k, &launch))
            .unwrap()
            .unwrap();

        let task = TaskControl::from_buffer(buf.base()).unwrap();
        let t = unsafe { task.as_ref() };
        assert_eq!(t.state(), TaskState::Ready);
        assert_eq!(t.priority(), Priority::User1);
        assert!(t.sentinel_ok());

        startup::with_kernel(|k| {
            assert_eq!(k.ready[Priority::User1.index()].len(), 1);
            assert_eq!(
                k.ready[Priority::User1.index()].head(),
                Some(TaskControl::node(task))
            );
        })
        .unwrap();
    }

    #[test]
    fn wait_with_zero_timeout_never_suspends() {
        let _kw = testutil::fresh_kernel();
        let sem = Semaphore::new(1, 0);

        // Fabricate a current task for the call to act on.
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let launch = TaskLaunch {
            buffer: buf.base(),
            buffer_size: buf.len(),
            entry: nop_entry,
            param: 0,
            priority: Priority::User0,
            description: "waiter",
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        startup::with_kernel(|k| launch_task(k, &launch))
            .unwrap()
            .unwrap();
        let task = TaskControl::from_buffer(buf.base()).unwrap();
        startup::with_kernel(|k| {
            unsafe { k.ready[Priority::User0.index()].detach(TaskControl::node(task)) };
            unsafe { (*task.as_ptr()).set_state(TaskState::Running) };
            k.current_task = Some(task);
        })
        .unwrap();

        let mut p = WaitForSignal {
            kind: SignalKind::SemaphoreAcquire,
            object: &sem as *const Semaphore as *mut (),
            timeout: 0,
        };
        let code = dispatch(
            Sysnum::WaitForSignal as u32,
            (&mut p as *mut WaitForSignal).cast(),
        );
        assert_eq!(code, Code::Timeout);
        // No wait record was armed.
        assert_eq!(unsafe { task.as_ref() }.suspended_until(), None);

        // With a unit available the same call succeeds immediately.
        assert!(sem.release());
        let code = dispatch(
            Sysnum::WaitForSignal as u32,
            (&mut p as *mut WaitForSignal).cast(),
        );
        assert_eq!(code, Code::Success);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn periodic_delay_zero_rebases_the_cadence() {
        let _kw = testutil::fresh_kernel();

        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let launch = TaskLaunch {
            buffer: buf.base(),
            buffer_size: buf.len(),
            entry: nop_entry,
            param: 0,
            priority: Priority::Kernel1,
            description: "periodic",
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        startup::with_kernel(|k| launch_task(k, &launch))
            .unwrap()
            .unwrap();
        let task = TaskControl::from_buffer(buf.base()).unwrap();
        startup::with_kernel(|k| {
            unsafe {
                k.ready[Priority::Kernel1.index()]
                    .detach(TaskControl::node(task));
                (*task.as_ptr()).set_state(TaskState::Running);
            }
            k.current_task = Some(task);
        })
        .unwrap();

        crate::time::advance(123);

        // Zero resets the cadence base to "now" and does not suspend.
        let mut ticks = 0u64;
        let code = dispatch(
            Sysnum::PeriodicDelay as u32,
            (&mut ticks as *mut u64).cast(),
        );
        assert_eq!(code, Code::Success);
        let t = unsafe { task.as_ref() };
        assert_eq!(t.last_suspension(), Ticks::from(123));
        assert_eq!(t.suspended_until(), None);

        // The next period is measured from the cadence base, not from
        // whenever this call happens to run.
        crate::time::advance(7);
        let mut ticks = 50u64;
        let code = dispatch(
            Sysnum::PeriodicDelay as u32,
            (&mut ticks as *mut u64).cast(),
        );
        assert_eq!(code, Code::Success);
        assert_eq!(
            unsafe { task.as_ref() }.suspended_until(),
            Some(Ticks::from(173))
        );
    }

    #[test]
    fn sleep_and_wakeup_round_trip() {
        let _kw = testutil::fresh_kernel();
        let mut buf =
            testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let launch = TaskLaunch {
            buffer: buf.base(),
            buffer_size: buf.len(),
            entry: nop_entry,
            param: 0,
            priority: Priority::Kernel2,
            description: "sleeper",
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        startup::with_kernel(|k| launch_task(k, &launch))
            .unwrap()
            .unwrap();
        let task = TaskControl::from_buffer(buf.base()).unwrap();

        assert!(!unsafe { task.as_ref() }.is_asleep());
        assert_eq!(task_sleep(task), Ok(Code::Waiting));
        assert!(unsafe { task.as_ref() }.is_asleep());
        // Sleeping a sleeper is a no-op.
        assert_eq!(task_sleep(task), Ok(Code::Success));

        let r = startup::with_kernel(|k| task_wakeup(k, task)).unwrap();
        assert_eq!(r, Ok(Code::Success));
        // The pending acquisition resolves on the next scheduler pass;
        // the semaphore is available until then.
        assert!(!unsafe { task.as_ref() }.is_asleep());
    }
}
