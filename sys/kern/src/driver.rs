// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-resident driver task template, generalized for storage-like
//! devices.
//!
//! A driver task is an ordinary task pinned to a reserved kernel
//! priority, whose buffer is grown past the generic minimum to host a
//! private job region: a descriptor record plus an in-place array of job
//! slots, carved from the top of the stack (below the sentinel word).
//! Clients never talk to the driver task directly; the storage-access
//! syscall parks the client on its sleep semaphore, queues the job here,
//! and wakes the driver. The driver's run loop alternates between
//! sleeping and draining this queue, completing each job with
//! [`storage_job_done`], which releases the client again.
//!
//! Job slots hold only a pointer to the client's access record, which
//! lives on the client's stack. That is sound for the same reason it is
//! in the syscall layer: the client is asleep for the whole life of the
//! job.

use core::ptr::NonNull;

use tarn_abi::{Code, DriverOp, Priority, TaskType};

use crate::list::{List, Node};
use crate::sched;
use crate::semaphore::Semaphore;
use crate::syscalls::TaskLaunch;
use crate::task::TaskControl;

/// A storage access descriptor: syscall parameter record and job
/// descriptor in one. Lives on the client's stack; the kernel fills in
/// `sem` and the driver fills in `processed` and `result`.
pub struct StorageAccess {
    /// Names the driver task; compared by pointer identity.
    pub description: &'static str,
    pub op: DriverOp,
    pub buf: *mut u8,
    pub sector: u32,
    pub count: u32,
    /// Sectors actually transferred, filled by the driver.
    pub processed: u32,
    /// The client's sleep semaphore, released on completion.
    pub(crate) sem: *const Semaphore,
    /// Final outcome, valid once the client resumes.
    pub result: Code,
}

impl StorageAccess {
    pub fn new(
        description: &'static str,
        op: DriverOp,
        buf: *mut u8,
        sector: u32,
        count: u32,
    ) -> Self {
        StorageAccess {
            description,
            op,
            buf,
            sector,
            count,
            processed: 0,
            sem: core::ptr::null(),
            result: Code::NotInitialized,
        }
    }
}

/// One job slot. `access` is null while the slot is free.
#[repr(C)]
struct StorageJob {
    node: Node,
    access: *mut StorageAccess,
}

/// Driver-private descriptor at the start of the reserved region.
#[repr(C)]
struct StorageData {
    /// Jobs queued and not yet taken.
    queue: List,
    max_jobs: usize,
    first_job: *mut StorageJob,
    /// Next slot to hand out. Slots recycle in FIFO order, so a single
    /// wrapping cursor suffices.
    next_free: *mut StorageJob,
    /// The job most recently taken, while the driver works on it.
    pending: *mut StorageAccess,
    jobs_succeeded: u32,
    jobs_failed: u32,
    sectors_read: u32,
    sectors_written: u32,
}

/// Snapshot of a driver's lifetime counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StorageStats {
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
    pub sectors_read: u32,
    pub sectors_written: u32,
}

/// Bytes a storage driver's buffer needs beyond the generic minimum for
/// a queue of `jobs` slots. Includes slack for re-aligning the stack top.
pub const fn storage_region_size(jobs: usize) -> usize {
    let raw = core::mem::size_of::<StorageData>()
        + jobs * core::mem::size_of::<StorageJob>();
    ((raw + 7) & !7) + 8
}

/// Type dispatch for driver-task setup, called from task launch after
/// the control record exists but before the stack image is laid down.
pub(crate) fn driver_init(
    task: &mut TaskControl,
    launch: &TaskLaunch,
) -> Result<(), Code> {
    match launch.task_type {
        TaskType::DriverStorage => storage_init(task, launch.storage_jobs),
        TaskType::DriverUart => {
            // No private region yet; the reserved priority is the whole
            // of the template for now.
            task.set_priority(Priority::DRIVER_UART);
            Ok(())
        }
        TaskType::Generic => {
            uassert!(false);
            Err(Code::AssertionFailed)
        }
    }
}

/// Carves the job region out of the top of the task's stack and builds
/// the descriptor and slot array in it.
fn storage_init(task: &mut TaskControl, jobs: usize) -> Result<(), Code> {
    if jobs == 0 {
        return Err(Code::InvalidParams);
    }

    // The requested priority is ignored: storage drivers run at their
    // reserved kernel level.
    task.set_priority(Priority::DRIVER_STORAGE);

    let raw = core::mem::size_of::<StorageData>()
        + jobs * core::mem::size_of::<StorageJob>();
    // New stack top: below the region, re-aligned for the descriptor.
    let top = (task.stack_top() - raw) & !7;
    task.set_stack_top(top);

    let base = task as *mut TaskControl as *mut u8;
    // Safety: the buffer was size-checked against
    // `storage_region_size(jobs)` on top of the generic minimum, so
    // [top, top + raw) lies inside it, below the sentinel. The buffer
    // was zeroed at launch, so all job slots start free.
    unsafe {
        let data = base.add(top).cast::<StorageData>();
        let first_job = base
            .add(top + core::mem::size_of::<StorageData>())
            .cast::<StorageJob>();
        data.write(StorageData {
            queue: List::new(),
            max_jobs: jobs,
            first_job,
            next_free: first_job,
            pending: core::ptr::null_mut(),
            jobs_succeeded: 0,
            jobs_failed: 0,
            sectors_read: 0,
            sectors_written: 0,
        });
    }
    Ok(())
}

/// The driver descriptor sits exactly at the (shrunken) stack top.
///
/// # Safety
///
/// `task` must be a live storage driver task.
unsafe fn storage_data<'a>(task: NonNull<TaskControl>) -> &'a mut StorageData {
    let t = task.as_ref();
    uassert_eq!(t.task_type(), TaskType::DriverStorage);
    let base = task.as_ptr() as *mut u8;
    &mut *base.add(t.stack_top()).cast::<StorageData>()
}

/// Queues a job for the driver. `BufferFull` when all slots are in use.
pub(crate) fn storage_job_add_raw(
    task: NonNull<TaskControl>,
    access: *mut StorageAccess,
) -> Result<(), Code> {
    // Safety: caller vouches for the task; clients reach this only
    // through the storage-access syscall, which looked the driver up.
    let data = unsafe { storage_data(task) };

    if data.queue.len() >= data.max_jobs {
        return Err(Code::BufferFull);
    }

    let job = data.next_free;
    // With the queue below capacity the cursor's slot must be free.
    uassert!(unsafe { (*job).access.is_null() });

    // Advance the cursor, wrapping past the last slot. Correct because
    // jobs are taken in the same FIFO order they were added.
    let end = unsafe { data.first_job.add(data.max_jobs) };
    let next = unsafe { job.add(1) };
    data.next_free = if next == end { data.first_job } else { next };

    unsafe {
        (*job).access = access;
        data.queue
            .push_tail(NonNull::new_unchecked(job.cast::<Node>()));
    }
    Ok(())
}

/// Takes the oldest queued job, for the driver task's run loop.
/// `Empty` when there is nothing to do (time to sleep again).
///
/// # Safety
///
/// `task` must be the caller's own live storage driver task.
pub unsafe fn storage_job_take(
    task: NonNull<TaskControl>,
) -> Result<NonNull<StorageAccess>, Code> {
    let data = storage_data(task);

    let Some(node) = data.queue.head() else {
        uassert_eq!(data.queue.len(), 0);
        return Err(Code::Empty);
    };
    data.queue.detach(node);

    let job = node.as_ptr().cast::<StorageJob>();
    let access = (*job).access;
    uassert!(!access.is_null());
    data.pending = access;
    // Slot recycles.
    (*job).access = core::ptr::null_mut();

    Ok(NonNull::new_unchecked(access))
}

/// Completes a job: records the outcome and statistics, releases the
/// client's sleep semaphore, and requests a scheduler run so the client
/// resumes.
///
/// # Safety
///
/// `task` must be the caller's own live storage driver task; `access`
/// must be a descriptor previously returned by [`storage_job_take`].
pub unsafe fn storage_job_done(
    task: NonNull<TaskControl>,
    mut access: NonNull<StorageAccess>,
    result: Code,
) -> Result<(), Code> {
    let data = storage_data(task);
    let sa = access.as_mut();

    sa.result = result;
    if result.is_success() {
        data.jobs_succeeded += 1;
    } else {
        data.jobs_failed += 1;
    }
    match sa.op {
        DriverOp::Read => data.sectors_read += sa.count,
        DriverOp::Write => data.sectors_written += sa.count,
    }
    if data.pending == access.as_ptr() {
        data.pending = core::ptr::null_mut();
    }

    let sem = sa.sem.as_ref().ok_or(Code::InvalidParams)?;
    // Bounded retry: the tick interrupt can break an exclusive pair.
    let mut released = false;
    for _ in 0..8 {
        if sem.release() {
            released = true;
            break;
        }
    }
    uassert!(released);

    sched::call_pending();
    Ok(())
}

/// Reads a driver's lifetime counters.
///
/// # Safety
///
/// `task` must be a live storage driver task.
pub unsafe fn storage_stats(task: NonNull<TaskControl>) -> StorageStats {
    let data = storage_data(task);
    StorageStats {
        jobs_succeeded: data.jobs_succeeded,
        jobs_failed: data.jobs_failed,
        sectors_read: data.sectors_read,
        sectors_written: data.sectors_written,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tarn_abi::TaskState;

    extern "C" fn nop_entry(_arg: usize) -> u32 {
        0
    }

    const JOBS: usize = 3;

    fn driver_buffer_size() -> usize {
        TaskControl::GENERIC_MIN_BUFFER + storage_region_size(JOBS)
    }

    fn start_driver(buf: &mut testutil::TaskBuffer) -> NonNull<TaskControl> {
        let launch = TaskLaunch {
            buffer: buf.base(),
            buffer_size: buf.len(),
            entry: nop_entry,
            param: 0,
            // Deliberately wrong: driver init must pin the real level.
            priority: Priority::Idle,
            description: "sd0",
            task_type: TaskType::DriverStorage,
            storage_jobs: JOBS,
        };
        crate::startup::with_kernel(|k| {
            crate::syscalls::launch_task(k, &launch)
        })
        .unwrap()
        .unwrap();
        TaskControl::from_buffer(buf.base()).unwrap()
    }

    #[test]
    fn driver_task_gets_reserved_priority_and_shrunken_stack() {
        let _kw = testutil::fresh_kernel();
        let mut buf = testutil::TaskBuffer::new(driver_buffer_size());
        let drv = start_driver(&mut buf);
        let t = unsafe { drv.as_ref() };

        assert_eq!(t.priority(), Priority::DRIVER_STORAGE);
        assert_eq!(t.state(), TaskState::Ready);
        assert!(t.sentinel_ok());
        // The stack top moved down to make room for the job region, and
        // stayed 8-aligned.
        assert!(t.stack_top() < t.size() - 4);
        assert_eq!(t.stack_top() & 7, 0);
    }

    #[test]
    fn jobs_flow_fifo_through_the_queue() {
        let _kw = testutil::fresh_kernel();
        let mut buf = testutil::TaskBuffer::new(driver_buffer_size());
        let drv = start_driver(&mut buf);

        let sem = Semaphore::new(1, 0);
        let mut a = StorageAccess::new("sd0", DriverOp::Read, 0x10 as *mut u8, 0, 1);
        let mut b = StorageAccess::new("sd0", DriverOp::Write, 0x20 as *mut u8, 5, 2);
        a.sem = &sem;
        b.sem = &sem;

        storage_job_add_raw(drv, &mut a).unwrap();
        storage_job_add_raw(drv, &mut b).unwrap();

        let first = unsafe { storage_job_take(drv) }.unwrap();
        assert!(core::ptr::eq(first.as_ptr(), &a));
        let second = unsafe { storage_job_take(drv) }.unwrap();
        assert!(core::ptr::eq(second.as_ptr(), &b));
        assert_eq!(unsafe { storage_job_take(drv) }, Err(Code::Empty));
    }

    #[test]
    fn queue_capacity_is_enforced_and_slots_recycle() {
        let _kw = testutil::fresh_kernel();
        let mut buf = testutil::TaskBuffer::new(driver_buffer_size());
        let drv = start_driver(&mut buf);

        let sem = Semaphore::new(1, 0);
        let mut jobs: Vec<StorageAccess> = (0..JOBS + 1)
            .map(|i| {
                let mut sa = StorageAccess::new(
                    "sd0",
                    DriverOp::Read,
                    0x10 as *mut u8,
                    i as u32,
                    1,
                );
                sa.sem = &sem;
                sa
            })
            .collect();

        for sa in jobs.iter_mut().take(JOBS) {
            storage_job_add_raw(drv, sa).unwrap();
        }
        let (last, rest) = jobs.split_last_mut().unwrap();
        assert_eq!(storage_job_add_raw(drv, last), Err(Code::BufferFull));

        // Drain one; the freed slot (and the wrapped cursor) admit the
        // straggler.
        let taken = unsafe { storage_job_take(drv) }.unwrap();
        assert!(core::ptr::eq(taken.as_ptr(), &rest[0]));
        storage_job_add_raw(drv, last).unwrap();
    }

    #[test]
    fn job_done_records_stats_and_wakes_the_client() {
        let _kw = testutil::fresh_kernel();
        let mut buf = testutil::TaskBuffer::new(driver_buffer_size());
        let drv = start_driver(&mut buf);

        // The "client": a semaphore standing in for its sleep semaphore,
        // already taken (the client is asleep).
        let sleep = Semaphore::new(1, 0);
        let mut sa =
            StorageAccess::new("sd0", DriverOp::Write, 0x40 as *mut u8, 9, 4);
        sa.sem = &sleep;

        storage_job_add_raw(drv, &mut sa).unwrap();
        let taken = unsafe { storage_job_take(drv) }.unwrap();
        unsafe {
            storage_job_done(drv, taken, Code::Success).unwrap();
        }

        assert_eq!(sa.result, Code::Success);
        // The client's sleep semaphore came back.
        assert_eq!(sleep.available(), 1);
        // And a scheduler run is on the books.
        assert!(crate::arch::take_pending_switch());

        let stats = unsafe { storage_stats(drv) };
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_failed, 0);
        assert_eq!(stats.sectors_written, 4);
        assert_eq!(stats.sectors_read, 0);
    }
}
