// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel singleton and its lifecycle: install, boot, shut down.
//!
//! The kernel state block lives in a caller-supplied buffer and is
//! reached through a single process-wide pointer, `KERNEL`. All mutation
//! happens in Handler mode (supervisor call or the pendable service
//! exception) or before scheduling starts, so `with_kernel` handing out
//! `&mut` is sound on the single core this kernel targets; the tick
//! barrier keeps the one higher-priority interrupt from re-entering
//! scheduler-critical regions.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use tarn_abi::{Code, Priority, RunMode, TaskEntry, TaskType};

use crate::arch;
use crate::list::List;
use crate::sched;
use crate::syscalls::{self, TaskLaunch};
use crate::task::TaskControl;
use crate::time::{self, Ticks};
use crate::usage::{CpuUsage, UsageWindow};

pub(crate) const BOOT_TASK_NAME: &str = "boot";
pub(crate) const IDLE_TASK_NAME: &str = "idle";

/// Storage recycled across the kernel's two bookend tasks: boots the
/// system as the boot task, then hosts the idle task forever after.
#[repr(C, align(8))]
pub(crate) struct BootIdleSlot(pub [u8; TaskControl::GENERIC_MIN_BUFFER]);

/// The kernel state block.
#[repr(C, align(8))]
pub(crate) struct Kernel {
    /// Tick of the first scheduler pass.
    pub(crate) started_at: Option<Ticks>,
    /// Set by a Finite-mode terminate; makes the next scheduler pass the
    /// last one.
    pub(crate) terminated_at: Option<Ticks>,
    pub(crate) run_mode: RunMode,
    /// Cycles spent inside the scheduler, cumulatively.
    pub(crate) run_cycles: u64,
    pub(crate) usage: UsageWindow,
    pub(crate) usage_cpu: CpuUsage,
    /// The only Running task. Never linked into a queue.
    pub(crate) current_task: Option<NonNull<TaskControl>>,
    /// Tasks in Ready state, by priority.
    pub(crate) ready: [List; Priority::COUNT],
    /// Tasks in Waiting state, by priority.
    pub(crate) waiting: [List; Priority::COUNT],
    boot_idle: BootIdleSlot,
}

impl Kernel {
    fn new() -> Self {
        const EMPTY: List = List::new();
        Kernel {
            started_at: None,
            terminated_at: None,
            run_mode: RunMode::Undefined,
            run_cycles: 0,
            usage: UsageWindow::new(),
            usage_cpu: CpuUsage::new(),
            current_task: None,
            ready: [EMPTY; Priority::COUNT],
            waiting: [EMPTY; Priority::COUNT],
            boot_idle: BootIdleSlot([0; TaskControl::GENERIC_MIN_BUFFER]),
        }
    }

    /// The boot/idle buffer, as raw task-start material.
    fn boot_slot(&mut self) -> (*mut u8, usize) {
        (
            self.boot_idle.0.as_mut_ptr(),
            self.boot_idle.0.len(),
        )
    }
}

static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Runs `body` against the installed kernel, or reports
/// `NotInitialized`.
pub(crate) fn with_kernel<R>(
    body: impl FnOnce(&mut Kernel) -> R,
) -> Result<R, Code> {
    let p = KERNEL.load(Ordering::Relaxed);
    if p.is_null() {
        return Err(Code::NotInitialized);
    }
    // Safety: single core, and every caller runs either in Handler mode
    // or before scheduling begins, so the access is exclusive. See the
    // module docs.
    Ok(body(unsafe { &mut *p }))
}

pub(crate) fn installed() -> bool {
    !KERNEL.load(Ordering::Relaxed).is_null()
}

/// Byte size a kernel buffer must have.
pub fn buffer_size() -> usize {
    core::mem::size_of::<Kernel>()
}

/// Installs the kernel into `buffer` and prepares the machine: exception
/// priorities, cycle counter.
///
/// # Safety
///
/// `buffer` must be at least `buffer_size()` bytes, writable, and owned
/// by the kernel from here on.
pub(crate) unsafe fn init(buffer: *mut u8) -> Result<(), Code> {
    if installed() {
        return Err(Code::AlreadyInitialized);
    }
    if buffer.is_null() {
        return Err(Code::InvalidParams);
    }
    if buffer as usize & 0b111 != 0 {
        return Err(Code::InvalidBufferAlignment);
    }

    arch::setup_exception_priorities();
    arch::enable_cycle_counter();

    let kernel = buffer.cast::<Kernel>();
    kernel.write(Kernel::new());
    KERNEL.store(kernel, Ordering::Relaxed);

    klog!("tarn: kernel installed");
    Ok(())
}

/// Registers the boot task in the boot/idle slot and arms the first
/// scheduler pass. On return (success), the pendable service exception is
/// pending and takes over as soon as the caller's Thread-mode context
/// allows.
pub(crate) fn syscall_boot(
    mode: RunMode,
    entry: TaskEntry,
    param: usize,
) -> Result<(), Code> {
    if mode == RunMode::Undefined {
        return Err(Code::InvalidParams);
    }

    with_kernel(|k| {
        if k.run_mode != RunMode::Undefined {
            return Err(Code::InvalidOperation);
        }
        k.run_mode = mode;

        let (buffer, buffer_size) = k.boot_slot();
        let launch = TaskLaunch {
            buffer,
            buffer_size,
            entry,
            param,
            priority: Priority::Boot,
            description: BOOT_TASK_NAME,
            task_type: TaskType::Generic,
            storage_jobs: 0,
        };
        syscalls::launch_task(k, &launch)?;

        // The tick must not invoke the scheduler before the first switch
        // is set up.
        sched::barrier_activate();

        // PSP == 0 tells the first switch that the outgoing context is
        // the kernel's own, on the main stack.
        arch::set_psp(0);

        time::set_hook(Some(sched::tick_callback));
        sched::call_pending();

        klog!("tarn: scheduling");
        Ok(())
    })?
}

/// Tears the kernel down after a Finite-mode termination has unwound
/// scheduling: uninstalls the tick hook and clears the singleton.
pub(crate) fn syscall_shutdown() -> Result<(), Code> {
    with_kernel(|k| {
        if k.run_mode != RunMode::Finite {
            return Err(Code::InvalidOperation);
        }
        Ok(())
    })??;

    sched::barrier_activate();
    time::set_hook(None);
    KERNEL.store(core::ptr::null_mut(), Ordering::Relaxed);
    sched::barrier_clear();

    klog!("tarn: shut down");
    Ok(())
}

/// Test hook: forget any installed kernel.
#[cfg(not(target_os = "none"))]
pub fn reset_for_test() {
    KERNEL.store(core::ptr::null_mut(), Ordering::Relaxed);
}
