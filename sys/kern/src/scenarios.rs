// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scheduling scenarios, driven through the hosted machine.
//!
//! The test plays the hardware: it advances the tick, fires the
//! "pendable service exception" whenever a switch is pending, and acts
//! out each dispatched task's body (start tasks, delay, lock, terminate)
//! from the scheduler's answers. Everything below the closure -- queues,
//! state machine, signal retries, accounting -- is the real kernel.

use core::ptr::{null_mut, NonNull};

use tarn_abi::{
    Code, DriverOp, Priority, RunMode, SignalKind, Sysnum, TaskState,
    TaskType,
};

use crate::api;
use crate::arch;
use crate::driver::{self, StorageAccess};
use crate::mutex::Mutex;
use crate::sched;
use crate::startup;
use crate::syscalls::{self, TerminateTask, WaitForSignal};
use crate::task::TaskControl;
use crate::testutil::{self, TaskBuffer};
use crate::time;

extern "C" fn nop_entry(_arg: usize) -> u32 {
    0
}

fn desc(task: NonNull<TaskControl>) -> &'static str {
    unsafe { task.as_ref() }.description()
}

/// Stands in for the hardware around the scheduler: the preempted stack
/// pointer, and the fact that PendSV fires while pended.
struct Machine {
    sp: usize,
    terminated: bool,
}

impl Machine {
    /// Boots the kernel the way `start`/`forever` would, leaving the
    /// first switch pending.
    fn boot(mode: RunMode) -> Self {
        startup::syscall_boot(mode, nop_entry, 0).unwrap();
        // Boot plants the first-switch sentinel and pends the switch.
        assert_eq!(arch::psp(), 0);
        assert!(arch::take_pending_switch());
        Machine {
            sp: 0,
            terminated: false,
        }
    }

    /// One scheduler pass, as the pendable service exception would run
    /// it. `None` means the kernel unwound to the main stack.
    fn switch(&mut self) -> Option<NonNull<TaskControl>> {
        assert!(!self.terminated);
        self.sp = sched::schedule(self.sp);
        if self.sp == 0 {
            self.terminated = true;
            return None;
        }
        let current = api::task_self();
        assert!(current.is_some());
        current
    }

    /// Services pending switches until none remain, acting out each
    /// dispatched task with `body`. Returns false if the kernel
    /// terminated instead.
    fn run_pending(
        &mut self,
        body: &mut dyn FnMut(NonNull<TaskControl>),
    ) -> bool {
        while arch::take_pending_switch() {
            match self.switch() {
                None => return false,
                Some(task) => body(task),
            }
        }
        true
    }

    /// One tick of the world: timer interrupt, then any switches it (or
    /// the acted-out tasks) asked for.
    fn tick(&mut self, body: &mut dyn FnMut(NonNull<TaskControl>)) -> bool {
        time::advance(1);
        self.run_pending(body)
    }
}

/// Checks the reachable-state invariants: queue membership matches task
/// state and priority, sentinels are intact, the current task is the
/// only Running one.
fn check_invariants() {
    startup::with_kernel(|k| {
        if let Some(current) = k.current_task {
            let t = unsafe { current.as_ref() };
            assert_eq!(t.state(), TaskState::Running);
            assert!(t.sentinel_ok());
        }
        for priority in Priority::ALL {
            let i = priority.index();
            for (queue, want) in [
                (&k.ready[i], TaskState::Ready),
                (&k.waiting[i], TaskState::Waiting),
            ] {
                let mut cursor = queue.head();
                while let Some(node) = cursor {
                    cursor = unsafe { node.as_ref().next() };
                    let task = unsafe { TaskControl::from_node(node) };
                    let t = unsafe { task.as_ref() };
                    assert_eq!(t.state(), want);
                    assert_eq!(t.priority(), priority);
                    assert!(t.sentinel_ok());
                    assert_ne!(Some(task), k.current_task);
                }
            }
        }
    })
    .unwrap();
}

#[test]
fn two_periodic_tasks_hold_their_cadence() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);

    let boot_task = machine.switch().unwrap();
    assert_eq!(desc(boot_task), "boot");
    assert!(arch::control().in_privileged_task());

    let mut b1 = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    let mut b2 = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_start(b1.base(), b1.len(), nop_entry, 0, Priority::Kernel1, "t1")
            .unwrap();
        api::task_start(b2.base(), b2.len(), nop_entry, 0, Priority::Kernel1, "t2")
            .unwrap();
    }

    // The boot task returns zero; its trampoline hands the slot back and
    // the kernel recycles it into the idle task.
    arch::syscall(Sysnum::BootEnded, null_mut());

    let t1_wakes = core::cell::Cell::new(0u32);
    let t2_wakes = core::cell::Cell::new(0u32);
    let mut body = |task: NonNull<TaskControl>| match desc(task) {
        "t1" => {
            t1_wakes.set(t1_wakes.get() + 1);
            api::task_periodic_delay(500).unwrap();
        }
        "t2" => {
            t2_wakes.set(t2_wakes.get() + 1);
            api::task_periodic_delay(1000).unwrap();
        }
        _ => {}
    };

    assert!(machine.run_pending(&mut body));
    // Cold start: both ran once at tick zero.
    assert_eq!((t1_wakes.get(), t2_wakes.get()), (1, 1));
    t1_wakes.set(0);
    t2_wakes.set(0);

    for _ in 0..10_000 {
        assert!(machine.tick(&mut body));
    }
    check_invariants();

    // 500- and 1000-tick cadences across 10000 ticks, within a tick of
    // ideal: no drift accumulates, because each wake point is computed
    // from the previous one, not from when the task got scheduled.
    let (t1_wakes, t2_wakes) = (t1_wakes.get(), t2_wakes.get());
    assert!((19..=21).contains(&t1_wakes), "t1 woke {t1_wakes} times");
    assert!((9..=11).contains(&t2_wakes), "t2 woke {t2_wakes} times");

    // The idle slot really is the recycled boot slot.
    let idle = startup::with_kernel(|k| {
        k.ready[Priority::Idle.index()].head().is_some()
            || k.current_task
                .map(|t| unsafe { t.as_ref() }.priority() == Priority::Idle)
                .unwrap_or(false)
    })
    .unwrap();
    assert!(idle);
}

#[test]
fn tasks_terminate_and_leave_return_values() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    let mut b1 = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    let mut b2 = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_start(b1.base(), b1.len(), nop_entry, 0, Priority::Kernel1, "t1")
            .unwrap();
        api::task_start(b2.base(), b2.len(), nop_entry, 0, Priority::Kernel1, "t2")
            .unwrap();
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    let mut t1_wakes = 0u32;
    let mut t2_wakes = 0u32;
    let mut body = |task: NonNull<TaskControl>| match desc(task) {
        "t1" => {
            t1_wakes += 1;
            if t1_wakes > 20 {
                // Twenty periods done: terminate self, explicitly.
                unsafe { api::task_terminate(null_mut(), 0).unwrap() };
            } else {
                api::task_periodic_delay(500).unwrap();
            }
        }
        "t2" => {
            t2_wakes += 1;
            if t2_wakes > 2 {
                // The entry function "returns" 0xFFFFFFFF: this is what
                // the return trampoline issues on its behalf.
                let mut args = TerminateTask {
                    task: null_mut(),
                    ret_value: 0xFFFF_FFFF,
                };
                arch::syscall(
                    Sysnum::TaskTerminate,
                    (&mut args as *mut TerminateTask).cast(),
                );
            } else {
                api::task_periodic_delay(1000).unwrap();
            }
        }
        _ => {}
    };

    assert!(machine.run_pending(&mut body));
    for _ in 0..12_000 {
        assert!(machine.tick(&mut body));
    }
    check_invariants();

    // Both ran their full schedule and no further.
    assert_eq!(t1_wakes, 21);
    assert_eq!(t2_wakes, 3);

    unsafe {
        assert_eq!(api::task_return_value(b1.base()), Ok(0));
        assert_eq!(api::task_return_value(b2.base()), Ok(0xFFFF_FFFF));
    }

    let t1 = TaskControl::from_buffer(b1.base()).unwrap();
    let t1 = unsafe { t1.as_ref() };
    assert_eq!(t1.state(), TaskState::Terminated);
    assert!(t1.terminated_at().is_some());
}

#[test]
fn higher_priority_preempts_and_hands_back() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    let mut bh = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    let mut bl = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_start(bh.base(), bh.len(), nop_entry, 0, Priority::Kernel0, "high")
            .unwrap();
        api::task_start(bl.base(), bl.len(), nop_entry, 0, Priority::User2, "low")
            .unwrap();
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    let this_tick: core::cell::RefCell<Vec<&'static str>> =
        core::cell::RefCell::new(Vec::new());
    let mut body = |task: NonNull<TaskControl>| {
        let d = desc(task);
        this_tick.borrow_mut().push(d);
        if d == "high" {
            // Sleep through the next hundred ticks; "low" busy-loops and
            // never blocks.
            api::task_delay(100).unwrap();
        }
    };

    assert!(machine.run_pending(&mut body));
    assert_eq!(*this_tick.borrow(), ["high", "low"]);

    // While "high" sleeps, every tick goes to "low" alone.
    for _ in 1..100 {
        this_tick.borrow_mut().clear();
        assert!(machine.tick(&mut body));
        assert_eq!(*this_tick.borrow(), ["low"]);
    }

    // Tick 100: "high" wakes and runs *before* any further "low" slice;
    // the moment it suspends again, "low" resumes.
    this_tick.borrow_mut().clear();
    assert!(machine.tick(&mut body));
    assert_eq!(*this_tick.borrow(), ["high", "low"]);
    check_invariants();
}

#[test]
fn equal_priority_tasks_round_robin_in_fifo_order() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    let mut bufs: Vec<TaskBuffer> = (0..3)
        .map(|_| TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER))
        .collect();
    let names = ["x", "y", "z"];
    for (buf, name) in bufs.iter_mut().zip(names) {
        unsafe {
            api::task_start(
                buf.base(),
                buf.len(),
                nop_entry,
                0,
                Priority::User1,
                name,
            )
            .unwrap();
        }
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    // Every dispatched task immediately yields, so selection must cycle
    // through the ready queue in arrival order, twice around and then
    // some.
    let mut order = Vec::new();
    for _ in 0..9 {
        assert!(arch::take_pending_switch());
        let task = machine.switch().unwrap();
        order.push(desc(task));
        api::task_yield().unwrap();
    }
    assert_eq!(
        order,
        ["x", "y", "z", "x", "y", "z", "x", "y", "z"]
    );
    check_invariants();
}

#[test]
fn mutex_contention_resolves_on_unlock() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    let mut ba = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    let mut bb = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_start(ba.base(), ba.len(), nop_entry, 0, Priority::Kernel0, "a")
            .unwrap();
        api::task_start(bb.base(), bb.len(), nop_entry, 0, Priority::Kernel1, "b")
            .unwrap();
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    let mut mutex = Mutex::new();
    let mobj = &mut mutex as *mut Mutex as *mut ();

    let mut a_step = 0;
    let mut b_step = 0;
    let mut b_resolved: Option<(u64, Code)> = None;

    let mut body = |task: NonNull<TaskControl>| match desc(task) {
        "a" => {
            a_step += 1;
            match a_step {
                1 => {
                    // Take the mutex and disappear for thirty ticks.
                    api::task_wait_for_signal(SignalKind::MutexLock, mobj, 0)
                        .unwrap();
                    api::task_delay(30).unwrap();
                }
                2 => {
                    // Tick 30: release and get out of the way.
                    api::task_wait_for_signal(SignalKind::MutexUnlock, mobj, 0)
                        .unwrap();
                    api::task_delay(10_000).unwrap();
                }
                _ => {
                    api::task_delay(10_000).unwrap();
                }
            }
        }
        "b" => {
            b_step += 1;
            match b_step {
                1 => {
                    // Block on the lock, giving up after 50 ticks. The raw
                    // syscall keeps the deferred nature observable.
                    let mut args = WaitForSignal {
                        kind: SignalKind::MutexLock,
                        object: mobj,
                        timeout: 50,
                    };
                    let code = arch::syscall(
                        Sysnum::WaitForSignal,
                        (&mut args as *mut WaitForSignal).cast(),
                    );
                    assert_eq!(code, Code::Waiting);
                }
                _ => {
                    // Resumed: the wait has resolved, one way or the
                    // other.
                    let result = unsafe { task.as_ref() }.sig_result();
                    b_resolved = Some((u64::from(time::now()), result));
                    api::task_delay(10_000).unwrap();
                }
            }
        }
        _ => {}
    };

    assert!(machine.run_pending(&mut body));
    for _ in 0..60 {
        assert!(machine.tick(&mut body));
    }
    check_invariants();

    // "a" unlocked at tick 30; the scheduler's retry handed "b" the lock
    // on that very pass, with "b" as the recorded owner.
    assert_eq!(b_resolved, Some((30, Code::Success)));
    let b_handle = TaskControl::from_buffer(bb.base()).unwrap();
    assert_eq!(mutex.owner(), Some(b_handle));
}

#[test]
fn mutex_wait_times_out_when_never_unlocked() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    let mut ba = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    let mut bb = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_start(ba.base(), ba.len(), nop_entry, 0, Priority::Kernel0, "a")
            .unwrap();
        api::task_start(bb.base(), bb.len(), nop_entry, 0, Priority::Kernel1, "b")
            .unwrap();
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    let mut mutex = Mutex::new();
    let mobj = &mut mutex as *mut Mutex as *mut ();

    let mut a_started = false;
    let mut b_step = 0;
    let mut b_resolved: Option<(u64, Code)> = None;

    let mut body = |task: NonNull<TaskControl>| match desc(task) {
        "a" => {
            if !a_started {
                a_started = true;
                api::task_wait_for_signal(SignalKind::MutexLock, mobj, 0)
                    .unwrap();
            }
            // Holds the lock forever.
            api::task_delay(10_000).unwrap();
        }
        "b" => {
            b_step += 1;
            if b_step == 1 {
                let mut args = WaitForSignal {
                    kind: SignalKind::MutexLock,
                    object: mobj,
                    timeout: 50,
                };
                let code = arch::syscall(
                    Sysnum::WaitForSignal,
                    (&mut args as *mut WaitForSignal).cast(),
                );
                assert_eq!(code, Code::Waiting);
            } else {
                let result = unsafe { task.as_ref() }.sig_result();
                b_resolved = Some((u64::from(time::now()), result));
                api::task_delay(10_000).unwrap();
            }
        }
        _ => {}
    };

    assert!(machine.run_pending(&mut body));
    for _ in 0..60 {
        assert!(machine.tick(&mut body));
    }

    assert_eq!(b_resolved, Some((50, Code::Timeout)));
    let a_handle = TaskControl::from_buffer(ba.base()).unwrap();
    assert_eq!(mutex.owner(), Some(a_handle));
}

#[test]
fn storage_jobs_round_trip_through_a_driver_task() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    // Driver lookup goes by description *identity*, so driver and client
    // must share the one reference.
    static SD0: &str = "sd0";

    let jobs = 4;
    let mut bd = TaskBuffer::new(api::task_min_buffer_size(
        TaskType::DriverStorage,
        jobs,
    ));
    let mut bc = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_driver_start(
            bd.base(),
            bd.len(),
            nop_entry,
            0,
            SD0,
            TaskType::DriverStorage,
            jobs,
        )
        .unwrap();
        api::task_start(bc.base(), bc.len(), nop_entry, 0, Priority::User0, "client")
            .unwrap();
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    let mut sector_data = [0u8; 32];
    let mut access = StorageAccess::new(
        SD0,
        DriverOp::Read,
        sector_data.as_mut_ptr(),
        3,
        2,
    );

    let mut client_step = 0;
    let mut client_outcome: Option<(Code, u32)> = None;
    let access_ptr = &mut access as *mut StorageAccess;

    let mut body = |task: NonNull<TaskControl>| match desc(task) {
        "sd0" => {
            // The driver's run loop: drain the queue, then sleep.
            match unsafe { driver::storage_job_take(task) } {
                Ok(mut job) => {
                    let job = unsafe { job.as_mut() };
                    job.processed = job.count;
                    unsafe {
                        driver::storage_job_done(
                            task,
                            NonNull::from(&mut *job),
                            Code::Success,
                        )
                        .unwrap();
                    }
                }
                Err(Code::Empty) => {
                    syscalls::task_sleep(task).unwrap();
                }
                Err(other) => panic!("driver saw {other:?}"),
            }
        }
        "client" => {
            client_step += 1;
            if client_step == 1 {
                let code = arch::syscall(
                    Sysnum::StorageAccess,
                    access_ptr.cast(),
                );
                assert_eq!(code, Code::Waiting);
            } else {
                let sa = unsafe { &*access_ptr };
                client_outcome = Some((sa.result, sa.processed));
            }
        }
        _ => {}
    };

    assert!(machine.run_pending(&mut body));
    for _ in 0..10 {
        assert!(machine.tick(&mut body));
    }
    check_invariants();

    assert_eq!(client_outcome, Some((Code::Success, 2)));

    let drv = TaskControl::from_buffer(bd.base()).unwrap();
    let stats = unsafe { driver::storage_stats(drv) };
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.sectors_read, 2);
}

#[test]
fn usage_windows_freeze_task_meters() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);
    machine.switch().unwrap();

    let mut bw = TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
    unsafe {
        api::task_start(bw.base(), bw.len(), nop_entry, 0, Priority::User0, "w")
            .unwrap();
    }
    arch::syscall(Sysnum::BootEnded, null_mut());

    let mut body = |_task: NonNull<TaskControl>| {
        // Busy task: never blocks.
    };
    assert!(machine.run_pending(&mut body));

    // Burn visible cycles in "w" across two full measurement windows.
    for _ in 0..2_100 {
        arch::add_cycles(100_000);
        assert!(machine.tick(&mut body));
    }

    let w = TaskControl::from_buffer(bw.base()).unwrap();
    let w = unsafe { w.as_ref() };
    assert!(w.usage_cpu().last_cycles() > 0);
    assert!(w.usage_cpu().last_switches() > 0);
    assert!(w.usage_mem().last_mean() > 0);
    assert!(w.usage_cpu().last_usage() > 0.0);
    assert!(w.run_cycles() > 0);

    startup::with_kernel(|k| {
        assert!(k.usage.last_window_end().is_some());
    })
    .unwrap();
}

#[test]
fn finite_shutdown_unwinds_to_the_main_stack() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Finite);

    let boot_task = machine.switch().unwrap();
    assert_eq!(desc(boot_task), "boot");

    // Any privileged task may pull the plug in Finite mode.
    api::terminate().unwrap();
    assert!(arch::take_pending_switch());
    assert!(machine.switch().is_none());

    // What `start` does once the first switch unwinds back into it.
    startup::syscall_shutdown().unwrap();

    assert!(!time::hook_installed());
    assert!(!startup::installed());
    assert_eq!(api::task_self(), None);
    assert_eq!(
        syscalls::dispatch(Sysnum::Yield as u32, null_mut()),
        Code::NotInitialized
    );
}

#[test]
fn forever_mode_refuses_termination() {
    let _kw = testutil::fresh_kernel();
    let mut machine = Machine::boot(RunMode::Forever);

    machine.switch().unwrap();
    assert_eq!(api::terminate(), Err(Code::InvalidOperation));

    // And the world keeps turning.
    let mut body = |_task: NonNull<TaskControl>| {};
    assert!(machine.tick(&mut body));
    assert!(startup::installed());
}
