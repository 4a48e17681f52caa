// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler, and its coordination with the tick interrupt.
//!
//! `schedule` runs inside the pendable service exception, with the
//! preempted stack pointer in hand. One pass: wake expired waiters, retry
//! pending signals, retire the outgoing task into the right queue, pick
//! the most important ready task (FIFO within a priority), set Thread-mode
//! privilege for it, settle the usage-accounting window, and hand back
//! the stack pointer to resume. A zero return tells the exception stub to
//! restore the pre-boot main stack instead -- that's shutdown.
//!
//! # The tick barrier
//!
//! The tick interrupt outranks everything, including the code here. To
//! keep it from piling scheduler requests on top of scheduler-critical
//! regions, privileged code raises a barrier; while it's up, the tick
//! hook just counts. Dropping the barrier (`barrier_check`, step 10 of
//! every pass) converts any missed ticks into a single coalesced
//! scheduler request.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tarn_abi::{Priority, TaskState};

use crate::arch;
use crate::startup::{self, Kernel};
use crate::task::TaskControl;
use crate::time::{self, Ticks};

/// Set when somebody has asked for a scheduler run that hasn't happened
/// yet. Purely diagnostic on the target (PendSV's pending bit is the real
/// trigger); the hosted harness polls it through the arch latch.
static SCHED_CALL_PENDING: AtomicBool = AtomicBool::new(false);

/// While true, the tick hook must not request scheduling.
static TICK_BARRIER: AtomicBool = AtomicBool::new(false);

/// Ticks that arrived while the barrier was up.
static TICKS_MISSED: AtomicU32 = AtomicU32::new(0);

/// Requests a scheduler run: the pendable service exception fires once
/// every more important handler has drained.
pub(crate) fn call_pending() {
    SCHED_CALL_PENDING.store(true, Ordering::Relaxed);
    arch::pend_switch();
}

pub(crate) fn call_is_pending() -> bool {
    SCHED_CALL_PENDING.load(Ordering::Relaxed)
}

/// The tick hook installed at boot: every tick wants a scheduler run,
/// except while the barrier is up, in which case the ticks are counted
/// and coalesced later.
pub(crate) fn tick_callback(_now: Ticks) {
    if TICK_BARRIER.load(Ordering::Relaxed) {
        TICKS_MISSED.fetch_add(1, Ordering::Relaxed);
    } else {
        call_pending();
    }
}

/// Raises the tick barrier.
pub(crate) fn barrier_activate() {
    TICK_BARRIER.store(true, Ordering::Relaxed);
}

/// Drops the tick barrier; if any ticks were missed while it was up,
/// issues one coalesced scheduler request.
pub(crate) fn barrier_check() {
    TICK_BARRIER.store(false, Ordering::Relaxed);
    if TICKS_MISSED.swap(0, Ordering::Relaxed) != 0 {
        call_pending();
    }
}

/// Drops the tick barrier and forgets missed ticks. Shutdown only.
pub(crate) fn barrier_clear() {
    TICKS_MISSED.store(0, Ordering::Relaxed);
    TICK_BARRIER.store(false, Ordering::Relaxed);
}

/// One scheduling pass.
///
/// `current_sp` is the preempted stack pointer -- zero on the very first
/// pass, where the preempted context is the kernel's own. Returns the
/// stack pointer of the task to run, or zero to shut down.
pub fn schedule(current_sp: usize) -> usize {
    // Cycles consumed since the previous pass belong to the outgoing
    // task; the counter restarts here so the pass can measure itself.
    let task_cycles = u64::from(arch::cycles_take());

    // Whatever exclusive monitor the preempted task held is dead; its
    // interrupted LDREX/STREX pair must fail and retry.
    arch::clear_exclusive();

    SCHED_CALL_PENDING.store(false, Ordering::Relaxed);

    let next_sp = startup::with_kernel(|k| {
        schedule_kernel(k, current_sp, task_cycles)
    });
    // A scheduler pass without an installed kernel is a kernel bug.
    uassert!(next_sp.is_ok());
    next_sp.unwrap_or(0)
}

fn schedule_kernel(
    k: &mut Kernel,
    current_sp: usize,
    task_cycles: u64,
) -> usize {
    // A set termination timestamp turns this pass into the last one: the
    // exception stub restores the pre-boot main stack on zero.
    if k.terminated_at.is_some() {
        return 0;
    }

    // One tick reading governs every decision in this pass, however long
    // the pass itself takes.
    let now = time::now();

    if current_sp == 0 {
        // First pass after boot.
        uassert!(k.started_at.is_none());
        uassert!(k.current_task.is_none());
        k.started_at = Some(now);
    }

    update_waiting_tasks(k, now);
    retire_current(k, current_sp, task_cycles, now);
    select_next(k);
    dispatch_current(k, now);

    settle_usage(k, now);

    barrier_check();

    let current = k.current_task;
    uassert!(current.is_some());
    current.map_or(0, |t| unsafe { t.as_ref() }.sp())
}

/// Walks every waiting queue, re-evaluating each task against `now` and
/// promoting the freed ones to their ready queue.
fn update_waiting_tasks(k: &mut Kernel, now: Ticks) {
    for priority in Priority::ALL {
        let i = priority.index();
        let mut cursor = k.waiting[i].head();
        while let Some(node) = cursor {
            // Grab the successor first; the node may leave this queue.
            cursor = unsafe { node.as_ref().next() };

            // Safety: only tasks are ever linked into these queues.
            let task = unsafe { TaskControl::from_node(node) };
            uassert!(unsafe { task.as_ref() }.sentinel_ok());

            unsafe {
                TaskControl::update_state(task, now);
            }

            if unsafe { task.as_ref() }.state() == TaskState::Ready {
                // Safety: `node` is linked in `waiting[i]`, and leaves it
                // before entering `ready[i]`.
                unsafe {
                    k.waiting[i].detach(node);
                    k.ready[i].push_tail(node);
                }
            }

            uassert!(unsafe { task.as_ref() }.sentinel_ok());
        }
    }
}

/// Banks the outgoing task's state and files it into the queue its new
/// state calls for.
fn retire_current(
    k: &mut Kernel,
    current_sp: usize,
    task_cycles: u64,
    now: Ticks,
) {
    let Some(handle) = k.current_task.take() else {
        // First pass, or the previous task terminated itself: the stack
        // pointer we were handed belongs to nobody we track.
        return;
    };

    // Safety: the current task is live and unaliased here.
    let task = unsafe { &mut *handle.as_ptr() };
    uassert_eq!(task.state(), TaskState::Running);
    uassert!(task.sentinel_ok());

    task.add_run_cycles(task_cycles);
    task.set_sp(current_sp);
    let used = task.used_memory();
    task.record_usage(task_cycles, used);

    unsafe {
        TaskControl::update_state(handle, now);
    }

    let task = unsafe { handle.as_ref() };
    let i = task.priority().index();
    match task.state() {
        // Safety: the running task was linked in no queue.
        TaskState::Ready => unsafe {
            k.ready[i].push_tail(TaskControl::node(handle));
        },
        TaskState::Waiting => unsafe {
            k.waiting[i].push_tail(TaskControl::node(handle));
        },
        // Running/Terminated are not states `update_state` produces.
        _ => uassert!(false),
    }
    uassert!(task.sentinel_ok());
}

/// Picks the head of the most important non-empty ready queue. The idle
/// task guarantees there is one.
fn select_next(k: &mut Kernel) {
    uassert!(k.current_task.is_none());

    for priority in Priority::ALL {
        let i = priority.index();
        if let Some(node) = k.ready[i].head() {
            // Safety: head of a task queue, linked in `ready[i]`.
            unsafe {
                k.ready[i].detach(node);
                k.current_task = Some(TaskControl::from_node(node));
            }
            return;
        }
    }
}

/// Marks the selected task running and arranges the privilege level its
/// priority class calls for.
fn dispatch_current(k: &mut Kernel, now: Ticks) {
    let current = k.current_task;
    uassert!(current.is_some());
    let Some(handle) = current else { return };

    // Safety: freshly detached from the ready queue; no other reference.
    let task = unsafe { &mut *handle.as_ptr() };
    uassert!(task.sentinel_ok());

    task.set_state(TaskState::Running);
    if task.started_at().is_none() {
        task.set_started_at(now);
    }

    arch::set_thread_privilege(task.priority().is_privileged());
}

/// Steps the usage window and, when a window just closed, freezes the
/// meters of every live task and of the kernel itself.
fn settle_usage(k: &mut Kernel, now: Ticks) {
    let clock_hz = u64::from(arch::clock_freq_khz()) * 1000;
    k.usage.update_target(now, clock_hz, time::period_us());

    if k.usage.closing() {
        let fraction = k.usage.window_fraction_per_cycle();

        // The newly selected task is in no queue; the outgoing task is in
        // one of them. Between the three sweeps every live task is hit
        // exactly once.
        if let Some(handle) = k.current_task {
            unsafe { (*handle.as_ptr()).rollover_usage(fraction) };
        }
        for queues in [&k.waiting, &k.ready] {
            for queue in queues.iter() {
                let mut cursor = queue.head();
                while let Some(node) = cursor {
                    cursor = unsafe { node.as_ref().next() };
                    let task = unsafe { TaskControl::from_node(node) };
                    unsafe { (*task.as_ptr()).rollover_usage(fraction) };
                }
            }
        }
    }

    // The cycle counter restarted at scheduler entry, so it currently
    // reads this pass's own (approximate) cost.
    let own_cycles = u64::from(arch::cycles_read());
    k.run_cycles += own_cycles;
    k.usage_cpu.record(own_cycles);
    if k.usage.closing() {
        let fraction = k.usage.window_fraction_per_cycle();
        k.usage_cpu.rollover(fraction);
    }
}

/// Test hook: put the scheduler's coordination state back to reset.
#[cfg(not(target_os = "none"))]
pub fn reset_for_test() {
    SCHED_CALL_PENDING.store(false, Ordering::Relaxed);
    TICK_BARRIER.store(false, Ordering::Relaxed);
    TICKS_MISSED.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn tick_barrier_coalesces_missed_ticks() {
        let _world = testutil::fresh_world();
        time::set_hook(Some(tick_callback));

        barrier_activate();
        time::advance(5);
        // Barrier up: no request made it through.
        assert!(!crate::arch::take_pending_switch());
        assert!(!call_is_pending());

        // Dropping the barrier converts five missed ticks into exactly
        // one request.
        barrier_check();
        assert!(call_is_pending());
        assert!(crate::arch::take_pending_switch());
        assert!(!crate::arch::take_pending_switch());
    }

    #[test]
    fn barrier_clear_discards_missed_ticks() {
        let _world = testutil::fresh_world();
        time::set_hook(Some(tick_callback));

        barrier_activate();
        time::advance(3);
        barrier_clear();
        assert!(!call_is_pending());
        assert!(!crate::arch::take_pending_switch());
    }

    #[test]
    fn tick_requests_scheduling_when_barrier_is_down() {
        let _world = testutil::fresh_world();
        time::set_hook(Some(tick_callback));
        time::advance(1);
        assert!(call_is_pending());
        assert!(crate::arch::take_pending_switch());
    }
}
