// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A task is a single contiguous, 8-byte-aligned buffer supplied by its
//! creator. The `TaskControl` record sits at the bottom; the task's stack
//! grows down from just under the sentinel word that closes the buffer.
//! Driver tasks additionally reserve a private region between stack top
//! and sentinel. Because the queue `Node` is the first field and the
//! struct is `#[repr(C)]`, a node pointer and a task pointer are the same
//! address, which is what lets the intrusive queues work.
//!
//! The fields are private so the state invariants stay in this module:
//! exactly one task is `Running` and it sits in no queue; `Ready` and
//! `Waiting` tasks sit in the queue of their priority; `Terminated` tasks
//! sit nowhere.

use core::ptr::NonNull;

use tarn_abi::{
    Code, ContextFrame, Priority, TaskEntry, TaskState, TaskType,
    CONTEXT_WORDS, EXC_RETURN_THREAD_PSP, INITIAL_XPSR, MIN_TASK_STACK,
    STACK_SENTINEL,
};

use crate::list::Node;
use crate::semaphore::Semaphore;
use crate::time::Ticks;
use crate::usage::{CpuUsage, MemUsage};

/// A signal test, run once at call time and then retried by the scheduler
/// on every pass until it succeeds or the wait times out. The first
/// argument identifies the task the test acts for, so ownership-sensitive
/// objects (the mutex) attribute the operation correctly.
pub type SigAction = fn(NonNull<TaskControl>, *mut ()) -> bool;

/// Pending signal-wait record: what to retry, against which object.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SigWait {
    pub action: SigAction,
    pub object: *mut (),
}

/// Task control block. Lives at the bottom of the task's buffer.
#[repr(C)]
pub struct TaskControl {
    /// Queue linkage. Must stay the first field.
    node: Node,
    /// Total buffer size in bytes.
    size: usize,
    /// Byte offset of the stack top within the buffer. The generic top is
    /// just below the sentinel word; driver init moves it further down.
    stack_top: usize,
    /// Human-readable name. Driver lookup compares the *pointer*, not the
    /// contents, so driver clients must pass the very same reference.
    description: &'static str,
    ret_value: u32,
    started_at: Option<Ticks>,
    terminated_at: Option<Ticks>,
    /// While `Some`, the task stays `Waiting` until this instant (or its
    /// signal succeeds). `Ticks::MAX` means "wait forever".
    suspended_until: Option<Ticks>,
    /// Instant the last plain delay expired; the cadence base for
    /// periodic delays.
    last_suspension: Ticks,
    sig_wait: Option<SigWait>,
    /// Final result of the last signal wait, read by the caller after it
    /// resumes.
    sig_result: Code,
    /// One-unit semaphore implementing sleep/wake. Available iff the task
    /// is not asleep.
    sleep: Semaphore,
    task_type: TaskType,
    priority: Priority,
    state: TaskState,
    /// Cumulative cycles spent running, across all windows.
    run_cycles: u64,
    usage_cpu: CpuUsage,
    usage_mem: MemUsage,
    /// Saved stack pointer while not running.
    sp: usize,
}

impl TaskControl {
    /// Smallest legal buffer for a generic task: the control record, one
    /// worst-case context image, a minimum scratch stack, and the
    /// sentinel word.
    pub const GENERIC_MIN_BUFFER: usize = core::mem::size_of::<TaskControl>()
        + CONTEXT_WORDS * 4
        + MIN_TASK_STACK
        + 4;

    pub(crate) fn new(
        size: usize,
        description: &'static str,
        task_type: TaskType,
        priority: Priority,
    ) -> Self {
        TaskControl {
            node: Node::new(),
            size,
            stack_top: size - 4,
            description,
            ret_value: 0,
            started_at: None,
            terminated_at: None,
            suspended_until: None,
            last_suspension: Ticks::ZERO,
            sig_wait: None,
            sig_result: Code::Success,
            sleep: Semaphore::new(1, 1),
            task_type,
            priority,
            state: TaskState::Ready,
            run_cycles: 0,
            usage_cpu: CpuUsage::new(),
            usage_mem: MemUsage::new(),
            sp: 0,
        }
    }

    // Handle conversions. Valid because `node` is the first field of a
    // `#[repr(C)]` struct.

    pub(crate) fn node(this: NonNull<TaskControl>) -> NonNull<Node> {
        this.cast()
    }

    /// # Safety
    ///
    /// `node` must be the node embedded in a live `TaskControl`.
    pub(crate) unsafe fn from_node(node: NonNull<Node>) -> NonNull<TaskControl> {
        node.cast()
    }

    /// Reinterprets a task buffer pointer as a task handle. The caller is
    /// responsible for the buffer actually holding an initialized task.
    pub fn from_buffer(buffer: *mut u8) -> Option<NonNull<TaskControl>> {
        NonNull::new(buffer.cast())
    }

    // Accessors.

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn return_value(&self) -> u32 {
        self.ret_value
    }

    pub fn started_at(&self) -> Option<Ticks> {
        self.started_at
    }

    pub fn terminated_at(&self) -> Option<Ticks> {
        self.terminated_at
    }

    pub fn run_cycles(&self) -> u64 {
        self.run_cycles
    }

    pub fn usage_cpu(&self) -> &CpuUsage {
        &self.usage_cpu
    }

    pub fn usage_mem(&self) -> &MemUsage {
        &self.usage_mem
    }

    pub fn sig_result(&self) -> Code {
        self.sig_result
    }

    pub(crate) fn sp(&self) -> usize {
        self.sp
    }

    pub(crate) fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    pub(crate) fn stack_top(&self) -> usize {
        self.stack_top
    }

    pub(crate) fn set_stack_top(&mut self, top: usize) {
        self.stack_top = top;
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub(crate) fn set_started_at(&mut self, at: Ticks) {
        self.started_at = Some(at);
    }

    pub(crate) fn set_terminated(&mut self, ret_value: u32, at: Ticks) {
        self.ret_value = ret_value;
        self.terminated_at = Some(at);
        self.state = TaskState::Terminated;
    }

    pub(crate) fn suspended_until(&self) -> Option<Ticks> {
        self.suspended_until
    }

    pub(crate) fn set_suspended_until(&mut self, until: Ticks) {
        self.suspended_until = Some(until);
    }

    pub(crate) fn last_suspension(&self) -> Ticks {
        self.last_suspension
    }

    pub(crate) fn set_last_suspension(&mut self, at: Ticks) {
        self.last_suspension = at;
    }

    pub(crate) fn set_sig_wait(&mut self, action: SigAction, object: *mut ()) {
        self.sig_wait = Some(SigWait { action, object });
        self.sig_result = Code::Waiting;
    }

    /// Disarms a just-armed wait that cannot be satisfied anymore,
    /// recording `result` as its outcome. The task never suspends.
    pub(crate) fn cancel_sig_wait(&mut self, result: Code) {
        self.sig_wait = None;
        self.sig_result = result;
        self.suspended_until = None;
    }

    pub(crate) fn add_run_cycles(&mut self, cycles: u64) {
        self.run_cycles += cycles;
    }

    pub(crate) fn record_usage(&mut self, cycles: u64, used_memory: usize) {
        self.usage_cpu.record(cycles);
        self.usage_mem.record(used_memory);
    }

    pub(crate) fn rollover_usage(&mut self, window_fraction_per_cycle: f32) {
        let used = self.used_memory();
        self.usage_cpu.rollover(window_fraction_per_cycle);
        self.usage_mem.rollover(used, self.size);
    }

    /// Bytes of the buffer in use right now: everything that isn't free
    /// stack above the saved stack pointer. Includes the control record
    /// itself.
    pub fn used_memory(&self) -> usize {
        let base = self as *const Self as usize;
        if self.sp == 0 {
            // Not yet seeded.
            return core::mem::size_of::<TaskControl>();
        }
        uassert!(self.sp > base && self.sp <= base + self.size);
        self.size - (self.sp - base) + core::mem::size_of::<TaskControl>()
    }

    // Sleep/wake support. The sleep semaphore is available iff the task
    // is awake.

    pub(crate) fn sleep_sem(&self) -> &Semaphore {
        &self.sleep
    }

    pub fn is_asleep(&self) -> bool {
        self.sleep.available() == 0
    }

    // Sentinel handling.

    pub(crate) fn write_sentinel(&mut self) {
        let base = self as *mut Self as *mut u8;
        // Safety: `size` was validated against the buffer the record was
        // constructed in; the last word is ours.
        unsafe {
            base.add(self.size - 4).cast::<u32>().write(STACK_SENTINEL);
        }
    }

    /// Checks the stack barrier at the end of the buffer. The scheduler
    /// asserts this on every visit to every task.
    pub fn sentinel_ok(&self) -> bool {
        let base = self as *const Self as *const u8;
        // Safety: same extent argument as `write_sentinel`.
        let word = unsafe { base.add(self.size - 4).cast::<u32>().read() };
        word == STACK_SENTINEL
    }

    /// Lays down the synthetic context image at the top of the stack, so
    /// the first restore of this task enters `entry` with `param` in r0
    /// and the right trampoline in lr.
    pub(crate) fn seed_stack(&mut self, entry: TaskEntry, param: usize) {
        let trampoline: extern "C" fn(u32) -> ! =
            if self.priority == Priority::Boot {
                boot_return_trampoline
            } else {
                task_return_trampoline
            };

        let base = self as *mut Self as usize;
        let frame_addr = base + self.stack_top - ContextFrame::BYTES;
        let frame = ContextFrame {
            exc_return: EXC_RETURN_THREAD_PSP,
            r0: param as u32,
            lr: trampoline as usize as u32,
            pc: entry as usize as u32,
            xpsr: INITIAL_XPSR,
            ..Default::default()
        };
        // Safety: the stack region was size-checked at task start; the
        // frame lands entirely between the control record and stack top.
        unsafe {
            (frame_addr as *mut ContextFrame).write(frame);
        }
        self.sp = frame_addr;
    }

    /// The waiting-state decision table, consulted by the scheduler for
    /// every waiting task on every pass and for the outgoing task.
    ///
    /// | suspended_until | signal  | outcome                            |
    /// |-----------------|---------|------------------------------------|
    /// | none            | any     | Ready                              |
    /// | future          | none    | Waiting                            |
    /// | future          | pending | retry action; Ready iff acquired   |
    /// | passed          | none    | Ready, cadence point recorded      |
    /// | passed          | pending | Ready, wait ends with Timeout      |
    ///
    /// # Safety
    ///
    /// `this` must point to a live task record not aliased by any
    /// outstanding reference. The signal action receives `this` and may
    /// read the task's identity, but must not re-enter task state.
    pub(crate) unsafe fn update_state(this: NonNull<TaskControl>, now: Ticks) {
        let t = this.as_ptr();

        let until = match (*t).suspended_until {
            // Not waiting for anything.
            None => {
                (*t).state = TaskState::Ready;
                return;
            }
            Some(u) => u,
        };

        if until > now {
            // Start by assuming the wait continues.
            (*t).state = TaskState::Waiting;

            let Some(sig) = (*t).sig_wait else {
                return;
            };
            uassert!(!sig.object.is_null());

            // Retry the signal on behalf of the waiting task.
            if (sig.action)(this, sig.object) {
                (*t).sig_wait = None;
                (*t).sig_result = Code::Success;
                (*t).suspended_until = None;
                (*t).state = TaskState::Ready;
            }
            return;
        }

        // The deadline has passed.
        if (*t).sig_wait.is_some() {
            (*t).sig_wait = None;
            (*t).sig_result = Code::Timeout;
        } else {
            // A plain delay ended: record the cadence point.
            (*t).last_suspension = until;
        }
        (*t).suspended_until = None;
        (*t).state = TaskState::Ready;
    }
}

/// Return trampoline shared by all non-boot tasks: the entry function's
/// return value becomes a self-termination.
pub(crate) extern "C" fn task_return_trampoline(ret_value: u32) -> ! {
    let mut args = crate::syscalls::TerminateTask {
        task: core::ptr::null_mut(),
        ret_value,
    };
    crate::arch::syscall(
        tarn_abi::Sysnum::TaskTerminate,
        (&mut args as *mut crate::syscalls::TerminateTask).cast(),
    );
    // A self-terminating task is never resumed.
    crate::arch::park()
}

/// Return trampoline for the boot task. A non-zero return is an
/// unrecoverable boot error: the kernel is taken down (Finite mode) or
/// the processor parks (Forever mode, where shutdown is refused). A zero
/// return hands the boot buffer back to the kernel for the idle task.
pub(crate) extern "C" fn boot_return_trampoline(ret_value: u32) -> ! {
    if ret_value != 0 {
        crate::arch::syscall(tarn_abi::Sysnum::Shutdown, core::ptr::null_mut());
        crate::arch::park()
    }
    crate::arch::syscall(tarn_abi::Sysnum::BootEnded, core::ptr::null_mut());
    crate::arch::park()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    extern "C" fn nop_entry(_arg: usize) -> u32 {
        0
    }

    fn make_task(buf: &mut testutil::TaskBuffer) -> NonNull<TaskControl> {
        let size = buf.len();
        let base = buf.base();
        // Safety: the buffer is 8-aligned, large enough, and zeroed.
        unsafe {
            base.cast::<TaskControl>().write(TaskControl::new(
                size,
                "test",
                TaskType::Generic,
                Priority::User0,
            ));
        }
        let mut t = TaskControl::from_buffer(base).unwrap();
        unsafe {
            t.as_mut().write_sentinel();
        }
        t
    }

    #[test]
    fn node_and_task_share_an_address() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let t = make_task(&mut buf);
        let n = TaskControl::node(t);
        assert_eq!(n.as_ptr() as usize, t.as_ptr() as usize);
        let back = unsafe { TaskControl::from_node(n) };
        assert_eq!(back, t);
    }

    #[test]
    fn seeded_stack_matches_the_documented_image() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        let task = unsafe { t.as_mut() };
        task.seed_stack(nop_entry, 0x1234);

        let base = buf.base() as usize;
        let expected_sp = base + task.stack_top() - ContextFrame::BYTES;
        assert_eq!(task.sp(), expected_sp);

        let frame = unsafe { &*(task.sp() as *const ContextFrame) };
        assert_eq!(frame.exc_return, EXC_RETURN_THREAD_PSP);
        assert_eq!(frame.r0, 0x1234);
        assert_eq!(frame.xpsr, INITIAL_XPSR);
        assert_eq!(frame.pc, nop_entry as usize as u32);
        assert_eq!(frame.lr, task_return_trampoline as usize as u32);
        assert_eq!(frame.r1, 0);
        assert_eq!(frame.r12, 0);
        assert_eq!(frame.r4, 0);

        // Seeding must not disturb the sentinel.
        assert!(task.sentinel_ok());
    }

    #[test]
    fn sentinel_detects_overrun() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        assert!(unsafe { t.as_ref() }.sentinel_ok());

        let size = unsafe { t.as_ref() }.size();
        unsafe {
            buf.base().add(size - 4).cast::<u32>().write(0x12345678);
        }
        assert!(!unsafe { t.as_ref() }.sentinel_ok());
        unsafe { t.as_mut() }.write_sentinel();
        assert!(unsafe { t.as_ref() }.sentinel_ok());
    }

    #[test]
    fn update_state_without_suspension_is_ready() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let t = make_task(&mut buf);
        unsafe {
            TaskControl::update_state(t, Ticks::from(100));
            assert_eq!(t.as_ref().state(), TaskState::Ready);
        }
    }

    #[test]
    fn update_state_future_deadline_keeps_waiting() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        unsafe {
            t.as_mut().set_suspended_until(Ticks::from(200));
            TaskControl::update_state(t, Ticks::from(100));
            assert_eq!(t.as_ref().state(), TaskState::Waiting);
            assert_eq!(t.as_ref().suspended_until(), Some(Ticks::from(200)));
        }
    }

    #[test]
    fn update_state_expired_delay_records_cadence_point() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        unsafe {
            t.as_mut().set_suspended_until(Ticks::from(200));
            TaskControl::update_state(t, Ticks::from(200));
            assert_eq!(t.as_ref().state(), TaskState::Ready);
            assert_eq!(t.as_ref().suspended_until(), None);
            assert_eq!(t.as_ref().last_suspension(), Ticks::from(200));
        }
    }

    fn sig_test_action(_who: NonNull<TaskControl>, obj: *mut ()) -> bool {
        let sem = unsafe { &*(obj as *const Semaphore) };
        sem.acquire()
    }

    #[test]
    fn update_state_signal_acquired_frees_the_task() {
        let sem = Semaphore::new(1, 1);
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        unsafe {
            t.as_mut().set_suspended_until(Ticks::MAX);
            t.as_mut().set_sig_wait(
                sig_test_action,
                &sem as *const Semaphore as *mut (),
            );
            assert_eq!(t.as_ref().sig_result(), Code::Waiting);

            TaskControl::update_state(t, Ticks::from(10));
            assert_eq!(t.as_ref().state(), TaskState::Ready);
            assert_eq!(t.as_ref().sig_result(), Code::Success);
            assert_eq!(t.as_ref().suspended_until(), None);
            assert_eq!(sem.available(), 0);
        }
    }

    #[test]
    fn update_state_signal_unavailable_keeps_waiting_then_times_out() {
        let sem = Semaphore::new(1, 0);
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        unsafe {
            t.as_mut().set_suspended_until(Ticks::from(50));
            t.as_mut().set_sig_wait(
                sig_test_action,
                &sem as *const Semaphore as *mut (),
            );

            TaskControl::update_state(t, Ticks::from(10));
            assert_eq!(t.as_ref().state(), TaskState::Waiting);
            assert_eq!(t.as_ref().sig_result(), Code::Waiting);

            // Deadline reached: the wait ends with Timeout, and the
            // cadence point is *not* updated for signal waits.
            TaskControl::update_state(t, Ticks::from(50));
            assert_eq!(t.as_ref().state(), TaskState::Ready);
            assert_eq!(t.as_ref().sig_result(), Code::Timeout);
            assert_eq!(t.as_ref().last_suspension(), Ticks::ZERO);
        }
    }

    #[test]
    fn used_memory_counts_header_and_stack() {
        let mut buf = testutil::TaskBuffer::new(TaskControl::GENERIC_MIN_BUFFER);
        let mut t = make_task(&mut buf);
        let task = unsafe { t.as_mut() };
        task.seed_stack(nop_entry, 0);

        let used = task.used_memory();
        // One context frame plus the sentinel word plus the header.
        assert_eq!(
            used,
            ContextFrame::BYTES + 4 + core::mem::size_of::<TaskControl>()
        );
    }
}
