//! Threads
//!
//! A thread is the unit the scheduler dispatches. Identity (tid, owning pid,
//! priority) is immutable; everything that changes lives in `ThreadInner`
//! behind the thread's own spinlock.
//!
//! # State machine
//!
//! ```text
//! New ──► Ready ◄──► Running ──► Blocked ──► Ready
//!                       │
//!                       └──────► Sleeping ─► Ready
//! any live state ──► Dead
//! ```
//!
//! Every state change goes through [`ThreadInner::transition`]; an edge not
//! in the table is a kernel bug and panics.

use alloc::boxed::Box;
use alloc::sync::Arc;

use kestrel_sync::{SpinLock, SpinLockGuard, DEFAULT_SPIN_LIMIT};
use serde::{Deserialize, Serialize};

use crate::object::{EventMask, WaitRecord};
use crate::types::{CoreId, ObjectId, ProcessId, ThreadId, VirtAddr};

/// Kernel stack size per thread
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Size of the saved FPU/SSE area (FXSAVE layout)
pub const FPU_STATE_SIZE: usize = 512;

/// Idle threads take tids from here up, one per core
pub const IDLE_TID_BASE: u64 = 1 << 63;

/// Scheduling state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Dead,
}

impl ThreadState {
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, next),
            (New, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Blocked)
                | (Blocked, Ready)
                | (Running, Sleeping)
                | (Sleeping, Ready)
                | (New | Ready | Running | Blocked | Sleeping, Dead)
        )
    }
}

/// Thread priority levels (higher runs first)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
}

/// Saved user register state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterContext {
    /// Instruction pointer
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// Flags register
    pub flags: u64,
    /// Argument registers
    pub args: [u64; 6],
    /// Syscall return value
    pub ret: i64,
}

impl RegisterContext {
    /// Interrupts enabled, reserved bit set
    pub const USER_FLAGS: u64 = 0x202;

    pub fn user(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            ip: entry.0,
            sp: stack.0,
            flags: Self::USER_FLAGS,
            ..Self::default()
        }
    }
}

/// Saved FPU/SSE state
#[derive(Clone)]
pub struct FpuState(Box<[u8; FPU_STATE_SIZE]>);

impl FpuState {
    pub fn bytes(&self) -> &[u8; FPU_STATE_SIZE] {
        &self.0
    }
}

impl Default for FpuState {
    fn default() -> Self {
        let mut area = Box::new([0u8; FPU_STATE_SIZE]);
        // FCW: all exceptions masked, extended precision
        area[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        // MXCSR: all SSE exceptions masked
        area[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        FpuState(area)
    }
}

/// Why a blocked or sleeping thread became ready
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// A watched object signalled
    Signalled { object: ObjectId, events: EventMask },
    /// The wait deadline passed
    TimedOut,
    /// A signal or kill interrupted the wait
    Interrupted,
    /// A sleep completed
    Deadline,
}

/// Mutable thread state
pub struct ThreadInner {
    pub state: ThreadState,
    /// Ticks left in the current quantum
    pub time_slice: u32,
    pub context: RegisterContext,
    pub fpu: FpuState,
    /// Released when the owning process is reaped
    pub kernel_stack: Option<Box<[u8]>>,
    /// Top of the user stack, if the kernel allocated one
    pub user_stack: Option<VirtAddr>,
    /// Active wait (watchers registered on objects)
    pub wait: Option<WaitRecord>,
    /// Bumped on every wait; stale wakes carry an old value
    pub wait_seq: u64,
    /// Set by whoever woke the current wait
    pub wake: Option<WakeReason>,
    /// Timer deadline of the current wait or sleep (nanoseconds)
    pub deadline: Option<u64>,
    /// Pending signal bits
    pub pending_signals: u64,
    /// Terminate at the next scheduling point
    pub kill_pending: bool,
    /// Core whose queue this thread lives on
    pub last_core: Option<CoreId>,
}

impl ThreadInner {
    /// Move to `next`, panicking on an edge the state machine forbids.
    pub fn transition(&mut self, tid: ThreadId, next: ThreadState) {
        if !self.state.can_transition_to(next) {
            panic!(
                "thread {}: illegal transition {:?} -> {:?}",
                tid, self.state, next
            );
        }
        self.state = next;
    }

    pub fn has_pending_interrupt(&self) -> bool {
        self.kill_pending || self.pending_signals != 0
    }

    /// Take the pending signal bits. A pending kill is left in place.
    pub fn take_signals(&mut self) -> u64 {
        core::mem::take(&mut self.pending_signals)
    }
}

/// A schedulable thread
pub struct Thread {
    tid: ThreadId,
    pid: ProcessId,
    priority: Priority,
    idle: bool,
    inner: SpinLock<ThreadInner>,
}

impl Thread {
    pub fn new(
        tid: ThreadId,
        pid: ProcessId,
        priority: Priority,
        context: RegisterContext,
    ) -> Arc<Self> {
        Self::with_spin_limit(tid, pid, priority, context, DEFAULT_SPIN_LIMIT)
    }

    pub fn with_spin_limit(
        tid: ThreadId,
        pid: ProcessId,
        priority: Priority,
        context: RegisterContext,
        spin_limit: u32,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            tid,
            pid,
            priority,
            context,
            ThreadState::New,
            false,
            spin_limit,
        ))
    }

    /// The idle thread of `core`. It is never queued and runs only when the
    /// core's queue is empty.
    pub fn idle(core: CoreId, spin_limit: u32) -> Arc<Self> {
        Arc::new(Self::build(
            ThreadId(IDLE_TID_BASE + core.0 as u64),
            ProcessId(0),
            Priority::Idle,
            RegisterContext::default(),
            ThreadState::Ready,
            true,
            spin_limit,
        ))
    }

    fn build(
        tid: ThreadId,
        pid: ProcessId,
        priority: Priority,
        context: RegisterContext,
        state: ThreadState,
        idle: bool,
        spin_limit: u32,
    ) -> Self {
        Self {
            tid,
            pid,
            priority,
            idle,
            inner: SpinLock::with_spin_limit(
                "thread",
                spin_limit,
                ThreadInner {
                    state,
                    time_slice: 0,
                    context,
                    fpu: FpuState::default(),
                    kernel_stack: Some(alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice()),
                    user_stack: None,
                    wait: None,
                    wait_seq: 0,
                    wake: None,
                    deadline: None,
                    pending_signals: 0,
                    kill_pending: false,
                    last_core: None,
                },
            ),
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn lock(&self) -> SpinLockGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub fn spin_limit(&self) -> u32 {
        self.inner.spin_limit()
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn context(&self) -> RegisterContext {
        self.inner.lock().context
    }

    pub fn release_kernel_stack(&self) {
        self.inner.lock().kernel_stack = None;
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("priority", &self.priority)
            .field("idle", &self.idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Arc<Thread> {
        Thread::new(
            ThreadId(1),
            ProcessId(1),
            Priority::Normal,
            RegisterContext::user(VirtAddr(0x40_0000), VirtAddr(0x7FFF_0000)),
        )
    }

    #[test]
    fn test_new_thread_defaults() {
        let t = thread();
        assert_eq!(t.state(), ThreadState::New);
        let inner = t.lock();
        assert_eq!(inner.context.ip, 0x40_0000);
        assert_eq!(inner.context.flags, RegisterContext::USER_FLAGS);
        assert_eq!(inner.kernel_stack.as_ref().map(|s| s.len()), Some(KERNEL_STACK_SIZE));
        assert_eq!(inner.fpu.bytes()[24..28], 0x1F80u32.to_le_bytes());
    }

    #[test]
    fn test_legal_lifecycle() {
        let t = thread();
        let mut inner = t.lock();
        for next in [
            ThreadState::Ready,
            ThreadState::Running,
            ThreadState::Blocked,
            ThreadState::Ready,
            ThreadState::Running,
            ThreadState::Sleeping,
            ThreadState::Ready,
            ThreadState::Running,
            ThreadState::Dead,
        ] {
            inner.transition(t.tid(), next);
        }
        assert_eq!(inner.state, ThreadState::Dead);
    }

    #[test]
    #[should_panic(expected = "illegal transition New -> Running")]
    fn test_illegal_transition_is_fatal() {
        let t = thread();
        t.lock().transition(t.tid(), ThreadState::Running);
    }

    #[test]
    #[should_panic(expected = "illegal transition Dead -> Ready")]
    fn test_dead_is_terminal() {
        let t = thread();
        let mut inner = t.lock();
        inner.transition(t.tid(), ThreadState::Dead);
        inner.transition(t.tid(), ThreadState::Ready);
    }

    #[test]
    fn test_idle_thread_identity() {
        let idle = Thread::idle(CoreId(3), DEFAULT_SPIN_LIMIT);
        assert!(idle.is_idle());
        assert_eq!(idle.tid(), ThreadId(IDLE_TID_BASE + 3));
        assert_eq!(idle.priority(), Priority::Idle);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Low > Priority::Idle);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
