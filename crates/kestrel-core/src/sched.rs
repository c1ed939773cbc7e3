//! Multi-core scheduler
//!
//! # Architecture
//!
//! - **Per-core run queues**: each [`CoreContext`] owns a priority-ordered
//!   ready queue and an idle thread. Contexts are built once at bring-up and
//!   held by the [`Scheduler`]; there is no global scheduler state.
//! - **Placement**: new threads go to the core with the shortest queue and
//!   stay there.
//! - **Quantum**: refilled on dispatch, decremented by `tick`, preemption at
//!   zero. Equal priorities round-robin.
//! - **Timers**: sleeps and wait timeouts live in one deadline-ordered map.
//! - **IPIs**: the scheduler never touches hardware. Cross-core wakes and
//!   kills queue an [`IpiRequest`]; the runtime drains them with
//!   [`Scheduler::take_ipis`] and delivers them through the HAL.
//!
//! # Lock order
//!
//! run queue, then thread, then the IPI outbox. The timer map is never held
//! together with any other lock.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_sync::{SpinLock, DEFAULT_SPIN_LIMIT};
use serde::{Deserialize, Serialize};

use crate::object::Wake;
use crate::thread::{Thread, ThreadState, WakeReason};
use crate::types::{CoreId, ThreadId};

/// Interrupt vector used for reschedule requests
pub const RESCHEDULE_VECTOR: u8 = 0xF1;

/// Interrupt vector used to halt a core
pub const HALT_VECTOR: u8 = 0xF2;

/// Inter-processor interrupt kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ipi {
    /// Run the scheduler now
    Reschedule,
    /// Stop the core
    Halt,
}

impl Ipi {
    pub fn vector(self) -> u8 {
        match self {
            Ipi::Reschedule => RESCHEDULE_VECTOR,
            Ipi::Halt => HALT_VECTOR,
        }
    }

    pub fn from_vector(vector: u8) -> Option<Self> {
        match vector {
            RESCHEDULE_VECTOR => Some(Ipi::Reschedule),
            HALT_VECTOR => Some(Ipi::Halt),
            _ => None,
        }
    }
}

/// An IPI the runtime must deliver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpiRequest {
    pub target: CoreId,
    pub ipi: Ipi,
}

/// Result of trying to block the current thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The wake arrived before the thread could block; it keeps running
    AlreadyWoken,
    /// The thread is off the CPU until woken
    Blocked,
}

/// Result of terminating a thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The thread is dead now
    Immediate,
    /// The thread is running on this core and dies at its next scheduling
    /// point
    Deferred(CoreId),
    /// Nothing to do
    AlreadyDead,
}

/// What a core should run next
pub struct Dispatch {
    pub thread: Arc<Thread>,
    /// Threads that died at this scheduling point
    pub reaped: Vec<Arc<Thread>>,
}

// ============================================================================
// Per-core state
// ============================================================================

struct RunQueue {
    ready: VecDeque<Arc<Thread>>,
    current: Option<Arc<Thread>>,
    dispatches: u64,
    idle_ticks: u64,
    ipi_pending: bool,
}

impl RunQueue {
    /// Insert behind every thread of equal or higher priority.
    fn enqueue(&mut self, thread: Arc<Thread>) {
        let at = self
            .ready
            .iter()
            .position(|queued| thread.priority() > queued.priority())
            .unwrap_or(self.ready.len());
        self.ready.insert(at, thread);
    }

    fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        match self.ready.iter().position(|t| Arc::ptr_eq(t, thread)) {
            Some(at) => {
                self.ready.remove(at);
                true
            }
            None => false,
        }
    }

    fn load(&self) -> usize {
        self.ready.len()
            + self
                .current
                .as_ref()
                .map_or(0, |current| usize::from(!current.is_idle()))
    }

    /// Whether `incoming` should preempt what this core runs now
    fn should_preempt(&self, incoming: &Thread) -> bool {
        match &self.current {
            None => true,
            Some(current) => current.is_idle() || incoming.priority() > current.priority(),
        }
    }
}

/// One core's scheduling state
pub struct CoreContext {
    id: CoreId,
    queue: SpinLock<RunQueue>,
    idle: Arc<Thread>,
}

impl CoreContext {
    fn new(id: CoreId, spin_limit: u32) -> Self {
        Self {
            id,
            queue: SpinLock::with_spin_limit(
                "run-queue",
                spin_limit,
                RunQueue {
                    ready: VecDeque::new(),
                    current: None,
                    dispatches: 0,
                    idle_ticks: 0,
                    ipi_pending: false,
                },
            ),
            idle: Thread::idle(id, spin_limit),
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn idle_thread(&self) -> &Arc<Thread> {
        &self.idle
    }
}

/// Counters for one core
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreStats {
    pub core: CoreId,
    pub ready: usize,
    pub dispatches: u64,
    pub idle_ticks: u64,
    pub running_idle: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Sleep,
    WaitTimeout,
}

struct TimerEntry {
    thread: Arc<Thread>,
    seq: u64,
    kind: TimerKind,
}

// ============================================================================
// Scheduler
// ============================================================================

/// All cores' run queues plus the timer map
pub struct Scheduler {
    cores: Vec<CoreContext>,
    timers: SpinLock<BTreeMap<(u64, ThreadId), TimerEntry>>,
    outbox: SpinLock<Vec<IpiRequest>>,
    quantum: u32,
    spin_limit: u32,
}

impl Scheduler {
    pub fn new(core_count: u32, quantum: u32) -> Self {
        Self::with_spin_limit(core_count, quantum, DEFAULT_SPIN_LIMIT)
    }

    /// A scheduler whose queue, timer and outbox locks give up after
    /// `spin_limit` spins. Idle threads inherit the limit.
    pub fn with_spin_limit(core_count: u32, quantum: u32, spin_limit: u32) -> Self {
        Self {
            cores: (0..core_count.max(1))
                .map(|id| CoreContext::new(CoreId(id), spin_limit))
                .collect(),
            timers: SpinLock::with_spin_limit("timers", spin_limit, BTreeMap::new()),
            outbox: SpinLock::with_spin_limit("ipi-outbox", spin_limit, Vec::new()),
            quantum: quantum.max(1),
            spin_limit,
        }
    }

    pub fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    pub fn core_count(&self) -> u32 {
        self.cores.len() as u32
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn cores(&self) -> &[CoreContext] {
        &self.cores
    }

    fn context(&self, core: CoreId) -> &CoreContext {
        // Unknown cores fold onto core 0 rather than indexing out of range
        self.cores.get(core.0 as usize).unwrap_or(&self.cores[0])
    }

    fn home_core(thread: &Thread) -> CoreId {
        thread.lock().last_core.unwrap_or(CoreId(0))
    }

    fn request_reschedule(&self, queue: &mut RunQueue, target: CoreId) {
        if queue.ipi_pending {
            return;
        }
        queue.ipi_pending = true;
        self.outbox.lock().push(IpiRequest {
            target,
            ipi: Ipi::Reschedule,
        });
    }

    /// Queue a halt for every core.
    pub fn request_halt_all(&self) {
        let mut outbox = self.outbox.lock();
        for core in &self.cores {
            outbox.push(IpiRequest {
                target: core.id,
                ipi: Ipi::Halt,
            });
        }
    }

    /// Drain IPIs waiting for delivery.
    pub fn take_ipis(&self) -> Vec<IpiRequest> {
        core::mem::take(&mut *self.outbox.lock())
    }

    // ========================================================================
    // Queue management
    // ========================================================================

    /// Admit a new thread on the least loaded core.
    pub fn enqueue_new(&self, thread: &Arc<Thread>) -> CoreId {
        let target = self
            .cores
            .iter()
            .min_by_key(|core| core.queue.lock().load())
            .map(|core| core.id)
            .unwrap_or(CoreId(0));

        let ctx = self.context(target);
        let mut queue = ctx.queue.lock();
        {
            let mut inner = thread.lock();
            inner.transition(thread.tid(), ThreadState::Ready);
            inner.last_core = Some(target);
        }
        queue.enqueue(thread.clone());
        if queue.should_preempt(thread) {
            self.request_reschedule(&mut queue, target);
        }
        target
    }

    /// Start a new wait for `thread`, invalidating wakes for older waits.
    pub fn prepare_wait(&self, thread: &Thread) -> u64 {
        let mut inner = thread.lock();
        inner.wait_seq += 1;
        inner.wake = None;
        inner.wait_seq
    }

    /// Take the running thread off the CPU until woken or until
    /// `deadline`.
    pub fn block(&self, thread: &Arc<Thread>, seq: u64, deadline: Option<u64>) -> BlockOutcome {
        self.suspend(
            thread,
            seq,
            deadline,
            ThreadState::Blocked,
            TimerKind::WaitTimeout,
        )
    }

    /// Put the running thread to sleep until `deadline`.
    pub fn sleep(&self, thread: &Arc<Thread>, deadline: u64) -> BlockOutcome {
        let seq = self.prepare_wait(thread);
        self.suspend(
            thread,
            seq,
            Some(deadline),
            ThreadState::Sleeping,
            TimerKind::Sleep,
        )
    }

    fn suspend(
        &self,
        thread: &Arc<Thread>,
        seq: u64,
        deadline: Option<u64>,
        state: ThreadState,
        kind: TimerKind,
    ) -> BlockOutcome {
        let core = Self::home_core(thread);
        let ctx = self.context(core);
        {
            let mut queue = ctx.queue.lock();
            let mut inner = thread.lock();
            if inner.wait_seq != seq || inner.wake.is_some() {
                return BlockOutcome::AlreadyWoken;
            }
            if inner.has_pending_interrupt() {
                inner.wake = Some(WakeReason::Interrupted);
                return BlockOutcome::AlreadyWoken;
            }
            inner.transition(thread.tid(), state);
            inner.deadline = deadline;
            drop(inner);
            self.request_reschedule(&mut queue, core);
        }

        if let Some(deadline) = deadline {
            self.timers.lock().insert(
                (deadline, thread.tid()),
                TimerEntry {
                    thread: thread.clone(),
                    seq,
                    kind,
                },
            );
        }
        BlockOutcome::Blocked
    }

    /// Drop the pending timer of a finished wait or sleep.
    pub fn cancel_timer(&self, thread: &Thread) {
        let deadline = thread.lock().deadline.take();
        if let Some(deadline) = deadline {
            self.timers.lock().remove(&(deadline, thread.tid()));
        }
    }

    /// Zero the running thread's quantum and ask for a reschedule.
    pub fn yield_now(&self, core: CoreId) {
        let ctx = self.context(core);
        let mut queue = ctx.queue.lock();
        if let Some(current) = queue.current.clone() {
            current.lock().time_slice = 0;
        }
        self.request_reschedule(&mut queue, core);
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Timer interrupt on `core` at time `now`. Returns whether the core
    /// should reschedule.
    pub fn tick(&self, core: CoreId, now: u64) -> bool {
        self.fire_timers(now);

        let ctx = self.context(core);
        let mut queue = ctx.queue.lock();
        let Some(current) = queue.current.clone() else {
            return true;
        };
        if current.is_idle() {
            queue.idle_ticks += 1;
            return !queue.ready.is_empty();
        }

        let mut inner = current.lock();
        inner.time_slice = inner.time_slice.saturating_sub(1);
        inner.time_slice == 0 || inner.kill_pending || inner.state != ThreadState::Running
    }

    /// Wake every sleeper and waiter whose deadline is at or before `now`.
    pub fn fire_timers(&self, now: u64) -> usize {
        let expired: Vec<TimerEntry> = {
            let mut timers = self.timers.lock();
            let later = timers.split_off(&(now.saturating_add(1), ThreadId(0)));
            core::mem::replace(&mut *timers, later)
                .into_values()
                .collect()
        };

        expired
            .into_iter()
            .filter(|entry| {
                let reason = match entry.kind {
                    TimerKind::Sleep => WakeReason::Deadline,
                    TimerKind::WaitTimeout => WakeReason::TimedOut,
                };
                self.wake(&entry.thread, entry.seq, reason)
            })
            .count()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.lock().keys().next().map(|(deadline, _)| *deadline)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Pick what `core` runs next.
    ///
    /// The current thread keeps the CPU unless its quantum is spent, it
    /// stopped running, or a higher-priority thread is waiting. Threads with
    /// a kill pending die here and are returned in `reaped`.
    pub fn schedule(&self, core: CoreId) -> Dispatch {
        let ctx = self.context(core);
        let mut queue = ctx.queue.lock();
        queue.ipi_pending = false;
        let mut reaped = Vec::new();

        if let Some(prev) = queue.current.take() {
            let mut inner = prev.lock();
            if prev.is_idle() {
                inner.transition(prev.tid(), ThreadState::Ready);
            } else if inner.kill_pending && inner.state != ThreadState::Dead {
                inner.transition(prev.tid(), ThreadState::Dead);
                drop(inner);
                reaped.push(prev);
            } else if inner.state == ThreadState::Running {
                let outranked = queue
                    .ready
                    .front()
                    .is_some_and(|next| next.priority() > prev.priority());
                if inner.time_slice > 0 && !outranked {
                    drop(inner);
                    queue.current = Some(prev.clone());
                    return Dispatch {
                        thread: prev,
                        reaped,
                    };
                }
                inner.transition(prev.tid(), ThreadState::Ready);
                drop(inner);
                queue.enqueue(prev);
            }
        }

        while let Some(next) = queue.ready.pop_front() {
            let mut inner = next.lock();
            if inner.kill_pending {
                inner.transition(next.tid(), ThreadState::Dead);
                drop(inner);
                reaped.push(next);
                continue;
            }
            inner.transition(next.tid(), ThreadState::Running);
            inner.time_slice = self.quantum;
            inner.last_core = Some(core);
            drop(inner);
            queue.dispatches += 1;
            queue.current = Some(next.clone());
            return Dispatch {
                thread: next,
                reaped,
            };
        }

        ctx.idle.lock().transition(ctx.idle.tid(), ThreadState::Running);
        queue.current = Some(ctx.idle.clone());
        Dispatch {
            thread: ctx.idle.clone(),
            reaped,
        }
    }

    /// Handle an IPI vector on `core`. A reschedule dispatches at once.
    pub fn handle_ipi(&self, core: CoreId, ipi: Ipi) -> Option<Dispatch> {
        match ipi {
            Ipi::Reschedule => Some(self.schedule(core)),
            Ipi::Halt => None,
        }
    }

    /// Thread running on `core` (possibly the idle thread)
    pub fn current(&self, core: CoreId) -> Option<Arc<Thread>> {
        self.context(core).queue.lock().current.clone()
    }

    pub fn load(&self, core: CoreId) -> usize {
        self.context(core).queue.lock().load()
    }

    pub fn ready_threads(&self, core: CoreId) -> Vec<Arc<Thread>> {
        self.context(core).queue.lock().ready.iter().cloned().collect()
    }

    pub fn stats(&self) -> Vec<CoreStats> {
        self.cores
            .iter()
            .map(|ctx| {
                let queue = ctx.queue.lock();
                CoreStats {
                    core: ctx.id,
                    ready: queue.ready.len(),
                    dispatches: queue.dispatches,
                    idle_ticks: queue.idle_ticks,
                    running_idle: queue.current.as_ref().is_some_and(|t| t.is_idle()),
                }
            })
            .collect()
    }

    // ========================================================================
    // Signals and termination
    // ========================================================================

    /// Post signal `bit`. An active wait or sleep is interrupted.
    pub fn signal_thread(&self, thread: &Arc<Thread>, bit: u32) {
        let seq = {
            let mut inner = thread.lock();
            inner.pending_signals |= 1u64 << (bit % 64);
            inner.wait_seq
        };
        self.wake(thread, seq, WakeReason::Interrupted);
    }

    /// Terminate `thread`. Threads not on a CPU die immediately; a running
    /// thread dies at its core's next scheduling point.
    pub fn terminate(&self, thread: &Arc<Thread>) -> Termination {
        let core = Self::home_core(thread);
        let ctx = self.context(core);
        let record = {
            let mut queue = ctx.queue.lock();
            let mut inner = thread.lock();
            match inner.state {
                ThreadState::Dead => return Termination::AlreadyDead,
                ThreadState::Running => {
                    inner.kill_pending = true;
                    drop(inner);
                    self.request_reschedule(&mut queue, core);
                    return Termination::Deferred(core);
                }
                ThreadState::Ready => {
                    queue.remove(thread);
                }
                ThreadState::New | ThreadState::Blocked | ThreadState::Sleeping => {}
            }
            inner.kill_pending = true;
            inner.transition(thread.tid(), ThreadState::Dead);
            inner.wait.take()
        };

        if let Some(record) = record {
            record.cancel();
        }
        self.cancel_timer(thread);
        Termination::Immediate
    }
}

impl Wake for Scheduler {
    /// Make a blocked or sleeping thread ready on its home core.
    ///
    /// A wake that races ahead of `block` is recorded on the thread, and
    /// `block` then returns `AlreadyWoken`. Wakes for an older wait
    /// sequence, or after a wake was already delivered, are ignored.
    fn wake(&self, thread: &Arc<Thread>, seq: u64, reason: WakeReason) -> bool {
        let core = Self::home_core(thread);
        let ctx = self.context(core);
        let mut queue = ctx.queue.lock();
        let mut inner = thread.lock();
        if inner.wait_seq != seq || inner.wake.is_some() {
            return false;
        }
        match inner.state {
            ThreadState::Blocked | ThreadState::Sleeping => {
                inner.wake = Some(reason);
                inner.transition(thread.tid(), ThreadState::Ready);
                drop(inner);
                queue.enqueue(thread.clone());
                if queue.should_preempt(thread) {
                    self.request_reschedule(&mut queue, core);
                }
                true
            }
            ThreadState::New | ThreadState::Ready | ThreadState::Running => {
                inner.wake = Some(reason);
                true
            }
            ThreadState::Dead => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, RegisterContext};
    use crate::types::ProcessId;

    fn thread(tid: u64, priority: Priority) -> Arc<Thread> {
        Thread::new(
            ThreadId(tid),
            ProcessId(1),
            priority,
            RegisterContext::default(),
        )
    }

    // ========================================================================
    // Placement and dispatch
    // ========================================================================

    #[test]
    fn test_new_threads_spread_to_shortest_queue() {
        let sched = Scheduler::new(2, 5);
        let a = thread(1, Priority::Normal);
        let b = thread(2, Priority::Normal);
        let c = thread(3, Priority::Normal);

        assert_eq!(sched.enqueue_new(&a), CoreId(0));
        assert_eq!(sched.enqueue_new(&b), CoreId(1));
        assert_eq!(sched.enqueue_new(&c), CoreId(0));
        assert_eq!(sched.load(CoreId(0)), 2);
    }

    #[test]
    fn test_enqueue_requests_reschedule_of_idle_core() {
        let sched = Scheduler::new(2, 5);
        sched.schedule(CoreId(0));
        sched.schedule(CoreId(1));
        sched.enqueue_new(&thread(1, Priority::Normal));

        assert_eq!(
            sched.take_ipis(),
            [IpiRequest {
                target: CoreId(0),
                ipi: Ipi::Reschedule
            }]
        );
    }

    #[test]
    fn test_empty_queue_runs_idle() {
        let sched = Scheduler::new(1, 5);
        let dispatch = sched.schedule(CoreId(0));
        assert!(dispatch.thread.is_idle());
        assert_eq!(dispatch.thread.state(), ThreadState::Running);
    }

    #[test]
    fn test_dispatch_refills_quantum() {
        let sched = Scheduler::new(1, 3);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);

        let dispatch = sched.schedule(CoreId(0));
        assert!(Arc::ptr_eq(&dispatch.thread, &t));
        assert_eq!(t.lock().time_slice, 3);
        assert_eq!(t.state(), ThreadState::Running);
    }

    #[test]
    fn test_quantum_expiry_round_robins() {
        let sched = Scheduler::new(1, 2);
        let a = thread(1, Priority::Normal);
        let b = thread(2, Priority::Normal);
        sched.enqueue_new(&a);
        sched.enqueue_new(&b);

        assert!(Arc::ptr_eq(&sched.schedule(CoreId(0)).thread, &a));
        assert!(!sched.tick(CoreId(0), 1));
        assert!(sched.tick(CoreId(0), 2));

        let next = sched.schedule(CoreId(0)).thread;
        assert!(Arc::ptr_eq(&next, &b));
        assert_eq!(a.state(), ThreadState::Ready);
        assert_eq!(sched.ready_threads(CoreId(0)).len(), 1);
    }

    #[test]
    fn test_current_keeps_cpu_with_quantum_left() {
        let sched = Scheduler::new(1, 5);
        let a = thread(1, Priority::Normal);
        let b = thread(2, Priority::Normal);
        sched.enqueue_new(&a);
        sched.enqueue_new(&b);

        sched.schedule(CoreId(0));
        assert!(Arc::ptr_eq(&sched.schedule(CoreId(0)).thread, &a));
    }

    #[test]
    fn test_higher_priority_runs_first() {
        let sched = Scheduler::new(1, 5);
        let low = thread(1, Priority::Low);
        let high = thread(2, Priority::High);
        sched.enqueue_new(&low);
        sched.enqueue_new(&high);

        assert!(Arc::ptr_eq(&sched.schedule(CoreId(0)).thread, &high));
    }

    #[test]
    fn test_yield_zeroes_quantum_and_requests_self_ipi() {
        let sched = Scheduler::new(1, 5);
        let a = thread(1, Priority::Normal);
        let b = thread(2, Priority::Normal);
        sched.enqueue_new(&a);
        sched.enqueue_new(&b);
        sched.schedule(CoreId(0));
        sched.take_ipis();

        sched.yield_now(CoreId(0));
        assert_eq!(a.lock().time_slice, 0);
        assert_eq!(sched.take_ipis()[0].target, CoreId(0));

        let dispatch = sched.handle_ipi(CoreId(0), Ipi::Reschedule).unwrap();
        assert!(Arc::ptr_eq(&dispatch.thread, &b));
    }

    // ========================================================================
    // Blocking and waking
    // ========================================================================

    #[test]
    fn test_block_then_wake_makes_ready() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));

        let seq = sched.prepare_wait(&t);
        assert_eq!(sched.block(&t, seq, None), BlockOutcome::Blocked);
        assert_eq!(t.state(), ThreadState::Blocked);
        assert!(sched.schedule(CoreId(0)).thread.is_idle());

        assert!(sched.wake(&t, seq, WakeReason::Interrupted));
        assert_eq!(t.state(), ThreadState::Ready);
        assert!(Arc::ptr_eq(&sched.schedule(CoreId(0)).thread, &t));
        assert_eq!(t.lock().wake, Some(WakeReason::Interrupted));
    }

    #[test]
    fn test_wake_before_block_is_not_lost() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));

        let seq = sched.prepare_wait(&t);
        assert!(sched.wake(&t, seq, WakeReason::Interrupted));
        assert_eq!(sched.block(&t, seq, None), BlockOutcome::AlreadyWoken);
        assert_eq!(t.state(), ThreadState::Running);
    }

    #[test]
    fn test_stale_wake_ignored() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));

        let old = sched.prepare_wait(&t);
        let seq = sched.prepare_wait(&t);
        sched.block(&t, seq, None);
        assert!(!sched.wake(&t, old, WakeReason::Interrupted));
        assert_eq!(t.state(), ThreadState::Blocked);
    }

    #[test]
    fn test_wait_timeout_fires_from_tick() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));

        let seq = sched.prepare_wait(&t);
        sched.block(&t, seq, Some(1_000));
        sched.schedule(CoreId(0));
        assert_eq!(sched.next_deadline(), Some(1_000));

        sched.tick(CoreId(0), 999);
        assert_eq!(t.state(), ThreadState::Blocked);
        sched.tick(CoreId(0), 1_000);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.lock().wake, Some(WakeReason::TimedOut));
        assert_eq!(sched.next_deadline(), None);
    }

    #[test]
    fn test_sleep_completes_at_deadline() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));

        assert_eq!(sched.sleep(&t, 500), BlockOutcome::Blocked);
        assert_eq!(t.state(), ThreadState::Sleeping);
        assert_eq!(sched.fire_timers(500), 1);
        assert_eq!(t.lock().wake, Some(WakeReason::Deadline));
    }

    #[test]
    fn test_signal_interrupts_sleep() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));
        sched.sleep(&t, 10_000);

        sched.signal_thread(&t, 2);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.lock().pending_signals, 1 << 2);
        assert_eq!(t.lock().wake, Some(WakeReason::Interrupted));
    }

    #[test]
    fn test_pending_signal_prevents_block() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));
        t.lock().pending_signals = 1;

        let seq = sched.prepare_wait(&t);
        assert_eq!(sched.block(&t, seq, None), BlockOutcome::AlreadyWoken);
        assert_eq!(t.lock().wake, Some(WakeReason::Interrupted));
    }

    #[test]
    fn test_cross_core_wake_targets_home_core() {
        let sched = Scheduler::new(2, 5);
        let a = thread(1, Priority::Normal);
        let b = thread(2, Priority::Normal);
        sched.enqueue_new(&a);
        sched.enqueue_new(&b);
        sched.schedule(CoreId(0));
        sched.schedule(CoreId(1));

        let seq = sched.prepare_wait(&b);
        sched.block(&b, seq, None);
        sched.schedule(CoreId(1));
        sched.take_ipis();

        // Core 0 wakes a thread homed on idle core 1
        assert!(sched.wake(&b, seq, WakeReason::Interrupted));
        assert_eq!(
            sched.take_ipis(),
            [IpiRequest {
                target: CoreId(1),
                ipi: Ipi::Reschedule
            }]
        );
        let dispatch = sched.handle_ipi(CoreId(1), Ipi::Reschedule).unwrap();
        assert!(Arc::ptr_eq(&dispatch.thread, &b));
    }

    // ========================================================================
    // Termination
    // ========================================================================

    #[test]
    fn test_terminate_ready_thread_is_immediate() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);

        assert_eq!(sched.terminate(&t), Termination::Immediate);
        assert_eq!(t.state(), ThreadState::Dead);
        assert!(sched.ready_threads(CoreId(0)).is_empty());
        assert_eq!(sched.terminate(&t), Termination::AlreadyDead);
    }

    #[test]
    fn test_terminate_running_thread_is_deferred() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));

        assert_eq!(sched.terminate(&t), Termination::Deferred(CoreId(0)));
        assert_eq!(t.state(), ThreadState::Running);

        let dispatch = sched.schedule(CoreId(0));
        assert!(dispatch.thread.is_idle());
        assert_eq!(dispatch.reaped.len(), 1);
        assert_eq!(t.state(), ThreadState::Dead);
    }

    #[test]
    fn test_terminate_sleeper_drops_timer() {
        let sched = Scheduler::new(1, 5);
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));
        sched.sleep(&t, 1_000);

        assert_eq!(sched.terminate(&t), Termination::Immediate);
        assert_eq!(sched.next_deadline(), None);
        assert_eq!(sched.fire_timers(2_000), 0);
    }

    #[test]
    fn test_parallel_wakes_deliver_once() {
        use std::thread as os_thread;

        let sched = Arc::new(Scheduler::new(2, 5));
        let t = thread(1, Priority::Normal);
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));
        let seq = sched.prepare_wait(&t);
        sched.block(&t, seq, None);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sched = sched.clone();
                let t = t.clone();
                os_thread::spawn(move || sched.wake(&t, seq, WakeReason::Interrupted))
            })
            .collect();
        let delivered = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|d| *d)
            .count();

        assert_eq!(delivered, 1);
        assert_eq!(sched.ready_threads(CoreId(0)).len(), 1);
    }
}
