//! Blocking waits on kernel objects
//!
//! A wait is two halves. [`begin_wait`] registers one watcher on every
//! target and, unless something is already signalled, blocks the thread.
//! [`finish_wait`] runs when the thread is back on a CPU: it removes the
//! watcher from every target, cancels the timeout and reports why the wait
//! ended.
//!
//! The watcher is created before the thread blocks and the scheduler keeps
//! early wakes on the thread, so a signal that lands between registration
//! and blocking is never lost.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::object::{EventMask, KernelObject, WaitRecord, Wake, Watcher};
use crate::sched::{BlockOutcome, Scheduler};
use crate::thread::{Thread, WakeReason};

/// Final result of a wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// Target `index` signalled `events`
    Signalled { index: usize, events: EventMask },
    /// The deadline passed first
    TimedOut,
    /// A signal or kill ended the wait
    Interrupted,
}

/// What `begin_wait` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Finished without blocking
    Complete(WaitResult),
    /// The thread is off the CPU; call `finish_wait` once it runs again
    Blocked,
}

/// Start waiting on `targets` for any of `interest`, optionally until
/// `deadline` (nanoseconds).
pub fn begin_wait(
    sched: &Arc<Scheduler>,
    thread: &Arc<Thread>,
    targets: Vec<Arc<dyn KernelObject>>,
    interest: EventMask,
    deadline: Option<u64>,
) -> WaitOutcome {
    {
        let mut inner = thread.lock();
        if inner.has_pending_interrupt() {
            inner.take_signals();
            return WaitOutcome::Complete(WaitResult::Interrupted);
        }
    }

    let seq = sched.prepare_wait(thread);
    let waker: Arc<dyn Wake> = sched.clone();
    let watcher = Watcher::new(thread.clone(), seq, interest, waker);
    for target in &targets {
        target.watch(&watcher, interest);
        if watcher.fired().is_some() {
            break;
        }
    }

    let fired = watcher.fired().is_some();
    thread.lock().wait = Some(WaitRecord { watcher, targets });
    if fired {
        return WaitOutcome::Complete(finish_wait(sched, thread));
    }

    match sched.block(thread, seq, deadline) {
        BlockOutcome::AlreadyWoken => WaitOutcome::Complete(finish_wait(sched, thread)),
        BlockOutcome::Blocked => WaitOutcome::Blocked,
    }
}

/// Tear down the current wait and report how it ended.
///
/// Also used for sleeps, where a reached deadline reads as `TimedOut`.
/// Reporting an interruption delivers the pending signals, so the next wait
/// blocks normally.
pub fn finish_wait(sched: &Scheduler, thread: &Arc<Thread>) -> WaitResult {
    let (record, wake) = {
        let mut inner = thread.lock();
        // Anything still in flight for this wait is now stale
        inner.wait_seq += 1;
        let wake = inner.wake.take();
        if matches!(wake, Some(WakeReason::Interrupted) | None) {
            inner.take_signals();
        }
        (inner.wait.take(), wake)
    };
    sched.cancel_timer(thread);
    if let Some(record) = &record {
        record.cancel();
    }

    match wake {
        Some(WakeReason::Signalled { object, events }) => WaitResult::Signalled {
            index: record
                .as_ref()
                .and_then(|record| record.index_of(object))
                .unwrap_or(0),
            events,
        },
        Some(WakeReason::TimedOut) | Some(WakeReason::Deadline) => WaitResult::TimedOut,
        Some(WakeReason::Interrupted) | None => WaitResult::Interrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Event, ResetMode};
    use crate::thread::{Priority, RegisterContext, ThreadState};
    use crate::types::{CoreId, ProcessId, ThreadId};

    fn running(sched: &Scheduler, tid: u64) -> Arc<Thread> {
        let t = Thread::new(
            ThreadId(tid),
            ProcessId(1),
            Priority::Normal,
            RegisterContext::default(),
        );
        sched.enqueue_new(&t);
        sched.schedule(CoreId(0));
        t
    }

    fn targets(events: &[&Arc<Event>]) -> Vec<Arc<dyn KernelObject>> {
        events
            .iter()
            .map(|e| (*e).clone() as Arc<dyn KernelObject>)
            .collect()
    }

    #[test]
    fn test_already_signalled_completes_immediately() {
        let sched = Arc::new(Scheduler::new(1, 5));
        let t = running(&sched, 1);
        let idle = Event::new(ResetMode::Sticky);
        let ready = Event::new(ResetMode::Sticky);
        ready.signal();

        let outcome = begin_wait(
            &sched,
            &t,
            targets(&[&idle, &ready]),
            EventMask::SIGNALLED,
            None,
        );
        assert_eq!(
            outcome,
            WaitOutcome::Complete(WaitResult::Signalled {
                index: 1,
                events: EventMask::SIGNALLED
            })
        );
        assert_eq!(t.state(), ThreadState::Running);
        assert_eq!(idle.watcher_count(), 0);
    }

    #[test]
    fn test_block_until_signalled() {
        let sched = Arc::new(Scheduler::new(1, 5));
        let t = running(&sched, 1);
        let a = Event::new(ResetMode::Sticky);
        let b = Event::new(ResetMode::Sticky);

        let outcome = begin_wait(&sched, &t, targets(&[&a, &b]), EventMask::SIGNALLED, None);
        assert_eq!(outcome, WaitOutcome::Blocked);
        assert_eq!(t.state(), ThreadState::Blocked);
        assert_eq!(a.watcher_count(), 1);

        assert_eq!(b.signal(), 1);
        assert_eq!(t.state(), ThreadState::Ready);
        sched.schedule(CoreId(0));

        assert_eq!(
            finish_wait(&sched, &t),
            WaitResult::Signalled {
                index: 1,
                events: EventMask::SIGNALLED
            }
        );
        assert_eq!(a.watcher_count(), 0);
        assert_eq!(b.watcher_count(), 0);
    }

    #[test]
    fn test_timeout_ends_wait() {
        let sched = Arc::new(Scheduler::new(1, 5));
        let t = running(&sched, 1);
        let event = Event::new(ResetMode::Sticky);

        let outcome = begin_wait(
            &sched,
            &t,
            targets(&[&event]),
            EventMask::SIGNALLED,
            Some(100_000_000),
        );
        assert_eq!(outcome, WaitOutcome::Blocked);

        sched.tick(CoreId(0), 99_999_999);
        assert_eq!(t.state(), ThreadState::Blocked);
        sched.tick(CoreId(0), 100_000_000);
        assert_eq!(t.state(), ThreadState::Ready);

        assert_eq!(finish_wait(&sched, &t), WaitResult::TimedOut);
        assert_eq!(event.watcher_count(), 0);
    }

    #[test]
    fn test_signal_after_finish_is_stale() {
        let sched = Arc::new(Scheduler::new(1, 5));
        let t = running(&sched, 1);
        let event = Event::new(ResetMode::Auto);

        begin_wait(&sched, &t, targets(&[&event]), EventMask::SIGNALLED, Some(10));
        sched.fire_timers(10);
        sched.schedule(CoreId(0));
        finish_wait(&sched, &t);

        // Nobody is watching any more, so the auto event stays raised
        assert_eq!(event.signal(), 0);
        assert!(event.is_signalled());
        assert_eq!(t.state(), ThreadState::Running);
    }

    #[test]
    fn test_pending_signal_interrupts_before_registering() {
        let sched = Arc::new(Scheduler::new(1, 5));
        let t = running(&sched, 1);
        let event = Event::new(ResetMode::Sticky);
        t.lock().pending_signals = 1;

        let outcome = begin_wait(&sched, &t, targets(&[&event]), EventMask::SIGNALLED, None);
        assert_eq!(outcome, WaitOutcome::Complete(WaitResult::Interrupted));
        assert_eq!(event.watcher_count(), 0);

        // The signal was delivered; the next wait blocks
        let outcome = begin_wait(&sched, &t, targets(&[&event]), EventMask::SIGNALLED, None);
        assert_eq!(outcome, WaitOutcome::Blocked);
        assert_eq!(t.state(), ThreadState::Blocked);
    }

    #[test]
    fn test_interrupted_sleep_consumes_signal_but_not_kill() {
        let sched = Arc::new(Scheduler::new(1, 5));
        let t = running(&sched, 1);
        assert_eq!(sched.sleep(&t, 1_000), BlockOutcome::Blocked);
        sched.signal_thread(&t, 3);
        sched.schedule(CoreId(0));

        assert_eq!(finish_wait(&sched, &t), WaitResult::Interrupted);
        assert_eq!(t.lock().pending_signals, 0);
        assert_eq!(sched.sleep(&t, 2_000), BlockOutcome::Blocked);
        sched.schedule(CoreId(0));

        sched.fire_timers(2_000);
        sched.schedule(CoreId(0));
        assert_eq!(finish_wait(&sched, &t), WaitResult::TimedOut);
        t.lock().kill_pending = true;
        assert_eq!(sched.sleep(&t, 3_000), BlockOutcome::AlreadyWoken);
        assert_eq!(finish_wait(&sched, &t), WaitResult::Interrupted);
        assert!(t.lock().has_pending_interrupt());
    }

    #[test]
    fn test_auto_event_releases_one_waiter_per_signal() {
        let sched = Arc::new(Scheduler::new(2, 5));
        let a = running(&sched, 1);
        let b = Thread::new(
            ThreadId(2),
            ProcessId(1),
            Priority::Normal,
            RegisterContext::default(),
        );
        sched.enqueue_new(&b);
        sched.schedule(CoreId(1));

        let event = Event::new(ResetMode::Auto);
        begin_wait(&sched, &a, targets(&[&event]), EventMask::SIGNALLED, None);
        begin_wait(&sched, &b, targets(&[&event]), EventMask::SIGNALLED, None);

        // Earliest waiter first
        assert_eq!(event.signal(), 1);
        assert_eq!(a.state(), ThreadState::Ready);
        assert_eq!(b.state(), ThreadState::Blocked);
        assert!(!event.is_signalled());

        // The released watcher is still registered but cannot take another
        assert_eq!(event.signal(), 1);
        assert_eq!(b.state(), ThreadState::Ready);
        assert!(!event.is_signalled());

        // Nobody left waiting: the signal is held for the next wait
        assert_eq!(event.signal(), 0);
        assert!(event.is_signalled());
    }
}
