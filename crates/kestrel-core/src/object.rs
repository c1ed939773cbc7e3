//! Kernel objects, watchers and events
//!
//! A kernel object is anything a process can hold a handle to and wait on.
//! The set is open: subsystems outside the core (pipes, sockets, devices)
//! implement [`KernelObject`] and plug into handles and waits unchanged.
//!
//! # Waiting
//!
//! A waiting thread registers one [`Watcher`] on every object it waits for.
//! When an object signals, each matching watcher asks its [`Wake`]
//! implementation (the scheduler) to make the thread runnable. A watcher
//! carries the wait sequence number it was created for, so a late signal
//! for a finished wait is ignored.
//!
//! # Lifetime
//!
//! Objects are `Arc<dyn KernelObject>`. Handles and watcher registrations
//! hold the strong references; the object's `Drop` runs exactly once, when
//! the last of them goes away.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::ops::{BitAnd, BitOr};
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_sync::{SpinLock, DEFAULT_SPIN_LIMIT};
use serde::{Deserialize, Serialize};

use crate::thread::{Thread, WakeReason};
use crate::types::ObjectId;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh object id. Ids are for logging only and never authority.
pub fn next_object_id() -> ObjectId {
    ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Kind of kernel object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Event,
    Process,
    /// Defined outside the core; the tag is the subsystem's own
    External(u32),
}

/// Set of events a watcher is interested in or an object raised
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READABLE: EventMask = EventMask(1 << 0);
    pub const WRITABLE: EventMask = EventMask(1 << 1);
    pub const SIGNALLED: EventMask = EventMask(1 << 2);
    pub const EXITED: EventMask = EventMask(1 << 3);
    pub const ALL: EventMask = EventMask(0xF);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

// ============================================================================
// Watchers
// ============================================================================

/// Makes a thread runnable again. Implemented by the scheduler.
pub trait Wake: Send + Sync {
    /// Wake `thread` if it is still in wait `seq`. Returns whether this call
    /// delivered the wake.
    fn wake(&self, thread: &Arc<Thread>, seq: u64, reason: WakeReason) -> bool;
}

/// One thread's registration on one or more objects
pub struct Watcher {
    thread: Arc<Thread>,
    seq: u64,
    interest: EventMask,
    fired: SpinLock<Option<(ObjectId, EventMask)>>,
    waker: Arc<dyn Wake>,
}

impl Watcher {
    pub fn new(
        thread: Arc<Thread>,
        seq: u64,
        interest: EventMask,
        waker: Arc<dyn Wake>,
    ) -> Arc<Self> {
        let spin_limit = thread.spin_limit();
        Arc::new(Self {
            thread,
            seq,
            interest,
            fired: SpinLock::with_spin_limit("watcher", spin_limit, None),
            waker,
        })
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn interest(&self) -> EventMask {
        self.interest
    }

    /// First signal delivered to this watcher
    pub fn fired(&self) -> Option<(ObjectId, EventMask)> {
        *self.fired.lock()
    }

    /// Deliver `events` from `source`. Events outside the interest set are
    /// ignored. Returns whether the thread was woken by this call.
    pub fn signal(&self, source: ObjectId, events: EventMask) -> bool {
        let matched = events & self.interest;
        if matched.is_empty() {
            return false;
        }
        {
            let mut fired = self.fired.lock();
            if fired.is_none() {
                *fired = Some((source, matched));
            }
        }
        self.waker.wake(
            &self.thread,
            self.seq,
            WakeReason::Signalled {
                object: source,
                events: matched,
            },
        )
    }
}

/// Watchers registered on one object
#[derive(Default)]
pub struct WatchList {
    watchers: SpinLock<Vec<Arc<Watcher>>>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, watcher: &Arc<Watcher>) {
        self.watchers.lock().push(watcher.clone());
    }

    pub fn remove(&self, watcher: &Watcher) {
        self.watchers
            .lock()
            .retain(|w| !core::ptr::eq(Arc::as_ptr(w), watcher));
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.lock().is_empty()
    }

    /// Signal every watcher. The list is snapshotted first so no wake runs
    /// under the list lock. Returns how many threads were woken.
    pub fn signal(&self, source: ObjectId, events: EventMask) -> usize {
        let snapshot: Vec<Arc<Watcher>> = self.watchers.lock().clone();
        snapshot
            .iter()
            .filter(|watcher| watcher.signal(source, events))
            .count()
    }

    /// Signal watchers in registration order until one wakes its thread.
    pub fn signal_one(&self, source: ObjectId, events: EventMask) -> bool {
        let snapshot: Vec<Arc<Watcher>> = self.watchers.lock().clone();
        snapshot.iter().any(|watcher| watcher.signal(source, events))
    }
}

// ============================================================================
// Kernel object interface
// ============================================================================

/// Anything that can sit in a handle table and be waited on.
pub trait KernelObject: Any + Send + Sync {
    fn object_id(&self) -> ObjectId;

    fn object_type(&self) -> ObjectType;

    /// Register interest. Objects that are always ready signal at once.
    fn watch(&self, watcher: &Arc<Watcher>, interest: EventMask) {
        watcher.signal(self.object_id(), interest);
    }

    fn unwatch(&self, _watcher: &Watcher) {}

    fn as_any(&self) -> &dyn Any;

    /// Owned downcast support for typed handle lookups
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Kernel objects whose type is known statically
pub trait TypedObject: KernelObject {
    const TYPE: ObjectType;
}

/// Watchers registered by an in-progress wait
pub struct WaitRecord {
    pub watcher: Arc<Watcher>,
    pub targets: Vec<Arc<dyn KernelObject>>,
}

impl WaitRecord {
    /// Deregister from every target.
    pub fn cancel(&self) {
        for target in &self.targets {
            target.unwatch(&self.watcher);
        }
    }

    /// Position of `object` among the targets
    pub fn index_of(&self, object: ObjectId) -> Option<usize> {
        self.targets.iter().position(|t| t.object_id() == object)
    }
}

// ============================================================================
// Event
// ============================================================================

/// How an event behaves after it wakes a waiter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetMode {
    /// Stays signalled until reset
    Sticky,
    /// Consumed by the waiter it releases
    Auto,
}

/// Signalable synchronization object
pub struct Event {
    id: ObjectId,
    mode: ResetMode,
    signalled: SpinLock<bool>,
    watchers: WatchList,
}

impl Event {
    pub fn new(mode: ResetMode) -> Arc<Self> {
        Self::with_spin_limit(mode, DEFAULT_SPIN_LIMIT)
    }

    pub fn with_spin_limit(mode: ResetMode, spin_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            id: next_object_id(),
            mode,
            signalled: SpinLock::with_spin_limit("event", spin_limit, false),
            watchers: WatchList::new(),
        })
    }

    pub fn mode(&self) -> ResetMode {
        self.mode
    }

    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Raise the event. Returns how many waiters were woken.
    ///
    /// A sticky event wakes every waiter and stays signalled. An auto-reset
    /// event releases at most one waiter, the earliest registered, and is
    /// consumed by it; with no waiter it stays signalled until the next
    /// wait.
    pub fn signal(&self) -> usize {
        match self.mode {
            ResetMode::Sticky => {
                *self.signalled.lock() = true;
                self.watchers.signal(self.id, EventMask::SIGNALLED)
            }
            ResetMode::Auto => {
                let mut signalled = self.signalled.lock();
                let woke = self.watchers.signal_one(self.id, EventMask::SIGNALLED);
                *signalled = !woke;
                usize::from(woke)
            }
        }
    }

    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

impl KernelObject for Event {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Event
    }

    fn watch(&self, watcher: &Arc<Watcher>, interest: EventMask) {
        let mut signalled = self.signalled.lock();
        if *signalled && interest.intersects(EventMask::SIGNALLED) {
            // An auto-reset event is consumed only by the waiter it releases
            let woke = watcher.signal(self.id, EventMask::SIGNALLED);
            if woke && self.mode == ResetMode::Auto {
                *signalled = false;
            }
            return;
        }
        self.watchers.add(watcher);
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl TypedObject for Event {
    const TYPE: ObjectType = ObjectType::Event;
}
