//! Syscall audit ring
//!
//! A bounded ring of syscall events. Event ids are dense, so the ring can
//! be indexed by id while the id is still retained. A request stays
//! *outstanding* until its response is recorded; for blocking syscalls
//! that can be many scheduler ticks later.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::types::{EventId, ProcessId, ThreadId};

/// Events retained by [`SysLog::new`]
pub const MAX_SYSLOG_EVENTS: usize = 10000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysEvent {
    pub id: EventId,
    pub pid: ProcessId,
    pub tid: ThreadId,
    /// Nanoseconds since boot
    pub at: u64,
    pub kind: SysEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysEventKind {
    /// A thread entered the kernel
    Request { number: u64, args: [u64; 5] },
    /// The result of `request` reached the thread (negative = errno)
    Response { request: EventId, result: i64 },
}

/// A request without a response yet
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Outstanding {
    pub request: EventId,
    pub pid: ProcessId,
    pub tid: ThreadId,
    pub number: u64,
    pub since: u64,
}

pub struct SysLog {
    ring: VecDeque<SysEvent>,
    capacity: usize,
    next_id: EventId,
    /// Events pushed out of the ring so far
    evicted: u64,
    open: BTreeMap<EventId, Outstanding>,
}

impl SysLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SYSLOG_EVENTS)
    }

    /// A ring retaining at most `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 0,
            evicted: 0,
            open: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record a thread entering the kernel. The returned id correlates the
    /// eventual response.
    pub fn log_request(
        &mut self,
        pid: ProcessId,
        tid: ThreadId,
        number: u64,
        args: [u64; 5],
        at: u64,
    ) -> EventId {
        let id = self.append(pid, tid, at, SysEventKind::Request { number, args });
        self.open.insert(
            id,
            Outstanding {
                request: id,
                pid,
                tid,
                number,
                since: at,
            },
        );
        id
    }

    /// Record the result of `request`. Returns `None`, recording nothing, if
    /// the request was never logged or has already been answered.
    pub fn log_response(&mut self, request: EventId, result: i64, at: u64) -> Option<EventId> {
        let open = self.open.remove(&request)?;
        Some(self.append(
            open.pid,
            open.tid,
            at,
            SysEventKind::Response { request, result },
        ))
    }

    fn append(&mut self, pid: ProcessId, tid: ThreadId, at: u64, kind: SysEventKind) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
            self.evicted += 1;
        }
        self.ring.push_back(SysEvent {
            id,
            pid,
            tid,
            at,
            kind,
        });
        id
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Retained events, oldest first
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &SysEvent> + '_ {
        self.ring.iter()
    }

    /// Event `id`, if it is still retained.
    pub fn get(&self, id: EventId) -> Option<&SysEvent> {
        let first = self.ring.front()?.id;
        let index = usize::try_from(id.checked_sub(first)?).ok()?;
        self.ring.get(index)
    }

    /// Result delivered for `request`, if the response is still retained.
    pub fn response_to(&self, request: EventId) -> Option<i64> {
        // Responses always follow their request
        let first = self.ring.front()?.id;
        let skip = usize::try_from(request.saturating_sub(first)).ok()?;
        self.ring.iter().skip(skip).find_map(|e| match e.kind {
            SysEventKind::Response { request: r, result } if r == request => Some(result),
            _ => None,
        })
    }

    /// Requests still waiting for a result, oldest first. Eviction from the
    /// ring does not drop them.
    pub fn outstanding(&self) -> Vec<Outstanding> {
        self.open.values().copied().collect()
    }

    /// Retained events of one process, oldest first
    pub fn for_process(&self, pid: ProcessId) -> impl Iterator<Item = &SysEvent> + '_ {
        self.ring.iter().filter(move |e| e.pid == pid)
    }

    /// The `count` newest events, newest first.
    pub fn recent(&self, count: usize) -> Vec<&SysEvent> {
        self.ring.iter().rev().take(count).collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_closes_request() {
        let mut log = SysLog::new();

        let mmap = log.log_request(1, 7, 0x10, [4096, 3, 0, 0, 0], 1000);
        assert_eq!(log.outstanding().len(), 1);
        assert_eq!(log.response_to(mmap), None);

        let response = log.log_response(mmap, -12, 1100).unwrap();
        assert_eq!(response, mmap + 1);
        assert!(log.outstanding().is_empty());
        assert_eq!(log.response_to(mmap), Some(-12));

        let event = log.get(response).unwrap();
        assert_eq!((event.pid, event.tid), (1, 7));
        assert_eq!(
            log.get(mmap).unwrap().kind,
            SysEventKind::Request {
                number: 0x10,
                args: [4096, 3, 0, 0, 0]
            }
        );
    }

    #[test]
    fn test_duplicate_or_unknown_response_ignored() {
        let mut log = SysLog::new();
        let request = log.log_request(1, 1, 0x02, [0; 5], 0);
        assert!(log.log_response(request, 0, 1).is_some());
        assert!(log.log_response(request, 0, 2).is_none());
        assert!(log.log_response(99, 0, 3).is_none());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_blocked_request_interleaves_with_others() {
        let mut log = SysLog::new();
        let wait = log.log_request(1, 1, 0x35, [0; 5], 0);
        let pid = log.log_request(2, 2, 0x06, [0; 5], 10);
        log.log_response(pid, 2, 11);

        let open = log.outstanding();
        assert_eq!(open.len(), 1);
        assert_eq!((open[0].request, open[0].number), (wait, 0x35));

        log.log_response(wait, -110, 500);
        assert_eq!(log.response_to(wait), Some(-110));
        assert_eq!(log.for_process(1).count(), 2);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut log = SysLog::with_capacity(8);
        for i in 0..13 {
            let id = log.log_request(1, 1, i, [0; 5], i * 100);
            log.log_response(id, 0, i * 100 + 1);
        }

        assert_eq!(log.len(), 8);
        assert_eq!(log.evicted(), 18);
        assert_eq!(log.events().next().unwrap().id, 18);
        assert!(log.get(17).is_none());
        assert_eq!(log.get(25).unwrap().id, 25);

        let recent = log.recent(3);
        assert_eq!(recent[0].id, 25);
        assert_eq!(recent[2].id, 23);
    }

    #[test]
    fn test_outstanding_survives_eviction() {
        let mut log = SysLog::with_capacity(2);
        let sleep = log.log_request(3, 4, 0x05, [1_000, 0, 0, 0, 0], 0);
        for i in 0..4 {
            log.log_request(5, 5, 0x02, [0; 5], i);
        }
        assert!(log.get(sleep).is_none());
        assert_eq!(log.outstanding()[0].request, sleep);
        assert!(log.log_response(sleep, 0, 9).is_some());
    }

    #[test]
    fn test_event_serializes() {
        let mut log = SysLog::new();
        log.log_request(2, 3, 0x01, [1, 2, 3, 4, 5], 50);

        let event = log.get(0).unwrap();
        let json = serde_json::to_string(event).unwrap();
        assert!(json.contains("\"Request\""));
        let back: SysEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, event);
    }
}
