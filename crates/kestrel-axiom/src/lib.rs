//! Kestrel Axiom Layer
//!
//! Audit trail for the syscall boundary. Every syscall is recorded twice:
//! once when the request enters the kernel, once when its result is
//! delivered. Blocking syscalls may be answered many scheduler ticks after
//! the request, so the two halves are correlated by [`EventId`].

#![no_std]
extern crate alloc;

pub mod syslog;
pub mod types;

pub use syslog::{Outstanding, SysEvent, SysEventKind, SysLog, MAX_SYSLOG_EVENTS};
pub use types::{EventId, ProcessId, ThreadId};
