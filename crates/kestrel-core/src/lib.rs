//! Kestrel Kernel Core - HAL-free process and thread execution core
//!
//! This crate holds everything the kernel does that does not touch hardware:
//! physical memory, page tables, VM objects and address spaces, threads and
//! the multi-core scheduler, kernel objects with handles and watchers, and
//! processes.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: time arrives as a nanosecond timestamp and IPIs
//!    leave as [`IpiRequest`] values; `kestrel-kernel` does the rest
//! 2. **Fine-grained locking**: every shared structure sits behind its own
//!    bounded [`kestrel_sync::SpinLock`]; no lock is held across a block
//! 3. **Typed errors**: subsystems return their own error enums, collapsed
//!    into [`KernelError`] on the way to the syscall layer
//! 4. **Checkable**: [`invariants`] states what must hold between operations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      kestrel-core                           │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │     phys      │───▶│    paging     │                   │
//! │   │ frame bitmap  │    │  PageMap tree │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │           │                    │                            │
//! │           ▼                    ▼                            │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │      vm       │───▶│ address_space │                   │
//! │   │ COW VmObject  │    │ regions+fault │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                │                            │
//! │                                ▼                            │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │    process    │───▶│ thread, sched │                   │
//! │   │ spawn / fork  │    │ per-core RQs  │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                                             │
//! │   object / handle / wait: cross-cutting                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      kestrel-kernel                         │
//! │                  (Runtime Wrapper)                          │
//! │                                                             │
//! │   - Syscall decode and errno translation                    │
//! │   - HAL integration (debug output, time, IPIs)              │
//! │   - SysLog audit trail, OOM policy, modules                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers, addresses, protections
//! - `error` - `KernelError` and conversions
//! - `phys` - Physical frame allocator and frame contents
//! - `paging` - Page table entries and the per-space page map
//! - `vm` - VM objects with copy-on-write splitting
//! - `address_space` - Regions, page faults, user copies, fork
//! - `thread` - Thread state machine and saved context
//! - `sched` - Per-core run queues, timers, IPI requests
//! - `object` - Kernel object trait, watchers, events
//! - `handle` - Per-process handle tables
//! - `wait` - Blocking waits on kernel objects
//! - `process` - Processes and the process table
//! - `exec` - Image mapping and the initial user stack
//! - `invariants` - Runtime invariant checks

#![no_std]
#![forbid(unsafe_code)]
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod address_space;
pub mod error;
pub mod exec;
pub mod handle;
pub mod invariants;
pub mod object;
pub mod paging;
pub mod phys;
pub mod process;
pub mod sched;
pub mod thread;
pub mod types;
pub mod vm;
pub mod wait;

// Re-export all public types for convenient access
pub use address_space::{AddressSpace, FaultError, Region, RegionInfo};
pub use error::KernelError;
pub use exec::{ExecutableImage, ProgramHeaders, Segment, StackArgs};
pub use handle::{HandleError, HandleTable};
pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation, KernelView};
pub use object::{
    next_object_id, Event, EventMask, KernelObject, ObjectType, ResetMode, TypedObject,
    WaitRecord, Wake, WatchList, Watcher,
};
pub use paging::{PageFlags, PageMap, PageTableEntry, PagingError};
pub use phys::{FrameAllocator, FrameRange, PhysError, PhysStats, PhysicalMemory};
pub use process::{
    Process, ProcessInfo, ProcessLimits, ProcessState, ProcessTable, SpawnRequest,
    KILLED_EXIT_CODE, USER_STACK_TOP,
};
pub use sched::{
    BlockOutcome, CoreContext, CoreStats, Dispatch, Ipi, IpiRequest, Scheduler, Termination,
};
pub use thread::{Priority, RegisterContext, Thread, ThreadState, WakeReason};
pub use types::{
    pages_for, Access, AddressSpaceId, CoreId, FrameNumber, HandleId, ObjectId, PhysAddr,
    ProcessId, Prot, ThreadId, VirtAddr, VmObjectId, PAGE_SIZE,
};
pub use vm::{VmObject, VmObjectKind};
pub use wait::{begin_wait, finish_wait, WaitOutcome, WaitResult};
