//! Kernel error taxonomy
//!
//! Subsystems return their own error enums; `KernelError` is what they
//! collapse into on the way up to the syscall layer, which is the only
//! place that turns them into negative integers.

use crate::handle::HandleError;
use crate::object::ObjectType;
use crate::paging::PagingError;
use crate::phys::PhysError;
use crate::types::{HandleId, ProcessId, ThreadId, VirtAddr};

/// Errors reported to kernel clients
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Physical memory exhausted
    OutOfMemory,
    /// Enough free frames, but no contiguous run of the requested size
    Fragmented,
    /// User pointer not mapped or not permitted for the access
    BadAddress(VirtAddr),
    /// Requested virtual range overlaps an existing region
    AddressInUse(VirtAddr),
    /// Malformed argument
    InvalidArgument,
    /// Unknown handle id
    BadHandle(HandleId),
    /// Handle refers to an object of another type
    WrongType {
        handle: HandleId,
        expected: ObjectType,
        actual: ObjectType,
    },
    /// Handle table at capacity
    TooManyHandles,
    /// No such process (or not visible to the caller)
    NoSuchProcess(ProcessId),
    /// No such thread
    NoSuchThread(ThreadId),
    /// Process has not exited yet
    StillRunning(ProcessId),
    /// Wait interrupted by a signal or termination
    Interrupted,
    /// Wait deadline elapsed
    TimedOut,
    /// Unknown syscall number
    NoSuchSyscall(u64),
}

impl From<PhysError> for KernelError {
    fn from(e: PhysError) -> Self {
        match e {
            PhysError::Fragmented { .. } => KernelError::Fragmented,
            PhysError::OutOfMemory { .. } => KernelError::OutOfMemory,
            PhysError::EmptyRequest => KernelError::InvalidArgument,
        }
    }
}

impl From<PagingError> for KernelError {
    fn from(e: PagingError) -> Self {
        match e {
            PagingError::AlreadyMapped(addr) => KernelError::AddressInUse(addr),
            PagingError::Misaligned(_) => KernelError::InvalidArgument,
            PagingError::NonCanonical(addr)
            | PagingError::NotMapped(addr)
            | PagingError::BadAddress(addr) => KernelError::BadAddress(addr),
        }
    }
}

impl From<HandleError> for KernelError {
    fn from(e: HandleError) -> Self {
        match e {
            HandleError::NotFound(id) => KernelError::BadHandle(id),
            HandleError::WrongType {
                handle,
                expected,
                actual,
            } => KernelError::WrongType {
                handle,
                expected,
                actual,
            },
            HandleError::TableFull => KernelError::TooManyHandles,
        }
    }
}
