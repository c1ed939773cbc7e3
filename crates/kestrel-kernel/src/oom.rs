//! Out-of-memory policy
//!
//! When a syscall fails for lack of physical memory the runtime asks the
//! installed [`OomPolicy`] what to do before the error reaches user space.

use kestrel_core::{KernelError, PhysStats, ProcessId, ThreadId};

/// What to do about an allocation failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OomAction {
    /// Return `-ENOMEM` to the caller
    FailAllocation,
    /// Kill the requesting process
    KillRequester,
}

/// Everything a policy gets to look at
#[derive(Clone, Copy, Debug)]
pub struct OomContext {
    pub pid: ProcessId,
    pub tid: ThreadId,
    /// Syscall number that failed, or `None` for a page fault
    pub syscall: Option<u64>,
    pub error: KernelError,
    pub stats: PhysStats,
}

/// Pluggable out-of-memory handling
pub trait OomPolicy: Send + Sync {
    fn on_out_of_memory(&self, context: &OomContext) -> OomAction;

    fn name(&self) -> &'static str;
}

/// Report the failure and let the caller cope
#[derive(Clone, Copy, Debug, Default)]
pub struct FailAllocation;

impl OomPolicy for FailAllocation {
    fn on_out_of_memory(&self, _context: &OomContext) -> OomAction {
        OomAction::FailAllocation
    }

    fn name(&self) -> &'static str {
        "fail-allocation"
    }
}

/// Kill whoever asked
#[derive(Clone, Copy, Debug, Default)]
pub struct KillRequester;

impl OomPolicy for KillRequester {
    fn on_out_of_memory(&self, _context: &OomContext) -> OomAction {
        OomAction::KillRequester
    }

    fn name(&self) -> &'static str {
        "kill-requester"
    }
}

/// Whether `error` is a memory exhaustion the policy should see.
pub fn is_exhaustion(error: &KernelError) -> bool {
    matches!(error, KernelError::OutOfMemory | KernelError::Fragmented)
}
