//! Common types for the Axiom layer.
//!
//! Plain integers so the log stays independent of the kernel's newtypes.

/// Process identifier (raw value of the kernel's `ProcessId`)
pub type ProcessId = u64;

/// Thread identifier (raw value of the kernel's `ThreadId`)
pub type ThreadId = u64;

/// Event identifier (monotonic, unique within SysLog)
pub type EventId = u64;
