//! Syscall definitions and types
//!
//! This module contains:
//! - Canonical syscall number constants (ABI)
//! - `Errno` and the single `KernelError` to errno translation
//! - `Syscall` enum for type-safe dispatch
//! - `SyscallOutcome`, what the trap handler does next

use kestrel_core::{HandleId, KernelError, ProcessId, Prot, VirtAddr};

// ============================================================================
// Canonical Syscall Numbers
// ============================================================================

/// Syscall numbers. Arguments arrive in five registers, the result in one.
pub mod numbers {
    // === Misc ===
    pub const SYS_DEBUG: u64 = 0x01;
    pub const SYS_YIELD: u64 = 0x02;
    pub const SYS_EXIT: u64 = 0x03;
    pub const SYS_GET_TIME: u64 = 0x04;
    pub const SYS_SLEEP: u64 = 0x05;
    pub const SYS_GETPID: u64 = 0x06;
    pub const SYS_GETTID: u64 = 0x07;

    // === Memory ===
    pub const SYS_MMAP: u64 = 0x10;
    pub const SYS_MUNMAP: u64 = 0x11;

    // === Processes and threads ===
    pub const SYS_FORK: u64 = 0x20;
    pub const SYS_KILL: u64 = 0x21;
    pub const SYS_CREATE_THREAD: u64 = 0x22;
    pub const SYS_OPEN_PROCESS: u64 = 0x23;
    pub const SYS_REAP: u64 = 0x24;
    pub const SYS_SIGNAL: u64 = 0x25;
    pub const SYS_EXIT_THREAD: u64 = 0x26;

    // === Handles and objects ===
    pub const SYS_CLOSE: u64 = 0x30;
    pub const SYS_DUP: u64 = 0x31;
    pub const SYS_CREATE_EVENT: u64 = 0x32;
    pub const SYS_SIGNAL_EVENT: u64 = 0x33;
    pub const SYS_RESET_EVENT: u64 = 0x34;
    pub const SYS_WAIT: u64 = 0x35;
    pub const SYS_TRANSFER_HANDLE: u64 = 0x36;
}

use numbers::*;

/// Largest message `SYS_DEBUG` copies in
pub const MAX_DEBUG_LEN: usize = 4096;

/// Most handles one `SYS_WAIT` may name
pub const MAX_WAIT_HANDLES: usize = 64;

/// `SYS_WAIT` timeout meaning "no deadline"
pub const WAIT_FOREVER: u64 = u64::MAX;

/// `SYS_MMAP` flag: memory stays shared with children across fork
pub const MMAP_SHARED: u64 = 1 << 0;

/// `SYS_CREATE_EVENT` flag: the event resets after waking its waiters
pub const EVENT_AUTO_RESET: u64 = 1 << 0;

// ============================================================================
// Errno
// ============================================================================

/// Error numbers as seen by user space (returned negated)
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i64)]
pub enum Errno {
    EPERM = 1,
    ESRCH = 3,
    EINTR = 4,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EFAULT = 14,
    EEXIST = 17,
    EINVAL = 22,
    EMFILE = 24,
    ENOSYS = 38,
    ETIMEDOUT = 110,
}

impl Errno {
    /// The value placed in the result register.
    pub fn as_result(self) -> i64 {
        -(self as i64)
    }
}

/// Translation to user-visible error numbers
pub trait ToErrno {
    fn errno(&self) -> Errno;
}

impl ToErrno for KernelError {
    fn errno(&self) -> Errno {
        match self {
            KernelError::OutOfMemory | KernelError::Fragmented => Errno::ENOMEM,
            KernelError::BadAddress(_) => Errno::EFAULT,
            KernelError::AddressInUse(_) => Errno::EEXIST,
            KernelError::InvalidArgument | KernelError::WrongType { .. } => Errno::EINVAL,
            KernelError::BadHandle(_) => Errno::EBADF,
            KernelError::TooManyHandles => Errno::EMFILE,
            KernelError::NoSuchProcess(_) | KernelError::NoSuchThread(_) => Errno::ESRCH,
            KernelError::StillRunning(_) => Errno::EAGAIN,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::TimedOut => Errno::ETIMEDOUT,
            KernelError::NoSuchSyscall(_) => Errno::ENOSYS,
        }
    }
}

// ============================================================================
// Decoded syscalls
// ============================================================================

/// Syscall request from a thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Print `len` bytes at `addr` to the debug console (SYS_DEBUG 0x01)
    Debug { addr: VirtAddr, len: usize },
    /// Give up the rest of the quantum (SYS_YIELD 0x02)
    Yield,
    /// Exit the whole process (SYS_EXIT 0x03)
    Exit { code: i64 },
    /// Nanoseconds since boot (SYS_GET_TIME 0x04)
    GetTime,
    /// Sleep for `nanos` (SYS_SLEEP 0x05)
    Sleep { nanos: u64 },
    /// Caller's process id (SYS_GETPID 0x06)
    GetPid,
    /// Caller's thread id (SYS_GETTID 0x07)
    GetTid,
    /// Map anonymous memory (SYS_MMAP 0x10)
    Mmap {
        addr: Option<VirtAddr>,
        len: usize,
        prot: Prot,
        shared: bool,
    },
    /// Unmap regions inside a range (SYS_MUNMAP 0x11)
    Munmap { addr: VirtAddr, len: usize },
    /// Copy-on-write duplicate of the caller (SYS_FORK 0x20)
    Fork,
    /// Kill the process behind a handle (SYS_KILL 0x21)
    Kill { process: HandleId },
    /// Start another thread in the caller's process (SYS_CREATE_THREAD 0x22)
    CreateThread {
        entry: VirtAddr,
        stack: VirtAddr,
        arg: u64,
    },
    /// Handle to a child process (SYS_OPEN_PROCESS 0x23)
    OpenProcess { pid: ProcessId },
    /// Collect a dead child's exit code (SYS_REAP 0x24)
    Reap {
        process: HandleId,
        status: Option<VirtAddr>,
    },
    /// Post a signal to every thread of a process (SYS_SIGNAL 0x25)
    Signal { process: HandleId, signal: u32 },
    /// End only the calling thread (SYS_EXIT_THREAD 0x26)
    ExitThread { code: i64 },
    /// Close a handle (SYS_CLOSE 0x30)
    Close { handle: HandleId },
    /// Second handle to the same object (SYS_DUP 0x31)
    Dup { handle: HandleId },
    /// New event object (SYS_CREATE_EVENT 0x32)
    CreateEvent { auto_reset: bool },
    /// Raise an event (SYS_SIGNAL_EVENT 0x33)
    SignalEvent { handle: HandleId },
    /// Lower an event (SYS_RESET_EVENT 0x34)
    ResetEvent { handle: HandleId },
    /// Block until one of `count` handles at `handles` signals
    /// (SYS_WAIT 0x35)
    Wait {
        handles: VirtAddr,
        count: usize,
        timeout_ns: Option<u64>,
        interest: u32,
    },
    /// Copy a handle into another process's table (SYS_TRANSFER_HANDLE 0x36)
    TransferHandle { handle: HandleId, target: HandleId },
}

impl Syscall {
    /// Decode a raw syscall number and its argument registers.
    pub fn decode(number: u64, args: [u64; 5]) -> Result<Syscall, KernelError> {
        let [a0, a1, a2, a3, _] = args;
        let syscall = match number {
            SYS_DEBUG => Syscall::Debug {
                addr: VirtAddr(a0),
                len: a1 as usize,
            },
            SYS_YIELD => Syscall::Yield,
            SYS_EXIT => Syscall::Exit { code: a0 as i64 },
            SYS_GET_TIME => Syscall::GetTime,
            SYS_SLEEP => Syscall::Sleep { nanos: a0 },
            SYS_GETPID => Syscall::GetPid,
            SYS_GETTID => Syscall::GetTid,
            SYS_MMAP => Syscall::Mmap {
                addr: (a0 != 0).then_some(VirtAddr(a0)),
                len: a1 as usize,
                prot: Prot::from_bits(a2),
                shared: a3 & MMAP_SHARED != 0,
            },
            SYS_MUNMAP => Syscall::Munmap {
                addr: VirtAddr(a0),
                len: a1 as usize,
            },
            SYS_FORK => Syscall::Fork,
            SYS_KILL => Syscall::Kill {
                process: handle(a0)?,
            },
            SYS_CREATE_THREAD => Syscall::CreateThread {
                entry: VirtAddr(a0),
                stack: VirtAddr(a1),
                arg: a2,
            },
            SYS_OPEN_PROCESS => Syscall::OpenProcess { pid: ProcessId(a0) },
            SYS_REAP => Syscall::Reap {
                process: handle(a0)?,
                status: (a1 != 0).then_some(VirtAddr(a1)),
            },
            SYS_SIGNAL => Syscall::Signal {
                process: handle(a0)?,
                signal: u32::try_from(a1)
                    .ok()
                    .filter(|bit| *bit < 64)
                    .ok_or(KernelError::InvalidArgument)?,
            },
            SYS_EXIT_THREAD => Syscall::ExitThread { code: a0 as i64 },
            SYS_CLOSE => Syscall::Close { handle: handle(a0)? },
            SYS_DUP => Syscall::Dup { handle: handle(a0)? },
            SYS_CREATE_EVENT => Syscall::CreateEvent {
                auto_reset: a0 & EVENT_AUTO_RESET != 0,
            },
            SYS_SIGNAL_EVENT => Syscall::SignalEvent { handle: handle(a0)? },
            SYS_RESET_EVENT => Syscall::ResetEvent { handle: handle(a0)? },
            SYS_WAIT => {
                let count = a1 as usize;
                if count == 0 || count > MAX_WAIT_HANDLES {
                    return Err(KernelError::InvalidArgument);
                }
                Syscall::Wait {
                    handles: VirtAddr(a0),
                    count,
                    timeout_ns: (a2 != WAIT_FOREVER).then_some(a2),
                    interest: a3 as u32,
                }
            }
            SYS_TRANSFER_HANDLE => Syscall::TransferHandle {
                handle: handle(a0)?,
                target: handle(a1)?,
            },
            other => return Err(KernelError::NoSuchSyscall(other)),
        };
        Ok(syscall)
    }
}

fn handle(raw: u64) -> Result<HandleId, KernelError> {
    u32::try_from(raw)
        .map(HandleId)
        .map_err(|_| KernelError::InvalidArgument)
}

// ============================================================================
// Outcome
// ============================================================================

/// What happened to the calling thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Result is in the thread's return register; resume it
    Complete(i64),
    /// The thread is off the CPU; its result is written when it is next
    /// dispatched
    Blocked,
    /// The thread (or its whole process) is gone
    Exited,
}

impl SyscallOutcome {
    pub fn from_result(result: Result<i64, KernelError>) -> Self {
        match result {
            Ok(value) => SyscallOutcome::Complete(value),
            Err(e) => SyscallOutcome::Complete(e.errno().as_result()),
        }
    }
}
