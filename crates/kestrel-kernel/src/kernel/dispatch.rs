//! Syscall handlers
//!
//! `Kernel::dispatch` routes a decoded [`Syscall`] to one `execute_*`
//! function per call. Handlers return `KernelError` on failure; the caller
//! turns it into an errno.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{Caller, Kernel, PendingKind};
use crate::syscall::{Errno, Syscall, SyscallOutcome, MAX_DEBUG_LEN};
use kestrel_core::{
    begin_wait, finish_wait, pages_for, BlockOutcome, Event, EventMask, HandleId, KernelError, KernelObject,
    Process, ProcessId, ProcessState, Prot, ResetMode, VirtAddr, VmObject, WaitOutcome,
    WaitResult, KILLED_EXIT_CODE,
};
use kestrel_hal::HAL;

type SyscallResult = Result<SyscallOutcome, KernelError>;

fn value(v: i64) -> SyscallResult {
    Ok(SyscallOutcome::Complete(v))
}

impl<H: HAL> Kernel<H> {
    pub(super) fn dispatch(&self, caller: &Caller, call: Syscall) -> SyscallResult {
        match call {
            Syscall::Debug { addr, len } => execute_debug(self, caller, addr, len),
            Syscall::Yield => {
                self.sched.yield_now(caller.core);
                value(0)
            }
            Syscall::Exit { code } => {
                self.processes.exit_process(&caller.process, code);
                Ok(SyscallOutcome::Exited)
            }
            Syscall::ExitThread { code } => {
                self.processes.exit_thread(&caller.thread, code);
                Ok(SyscallOutcome::Exited)
            }
            Syscall::GetTime => value(self.uptime_nanos() as i64),
            Syscall::Sleep { nanos } => execute_sleep(self, caller, nanos),
            Syscall::GetPid => value(caller.process.pid().0 as i64),
            Syscall::GetTid => value(caller.thread.tid().0 as i64),
            Syscall::Mmap {
                addr,
                len,
                prot,
                shared,
            } => execute_mmap(caller, addr, len, prot, shared),
            Syscall::Munmap { addr, len } => execute_munmap(caller, addr, len),
            Syscall::Fork => execute_fork(self, caller),
            Syscall::Kill { process } => execute_kill(self, caller, process),
            Syscall::CreateThread { entry, stack, arg } => {
                execute_create_thread(self, caller, entry, stack, arg)
            }
            Syscall::OpenProcess { pid } => execute_open_process(self, caller, pid),
            Syscall::Reap { process, status } => execute_reap(self, caller, process, status),
            Syscall::Signal { process, signal } => execute_signal(self, caller, process, signal),
            Syscall::Close { handle } => {
                let object = caller.process.handles().close(handle)?;
                drop(object);
                value(0)
            }
            Syscall::Dup { handle } => {
                let id = caller.process.handles().duplicate(handle)?;
                value(id.0 as i64)
            }
            Syscall::CreateEvent { auto_reset } => {
                let mode = if auto_reset {
                    ResetMode::Auto
                } else {
                    ResetMode::Sticky
                };
                let event = Event::with_spin_limit(mode, self.config.spin_limit);
                let id = caller.process.handles().insert(event)?;
                value(id.0 as i64)
            }
            Syscall::SignalEvent { handle } => {
                let event = caller.process.handles().get_typed::<Event>(handle)?;
                value(event.signal() as i64)
            }
            Syscall::ResetEvent { handle } => {
                let event = caller.process.handles().get_typed::<Event>(handle)?;
                event.reset();
                value(0)
            }
            Syscall::Wait {
                handles,
                count,
                timeout_ns,
                interest,
            } => execute_wait(self, caller, handles, count, timeout_ns, interest),
            Syscall::TransferHandle { handle, target } => {
                execute_transfer_handle(caller, handle, target)
            }
        }
    }
}

// ============================================================================
// Misc
// ============================================================================

/// SYS_DEBUG: copy the message in and print it tagged with the caller.
fn execute_debug<H: HAL>(
    kernel: &Kernel<H>,
    caller: &Caller,
    addr: VirtAddr,
    len: usize,
) -> SyscallResult {
    if len > MAX_DEBUG_LEN {
        return Err(KernelError::InvalidArgument);
    }
    let mut buf = vec![0u8; len];
    caller.process.address_space().copy_from_user(addr, &mut buf)?;
    let msg = String::from_utf8_lossy(&buf);
    kernel.hal.debug_write(&format!(
        "[{}:{}] {}",
        caller.process.pid(),
        caller.thread.tid(),
        msg.trim_end()
    ));
    value(len as i64)
}

/// SYS_SLEEP: zero nanoseconds is a yield.
fn execute_sleep<H: HAL>(kernel: &Kernel<H>, caller: &Caller, nanos: u64) -> SyscallResult {
    if nanos == 0 {
        kernel.sched.yield_now(caller.core);
        return value(0);
    }
    let deadline = kernel.uptime_nanos().saturating_add(nanos);
    // Parked first: another core may dispatch the thread as soon as it blocks
    kernel.park(caller, PendingKind::Sleep);
    match kernel.sched.sleep(&caller.thread, deadline) {
        BlockOutcome::Blocked => Ok(SyscallOutcome::Blocked),
        BlockOutcome::AlreadyWoken => {
            kernel.unpark(&caller.thread);
            let result = finish_wait(&kernel.sched, &caller.thread);
            value(completion(PendingKind::Sleep, result))
        }
    }
}

/// Result register value for a finished wait or sleep.
pub(super) fn completion(kind: PendingKind, result: WaitResult) -> i64 {
    match (kind, result) {
        (PendingKind::Wait, WaitResult::Signalled { index, .. }) => index as i64,
        (PendingKind::Wait, WaitResult::TimedOut) => Errno::ETIMEDOUT.as_result(),
        (PendingKind::Sleep, WaitResult::TimedOut | WaitResult::Signalled { .. }) => 0,
        (_, WaitResult::Interrupted) => Errno::EINTR.as_result(),
    }
}

// ============================================================================
// Memory
// ============================================================================

/// SYS_MMAP: anonymous memory, private unless `shared`.
fn execute_mmap(
    caller: &Caller,
    addr: Option<VirtAddr>,
    len: usize,
    prot: Prot,
    shared: bool,
) -> SyscallResult {
    let mut space = caller.process.address_space();
    let base = match (addr, shared) {
        (None, false) => space.allocate_anonymous(len, prot)?,
        (Some(addr), false) => space.allocate_anonymous_at(addr, len, prot)?,
        (None, true) => space.allocate_shared(len, prot)?.0,
        (Some(addr), true) => {
            if len == 0 {
                return Err(KernelError::InvalidArgument);
            }
            let object = VmObject::shared(space.physical_memory().clone(), pages_for(len));
            space.map_new(object, Some(addr), prot)?
        }
    };
    value(base.0 as i64)
}

/// SYS_MUNMAP: fails if nothing in the range was mapped.
fn execute_munmap(caller: &Caller, addr: VirtAddr, len: usize) -> SyscallResult {
    let removed = caller.process.address_space().unmap(addr, len)?;
    if removed == 0 {
        return Err(KernelError::InvalidArgument);
    }
    value(0)
}

// ============================================================================
// Processes and threads
// ============================================================================

/// SYS_FORK: the parent gets the child's pid, the child gets 0.
fn execute_fork<H: HAL>(kernel: &Kernel<H>, caller: &Caller) -> SyscallResult {
    let child = kernel.processes.fork(&caller.process, &caller.thread)?;
    kernel.hal.debug_write(&format!(
        "[kernel] pid {} forked pid {}",
        caller.process.pid(),
        child.pid()
    ));
    value(child.pid().0 as i64)
}

/// SYS_KILL: asynchronous; the target dies at its threads' next
/// scheduling points.
fn execute_kill<H: HAL>(kernel: &Kernel<H>, caller: &Caller, process: HandleId) -> SyscallResult {
    let target = caller.process.handles().get_typed::<Process>(process)?;
    if target.state() == ProcessState::Dead {
        return Err(KernelError::NoSuchProcess(target.pid()));
    }
    kernel.processes.exit_process(&target, KILLED_EXIT_CODE);
    kernel.hal.debug_write(&format!(
        "[kernel] pid {} killed pid {}",
        caller.process.pid(),
        target.pid()
    ));
    if Arc::ptr_eq(&target, &caller.process) {
        return Ok(SyscallOutcome::Exited);
    }
    value(0)
}

/// SYS_CREATE_THREAD: same priority as the creator, `arg` in the first
/// argument register.
fn execute_create_thread<H: HAL>(
    kernel: &Kernel<H>,
    caller: &Caller,
    entry: VirtAddr,
    stack: VirtAddr,
    arg: u64,
) -> SyscallResult {
    if let Some(bad) = [entry, stack].into_iter().find(|addr| !addr.is_user()) {
        return Err(KernelError::BadAddress(bad));
    }
    let thread = kernel.processes.create_thread(
        &caller.process,
        entry,
        stack,
        Some(arg),
        caller.thread.priority(),
    )?;
    value(thread.tid().0 as i64)
}

/// SYS_OPEN_PROCESS: only children can be opened.
fn execute_open_process<H: HAL>(
    kernel: &Kernel<H>,
    caller: &Caller,
    pid: ProcessId,
) -> SyscallResult {
    if !caller.process.is_child(pid) {
        return Err(KernelError::NoSuchProcess(pid));
    }
    let child = kernel
        .processes
        .get(pid)
        .ok_or(KernelError::NoSuchProcess(pid))?;
    let id = caller.process.handles().insert(child)?;
    value(id.0 as i64)
}

/// SYS_REAP: store the exit code at `status` (if given) and return the
/// child's pid. The status write happens before the child is dropped so a
/// bad pointer loses nothing.
fn execute_reap<H: HAL>(
    kernel: &Kernel<H>,
    caller: &Caller,
    process: HandleId,
    status: Option<VirtAddr>,
) -> SyscallResult {
    let child = caller.process.handles().get_typed::<Process>(process)?;
    let pid = child.pid();
    if !caller.process.is_child(pid) {
        return Err(KernelError::NoSuchProcess(pid));
    }
    if child.state() != ProcessState::Dead {
        return Err(KernelError::StillRunning(pid));
    }
    if let Some(status) = status {
        let code = child.exit_code().unwrap_or(0);
        caller
            .process
            .address_space()
            .copy_to_user(status, &code.to_le_bytes())?;
    }
    kernel.processes.reap(&caller.process, pid)?;
    value(pid.0 as i64)
}

/// SYS_SIGNAL: post `signal` to every thread of the process.
fn execute_signal<H: HAL>(
    kernel: &Kernel<H>,
    caller: &Caller,
    process: HandleId,
    signal: u32,
) -> SyscallResult {
    let target = caller.process.handles().get_typed::<Process>(process)?;
    if target.state() != ProcessState::Running {
        return Err(KernelError::NoSuchProcess(target.pid()));
    }
    for thread in target.threads() {
        kernel.sched.signal_thread(&thread, signal);
    }
    value(0)
}

// ============================================================================
// Handles and waiting
// ============================================================================

/// SYS_WAIT: block until one handle signals, the timeout passes or a
/// signal arrives. Returns the index of the signalled handle.
fn execute_wait<H: HAL>(
    kernel: &Kernel<H>,
    caller: &Caller,
    handles: VirtAddr,
    count: usize,
    timeout_ns: Option<u64>,
    interest: u32,
) -> SyscallResult {
    let mut raw = vec![0u8; count * 4];
    caller.process.address_space().copy_from_user(handles, &mut raw)?;

    let targets = {
        let table = caller.process.handles();
        raw.chunks_exact(4)
            .map(|id| {
                let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
                table.get(HandleId(id)).map_err(KernelError::from)
            })
            .collect::<Result<Vec<Arc<dyn KernelObject>>, _>>()?
    };
    let interest = match interest {
        0 => EventMask::ALL,
        bits => EventMask(bits),
    };
    let deadline = timeout_ns.map(|t| kernel.uptime_nanos().saturating_add(t));

    kernel.park(caller, PendingKind::Wait);
    match begin_wait(&kernel.sched, &caller.thread, targets, interest, deadline) {
        WaitOutcome::Complete(result) => {
            kernel.unpark(&caller.thread);
            value(completion(PendingKind::Wait, result))
        }
        WaitOutcome::Blocked => Ok(SyscallOutcome::Blocked),
    }
}

/// SYS_TRANSFER_HANDLE: copy `handle` into the process behind `target`.
/// Returns the id in the target's table.
fn execute_transfer_handle(caller: &Caller, handle: HandleId, target: HandleId) -> SyscallResult {
    let (object, process) = {
        let table = caller.process.handles();
        (table.get(handle)?, table.get_typed::<Process>(target)?)
    };
    if process.state() != ProcessState::Running {
        return Err(KernelError::NoSuchProcess(process.pid()));
    }
    let id = process.handles().insert(object)?;
    value(id.0 as i64)
}
