//! Scheduling points, interrupts and faults
//!
//! This module contains the entry points the trap and interrupt glue calls
//! outside of syscalls:
//! - `schedule()` - pick the next thread and finish its blocked syscall
//! - `timer_tick()` - timer interrupt
//! - `handle_ipi()` - inter-processor interrupt
//! - `page_fault()` - user page fault
//! - `halt_all()` - stop every core

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::dispatch::completion;
use super::{Kernel, Pending};
use crate::syscall::Errno;
use kestrel_core::{
    finish_wait, Access, CoreId, Dispatch, FaultError, Ipi, Thread, ThreadState, VirtAddr,
    KILLED_EXIT_CODE,
};
use kestrel_hal::HAL;

/// Exit code of a process killed by an unresolvable fault
pub const FAULT_EXIT_CODE: i64 = -11;

/// What a core should do after an interrupt
#[derive(Clone, Debug)]
pub enum CoreAction {
    /// Keep running the current thread
    Continue,
    /// Switch to this thread
    Run(Arc<Thread>),
    /// Stop the core
    Halt,
}

/// How a page fault was handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; retry the instruction
    Resolved,
    /// The faulting process was killed
    Killed,
}

impl<H: HAL> Kernel<H> {
    // ========================================================================
    // Scheduling points
    // ========================================================================

    /// Pick what `core` runs next. If the chosen thread was blocked in a
    /// syscall, its result is written to its return register first.
    pub fn schedule(&self, core: CoreId) -> Arc<Thread> {
        let dispatch = self.sched.schedule(core);
        self.after_dispatch(dispatch)
    }

    fn after_dispatch(&self, dispatch: Dispatch) -> Arc<Thread> {
        let Dispatch { thread, reaped } = dispatch;
        self.processes.threads_reaped(&reaped);
        self.drop_dead_pending();
        self.complete_pending(&thread);
        self.deliver_ipis();
        thread
    }

    /// Finish the blocked syscall of `thread`, if it has one.
    fn complete_pending(&self, thread: &Arc<Thread>) {
        let pending = self.pending.lock().remove(&thread.tid());
        let Some(Pending { request, kind, .. }) = pending else {
            return;
        };
        let result = completion(kind, finish_wait(&self.sched, thread));
        thread.lock().context.ret = result;
        self.respond(thread, request, result);
    }

    /// Threads killed while blocked never resume; close their log entries.
    fn drop_dead_pending(&self) {
        let dead: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let tids: Vec<_> = pending
                .iter()
                .filter(|(_, p)| p.thread.state() == ThreadState::Dead)
                .map(|(tid, _)| *tid)
                .collect();
            tids.iter().filter_map(|tid| pending.remove(tid)).collect()
        };
        for entry in dead {
            self.respond(&entry.thread, entry.request, Errno::EINTR.as_result());
        }
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Timer interrupt on `core`: fire due timers and charge the running
    /// thread one tick of its quantum.
    pub fn timer_tick(&self, core: CoreId) -> CoreAction {
        let reschedule = self.sched.tick(core, self.uptime_nanos());
        if reschedule {
            return CoreAction::Run(self.schedule(core));
        }
        self.deliver_ipis();
        CoreAction::Continue
    }

    /// Inter-processor interrupt `vector` arrived on `core`.
    pub fn handle_ipi(&self, core: CoreId, vector: u8) -> CoreAction {
        let Some(ipi) = Ipi::from_vector(vector) else {
            self.hal.debug_write(&format!(
                "[sched] core {}: unknown IPI vector {:#x}",
                core, vector
            ));
            return CoreAction::Continue;
        };
        match self.sched.handle_ipi(core, ipi) {
            Some(dispatch) => CoreAction::Run(self.after_dispatch(dispatch)),
            None if ipi == Ipi::Halt => {
                self.hal.debug_write(&format!("[sched] core {} halting", core));
                CoreAction::Halt
            }
            None => CoreAction::Continue,
        }
    }

    /// Send every IPI the scheduler has queued.
    pub fn deliver_ipis(&self) {
        for request in self.sched.take_ipis() {
            if let Err(e) = self.hal.send_ipi(request.target.0, request.ipi.vector()) {
                self.hal.debug_write(&format!(
                    "[sched] {:?} IPI to core {} failed: {:?}",
                    request.ipi, request.target, e
                ));
            }
        }
    }

    /// Ask every core to stop.
    pub fn halt_all(&self) {
        self.hal.debug_write("[kernel] halting all cores");
        self.sched.request_halt_all();
        self.deliver_ipis();
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// User page fault at `addr` by the thread running on `core`.
    ///
    /// Copy-on-write and demand-zero faults are resolved. Anything else, or
    /// running out of memory while resolving, kills the process.
    pub fn page_fault(&self, core: CoreId, addr: VirtAddr, access: Access) -> FaultOutcome {
        let Some(thread) = self.sched.current(core).filter(|t| !t.is_idle()) else {
            self.hal.halt(&format!(
                "kernel page fault at {:#x} on core {}",
                addr.0, core
            ))
        };
        let Some(process) = self.processes.get(thread.pid()) else {
            return FaultOutcome::Killed;
        };

        let result = process.address_space().handle_page_fault(addr, access);
        let outcome = match result {
            Ok(()) => FaultOutcome::Resolved,
            Err(FaultError::OutOfMemory(e)) => {
                // A fault cannot fail softly, so either action ends in a kill
                self.consult_oom(&thread, None, e.into());
                self.processes.exit_process(&process, KILLED_EXIT_CODE);
                FaultOutcome::Killed
            }
            Err(e) => {
                self.hal.debug_write(&format!(
                    "[mm] pid {} tid {}: {:?} on {:?} at {:#x}",
                    process.pid(),
                    thread.tid(),
                    e,
                    access,
                    addr.0
                ));
                self.processes.exit_process(&process, FAULT_EXIT_CODE);
                FaultOutcome::Killed
            }
        };
        self.deliver_ipis();
        outcome
    }
}
