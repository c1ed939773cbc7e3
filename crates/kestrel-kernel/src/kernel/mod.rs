//! Kernel struct - the runtime wrapper around the HAL-free core.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          KERNEL                             │
//! │                                                             │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │                      AXIOM                        │     │
//! │   │   - SysLog: every request and its response        │     │
//! │   └───────────────────────────────────────────────────┘     │
//! │                              │                              │
//! │                              ▼                              │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │                  kestrel-core                     │     │
//! │   │   - Physical memory, address spaces               │     │
//! │   │   - Scheduler, processes, handles                 │     │
//! │   └───────────────────────────────────────────────────┘     │
//! │                              │                              │
//! │                              ▼                              │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │                       HAL                         │     │
//! │   │   - IPIs, time, entropy, debug console            │     │
//! │   └───────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All syscalls flow: `Thread → Kernel::syscall() → SysLog (request) →
//! dispatch → SysLog (response) → Thread`. A blocking syscall logs its
//! response when the thread next runs.
//!
//! Every method takes `&self`: each core enters the kernel on its own and
//! the state underneath is guarded by per-structure spinlocks.

mod dispatch;
mod lifecycle;
mod metrics;

pub use lifecycle::{CoreAction, FaultOutcome, FAULT_EXIT_CODE};
pub use metrics::KernelStats;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{ConfigError, KernelConfig};
use crate::module::{ModuleDescriptor, ModuleError, ModuleRegistry};
use crate::oom::{is_exhaustion, FailAllocation, OomAction, OomContext, OomPolicy};
use crate::syscall::{Errno, Syscall, SyscallOutcome, ToErrno};
use kestrel_axiom::{EventId, SysLog};
use kestrel_core::{
    check_all_invariants, CoreId, ExecutableImage, InvariantViolation, KernelError, KernelView,
    PhysicalMemory, Process, ProcessId, ProcessTable, Scheduler, SpawnRequest, Thread, ThreadId,
    KILLED_EXIT_CODE,
};
use kestrel_hal::HAL;
use kestrel_sync::{SpinLock, SpinLockGuard};

/// What a blocked thread is waiting to be told
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingKind {
    /// `SYS_WAIT`: index of the signalled handle
    Wait,
    /// `SYS_SLEEP`: zero once the deadline passes
    Sleep,
}

/// A blocking syscall whose response is not yet written
struct Pending {
    thread: Arc<Thread>,
    request: EventId,
    kind: PendingKind,
}

/// The thread making a syscall, and where
pub(crate) struct Caller {
    pub core: CoreId,
    pub process: Arc<Process>,
    pub thread: Arc<Thread>,
    pub request: EventId,
}

/// The kernel: core state, HAL, audit log and policy in one place.
pub struct Kernel<H: HAL> {
    hal: H,
    config: KernelConfig,
    phys: Arc<PhysicalMemory>,
    sched: Arc<Scheduler>,
    processes: ProcessTable,
    syslog: SpinLock<SysLog>,
    oom: Box<dyn OomPolicy>,
    modules: SpinLock<ModuleRegistry>,
    pending: SpinLock<BTreeMap<ThreadId, Pending>>,
    boot_time: u64,
}

impl<H: HAL> Kernel<H> {
    /// Bring up the kernel on `hal` with `config`.
    pub fn new(hal: H, config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cores = config.cores.min(hal.core_count()).max(1);
        let boot_time = hal.now_nanos();
        let spin_limit = config.spin_limit;

        let phys = Arc::new(PhysicalMemory::with_spin_limit(config.total_frames, spin_limit));
        let sched = Arc::new(Scheduler::with_spin_limit(cores, config.quantum_ticks, spin_limit));
        let processes = ProcessTable::new(phys.clone(), sched.clone(), config.process_limits());

        hal.debug_write(&format!(
            "[kernel] boot: {} cores, {} frames, quantum {} ticks",
            cores, config.total_frames, config.quantum_ticks
        ));

        Ok(Self {
            syslog: SpinLock::with_spin_limit("syslog", spin_limit, SysLog::new()),
            modules: SpinLock::with_spin_limit("modules", spin_limit, ModuleRegistry::new()),
            pending: SpinLock::with_spin_limit("pending-syscalls", spin_limit, BTreeMap::new()),
            oom: Box::new(FailAllocation),
            hal,
            config,
            phys,
            sched,
            processes,
            boot_time,
        })
    }

    /// Replace the out-of-memory policy.
    pub fn with_oom_policy(mut self, policy: impl OomPolicy + 'static) -> Self {
        self.hal
            .debug_write(&format!("[kernel] OOM policy: {}", policy.name()));
        self.oom = Box::new(policy);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn physical_memory(&self) -> &Arc<PhysicalMemory> {
        &self.phys
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn syslog(&self) -> SpinLockGuard<'_, SysLog> {
        self.syslog.lock()
    }

    pub fn oom_policy(&self) -> &'static str {
        self.oom.name()
    }

    pub fn core_count(&self) -> u32 {
        self.sched.core_count()
    }

    pub fn boot_time(&self) -> u64 {
        self.boot_time
    }

    /// Nanoseconds since boot. All deadlines use this clock.
    pub fn uptime_nanos(&self) -> u64 {
        self.hal.now_nanos().saturating_sub(self.boot_time)
    }

    /// Run every invariant check against the current state.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        check_all_invariants(&KernelView {
            phys: &self.phys,
            sched: &self.sched,
            processes: &self.processes,
        })
    }

    // ========================================================================
    // Process creation
    // ========================================================================

    /// Start `image` as a new process. The AT_RANDOM seed comes from the
    /// HAL's entropy source.
    pub fn spawn_image(
        &self,
        name: &str,
        parent: Option<ProcessId>,
        image: &ExecutableImage,
        argv: &[&str],
        envp: &[&str],
        exec_path: Option<&str>,
    ) -> Result<ProcessId, KernelError> {
        let seed = self.stack_seed();
        let result = self.processes.spawn(&SpawnRequest {
            name,
            parent,
            image,
            argv,
            envp,
            exec_path,
            seed,
        });
        match &result {
            Ok(process) => self.hal.debug_write(&format!(
                "[kernel] spawned {} as pid {}",
                name,
                process.pid()
            )),
            Err(e) => self
                .hal
                .debug_write(&format!("[kernel] spawn of {} failed: {:?}", name, e)),
        }
        self.deliver_ipis();
        result.map(|process| process.pid())
    }

    fn stack_seed(&self) -> [u8; 16] {
        let mut seed = [0u8; 16];
        if let Err(e) = self.hal.random_bytes(&mut seed) {
            self.hal.debug_write(&format!(
                "[kernel] no entropy ({:?}), deriving stack seed from the clock",
                e
            ));
            let now = self.hal.now_nanos();
            seed[..8].copy_from_slice(&now.to_le_bytes());
            let mixed = now.rotate_left(29).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            seed[8..].copy_from_slice(&mixed.to_le_bytes());
        }
        seed
    }

    /// Kill `pid` from outside any syscall.
    pub fn kill_process(&self, pid: ProcessId) -> Result<(), KernelError> {
        self.processes.kill(pid)?;
        self.hal.debug_write(&format!("[kernel] killed pid {}", pid));
        self.deliver_ipis();
        Ok(())
    }

    // ========================================================================
    // Main Syscall Entry Point - ALL syscalls flow through here
    // ========================================================================

    /// Handle syscall `number` made by the thread running on `core`.
    ///
    /// Completed results are also written to the thread's return register.
    /// Negative results are errno values.
    pub fn syscall(&self, core: CoreId, number: u64, args: [u64; 5]) -> SyscallOutcome {
        let Some(thread) = self.sched.current(core).filter(|t| !t.is_idle()) else {
            self.hal.debug_write(&format!(
                "[kernel] syscall {:#x} with no thread on core {}",
                number, core
            ));
            return SyscallOutcome::Complete(Errno::ESRCH.as_result());
        };
        let timestamp = self.uptime_nanos();

        // 1. Log request to SysLog
        let request = self.syslog.lock().log_request(
            thread.pid().0,
            thread.tid().0,
            number,
            args,
            timestamp,
        );

        // 2. Decode and execute
        let result = match self.processes.get(thread.pid()) {
            Some(process) => {
                let caller = Caller {
                    core,
                    process,
                    thread: thread.clone(),
                    request,
                };
                Syscall::decode(number, args)
                    .and_then(|call| self.dispatch(&caller, call))
                    .or_else(|e| self.recover(&caller, number, e))
            }
            None => Err(KernelError::NoSuchProcess(thread.pid())),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => SyscallOutcome::Complete(e.errno().as_result()),
        };

        // 3. Log response; blocked calls respond when they resume
        match outcome {
            SyscallOutcome::Complete(value) => {
                thread.lock().context.ret = value;
                self.respond(&thread, request, value);
            }
            SyscallOutcome::Exited => self.respond(&thread, request, 0),
            SyscallOutcome::Blocked => {}
        }

        self.deliver_ipis();
        outcome
    }

    /// Give the OOM policy a say before an exhaustion error reaches user
    /// space.
    fn recover(
        &self,
        caller: &Caller,
        number: u64,
        error: KernelError,
    ) -> Result<SyscallOutcome, KernelError> {
        if !is_exhaustion(&error) {
            return Err(error);
        }
        match self.consult_oom(&caller.thread, Some(number), error) {
            OomAction::FailAllocation => Err(error),
            OomAction::KillRequester => {
                self.processes.exit_process(&caller.process, KILLED_EXIT_CODE);
                Ok(SyscallOutcome::Exited)
            }
        }
    }

    pub(crate) fn consult_oom(
        &self,
        thread: &Thread,
        syscall: Option<u64>,
        error: KernelError,
    ) -> OomAction {
        let stats = self.phys.stats();
        let action = self.oom.on_out_of_memory(&OomContext {
            pid: thread.pid(),
            tid: thread.tid(),
            syscall,
            error,
            stats,
        });
        self.hal.debug_write(&format!(
            "[mm] out of memory in pid {} ({} of {} frames used): {} -> {:?}",
            thread.pid(),
            stats.used,
            stats.total,
            self.oom.name(),
            action
        ));
        action
    }

    fn respond(&self, thread: &Thread, request: EventId, result: i64) {
        let timestamp = self.uptime_nanos();
        let logged = self.syslog.lock().log_response(request, result, timestamp);
        if logged.is_none() {
            self.hal.debug_write(&format!(
                "[kernel] tid {}: response {} to unknown request {}",
                thread.tid(),
                result,
                request
            ));
        }
    }

    fn park(&self, caller: &Caller, kind: PendingKind) {
        self.pending.lock().insert(
            caller.thread.tid(),
            Pending {
                thread: caller.thread.clone(),
                request: caller.request,
                kind,
            },
        );
    }

    fn unpark(&self, thread: &Thread) {
        self.pending.lock().remove(&thread.tid());
    }

    /// Number of syscalls blocked awaiting completion
    pub fn pending_syscalls(&self) -> usize {
        self.pending.lock().len()
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Load one module. A module whose `init` fails is left unregistered.
    pub fn load_module(&self, module: ModuleDescriptor) -> Result<(), ModuleError> {
        let result = self.modules.lock().load(module);
        match result {
            Ok(()) => self.hal.debug_write(&format!(
                "[module] loaded {}: {}",
                module.name, module.description
            )),
            Err(e) => self
                .hal
                .debug_write(&format!("[module] {} not loaded: {:?}", module.name, e)),
        }
        result
    }

    /// Load `modules` in order, unloading this batch again if any fails.
    pub fn load_modules(&self, modules: &[ModuleDescriptor]) -> Result<(), ModuleError> {
        let result = self.modules.lock().load_all(modules);
        match result {
            Ok(()) => {
                for module in modules {
                    self.hal.debug_write(&format!("[module] loaded {}", module.name));
                }
                Ok(())
            }
            Err((name, ModuleError::ExitFailed(code))) => self.unload_failed(name, code),
            Err((name, e)) => {
                self.hal.debug_write(&format!(
                    "[module] {} failed ({:?}), batch rolled back",
                    name, e
                ));
                Err(e)
            }
        }
    }

    /// Unload `name`. A module that fails to exit halts the machine.
    pub fn unload_module(&self, name: &str) -> Result<(), ModuleError> {
        let result = self.modules.lock().unload(name);
        match result {
            Err(ModuleError::ExitFailed(code)) => self.unload_failed(name, code),
            Ok(()) => {
                self.hal.debug_write(&format!("[module] unloaded {}", name));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn loaded_modules(&self) -> Vec<&'static str> {
        self.modules.lock().loaded()
    }

    fn unload_failed(&self, name: &str, code: i32) -> ! {
        self.hal.halt(&format!(
            "failed to unload kernel module {} (status {})",
            name, code
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use kestrel_core::{Ipi, ProgramHeaders, Prot, Segment, VirtAddr, PAGE_SIZE};
    use kestrel_hal::TestHal;

    fn kernel(quantum_ticks: u32) -> Kernel<TestHal> {
        let hal = TestHal::new(1);
        hal.set_time(5_000);
        let config = KernelConfig {
            cores: 1,
            total_frames: 128,
            quantum_ticks,
            ..KernelConfig::default()
        };
        Kernel::new(hal, config).unwrap()
    }

    fn spawn(kernel: &Kernel<TestHal>, name: &str) -> ProcessId {
        let image = ExecutableImage {
            entry: VirtAddr(0x40_0000),
            segments: vec![Segment {
                vaddr: VirtAddr(0x40_0000),
                mem_size: PAGE_SIZE,
                data: vec![0xCC; 8],
                prot: Prot::READ_EXECUTE,
            }],
            program_headers: ProgramHeaders::default(),
        };
        kernel
            .spawn_image(name, None, &image, &[name], &[], None)
            .unwrap()
    }

    #[test]
    fn test_uptime_counts_from_boot() {
        let kernel = kernel(4);
        assert_eq!(kernel.boot_time(), 5_000);
        assert_eq!(kernel.uptime_nanos(), 0);
        kernel.hal().advance(250);
        assert_eq!(kernel.uptime_nanos(), 250);
    }

    #[test]
    fn test_quantum_expiry_rotates_processes() {
        let kernel = kernel(2);
        let first = spawn(&kernel, "first");
        let second = spawn(&kernel, "second");

        assert_eq!(kernel.schedule(CoreId(0)).pid(), first);
        assert!(matches!(kernel.timer_tick(CoreId(0)), CoreAction::Continue));
        match kernel.timer_tick(CoreId(0)) {
            CoreAction::Run(next) => assert_eq!(next.pid(), second),
            other => panic!("expected a switch, got {:?}", other),
        }
    }

    #[test]
    fn test_kill_from_outside_takes_effect_on_tick() {
        let kernel = kernel(8);
        let pid = spawn(&kernel, "victim");
        kernel.schedule(CoreId(0));

        kernel.kill_process(pid).unwrap();
        assert!(kernel.hal().take_ipis().contains(&(0, Ipi::Reschedule.vector())));
        match kernel.timer_tick(CoreId(0)) {
            CoreAction::Run(next) => assert!(next.is_idle()),
            other => panic!("expected the idle thread, got {:?}", other),
        }
        assert!(kernel.processes().get(pid).is_none());
        assert!(kernel.check_invariants().is_empty());
        assert_eq!(
            kernel.kill_process(pid),
            Err(KernelError::NoSuchProcess(pid))
        );
    }

    #[test]
    fn test_boot_log_names_policy() {
        let kernel = kernel(4).with_oom_policy(crate::oom::KillRequester);
        let lines = kernel.hal().debug_lines();
        assert!(lines[0].starts_with("[kernel] boot: 1 cores"));
        assert_eq!(lines[1], "[kernel] OOM policy: kill-requester");
    }
}
