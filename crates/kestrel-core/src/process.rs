//! Processes
//!
//! A process owns an address space, a handle table and its threads. It is
//! itself a kernel object: waiting on it with `EXITED` interest completes
//! once it has died.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──kill / exit──► Dying ──last thread dead──► Dead ──reap──► gone
//! ```
//!
//! Killing is asynchronous. Threads off the CPU die at once; a running
//! thread dies at its core's next scheduling point, and the runtime reports
//! it back through [`ProcessTable::threads_reaped`]. When the last thread is
//! dead the process is finalized: handles closed, address space torn down,
//! watchers signalled. The entry stays in the table, holding the exit code,
//! until the parent reaps it. Only then are kernel stacks released.
//!
//! Pid 0 belongs to the per-core idle threads and is never allocated.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_sync::{SpinLock, SpinLockGuard, DEFAULT_SPIN_LIMIT};
use serde::{Deserialize, Serialize};

use crate::address_space::AddressSpace;
use crate::error::KernelError;
use crate::exec::{build_initial_stack, load_image, ExecutableImage, StackArgs};
use crate::handle::HandleTable;
use crate::object::{next_object_id, EventMask, KernelObject, ObjectType, TypedObject, WatchList, Watcher};
use crate::phys::PhysicalMemory;
use crate::sched::{Scheduler, Termination};
use crate::thread::{Priority, RegisterContext, Thread, ThreadState};
use crate::types::{AddressSpaceId, ObjectId, ProcessId, Prot, ThreadId, VirtAddr, PAGE_SIZE};

/// Exit code recorded for a process that was killed
pub const KILLED_EXIT_CODE: i64 = -9;

/// Where the initial user stack ends (exclusive)
pub const USER_STACK_TOP: VirtAddr = VirtAddr(0x0000_7FFF_FFFF_0000);

/// Process lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    /// Exit requested; threads are still being torn down
    Dying,
    /// Finalized; waiting to be reaped
    Dead,
}

/// Per-process resource limits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLimits {
    pub max_handles: usize,
    pub user_stack_pages: usize,
    /// Spin budget for process, handle, address-space and thread locks
    pub spin_limit: u32,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            max_handles: 1024,
            user_stack_pages: 16,
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

/// Snapshot of a process for listings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub name: String,
    pub state: ProcessState,
    pub threads: usize,
    pub handles: usize,
    pub used_memory: usize,
}

struct ProcessInner {
    state: ProcessState,
    exit_code: Option<i64>,
    threads: Vec<Arc<Thread>>,
    children: Vec<ProcessId>,
    finalizing: bool,
}

/// A process
pub struct Process {
    pid: ProcessId,
    parent: Option<ProcessId>,
    name: String,
    object_id: ObjectId,
    address_space: SpinLock<AddressSpace>,
    handles: SpinLock<HandleTable>,
    inner: SpinLock<ProcessInner>,
    watchers: WatchList,
}

impl Process {
    fn new(
        pid: ProcessId,
        parent: Option<ProcessId>,
        name: String,
        space: AddressSpace,
        handles: HandleTable,
        spin_limit: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            parent,
            name,
            object_id: next_object_id(),
            address_space: SpinLock::with_spin_limit("address-space", spin_limit, space),
            handles: SpinLock::with_spin_limit("handles", spin_limit, handles),
            inner: SpinLock::with_spin_limit(
                "process",
                spin_limit,
                ProcessInner {
                    state: ProcessState::Running,
                    exit_code: None,
                    threads: Vec::new(),
                    children: Vec::new(),
                    finalizing: false,
                },
            ),
            watchers: WatchList::new(),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.inner.lock().exit_code
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().threads.clone()
    }

    pub fn children(&self) -> Vec<ProcessId> {
        self.inner.lock().children.clone()
    }

    pub fn is_child(&self, pid: ProcessId) -> bool {
        self.inner.lock().children.contains(&pid)
    }

    pub fn address_space(&self) -> SpinLockGuard<'_, AddressSpace> {
        self.address_space.lock()
    }

    pub fn handles(&self) -> SpinLockGuard<'_, HandleTable> {
        self.handles.lock()
    }

    pub fn info(&self) -> ProcessInfo {
        let (state, threads) = {
            let inner = self.inner.lock();
            let live = inner
                .threads
                .iter()
                .filter(|t| t.state() != ThreadState::Dead)
                .count();
            (inner.state, live)
        };
        ProcessInfo {
            pid: self.pid,
            parent: self.parent,
            name: self.name.clone(),
            state,
            threads,
            handles: self.handles.lock().len(),
            used_memory: self.address_space.lock().used_physical_memory(),
        }
    }
}

impl KernelObject for Process {
    fn object_id(&self) -> ObjectId {
        self.object_id
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Process
    }

    fn watch(&self, watcher: &Arc<Watcher>, interest: EventMask) {
        let inner = self.inner.lock();
        if inner.state == ProcessState::Dead {
            drop(inner);
            watcher.signal(self.object_id, interest & EventMask::EXITED);
            return;
        }
        // Registered under the state lock so finalize cannot slip between
        self.watchers.add(watcher);
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl TypedObject for Process {
    const TYPE: ObjectType = ObjectType::Process;
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .finish()
    }
}

// ============================================================================
// Process table
// ============================================================================

/// Every process in the system, plus the id counters
pub struct ProcessTable {
    phys: Arc<PhysicalMemory>,
    sched: Arc<Scheduler>,
    limits: ProcessLimits,
    processes: SpinLock<BTreeMap<ProcessId, Arc<Process>>>,
    next_pid: AtomicU64,
    next_tid: AtomicU64,
    next_space: AtomicU64,
}

/// What a new process runs
pub struct SpawnRequest<'a> {
    pub name: &'a str,
    pub parent: Option<ProcessId>,
    pub image: &'a ExecutableImage,
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
    pub exec_path: Option<&'a str>,
    pub seed: [u8; 16],
}

impl ProcessTable {
    pub fn new(phys: Arc<PhysicalMemory>, sched: Arc<Scheduler>, limits: ProcessLimits) -> Self {
        Self {
            phys,
            sched,
            limits,
            processes: SpinLock::with_spin_limit(
                "process-table",
                limits.spin_limit,
                BTreeMap::new(),
            ),
            next_pid: AtomicU64::new(1),
            next_tid: AtomicU64::new(1),
            next_space: AtomicU64::new(1),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn limits(&self) -> ProcessLimits {
        self.limits
    }

    fn allocate_space(&self) -> AddressSpace {
        let id = AddressSpaceId(self.next_space.fetch_add(1, Ordering::Relaxed));
        AddressSpace::new(id, self.phys.clone())
    }

    fn register(&self, process: &Arc<Process>) {
        self.processes.lock().insert(process.pid, process.clone());
        if let Some(parent) = process.parent.and_then(|pid| self.get(pid)) {
            parent.inner.lock().children.push(process.pid);
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// An empty process: no threads, no mappings.
    pub fn create_process(&self, parent: Option<ProcessId>, name: &str) -> Arc<Process> {
        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let process = Process::new(
            pid,
            parent,
            String::from(name),
            self.allocate_space(),
            HandleTable::new(self.limits.max_handles),
            self.limits.spin_limit,
        );
        self.register(&process);
        process
    }

    /// Create a process running `request.image`: segments mapped, user stack
    /// built, one thread queued at the entry point.
    pub fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Arc<Process>, KernelError> {
        let process = self.create_process(request.parent, request.name);
        match self.populate(&process, request) {
            Ok(()) => Ok(process),
            Err(e) => {
                self.discard(&process);
                Err(e)
            }
        }
    }

    fn populate(&self, process: &Arc<Process>, request: &SpawnRequest<'_>) -> Result<(), KernelError> {
        let stack_size = self.limits.user_stack_pages.max(1) * PAGE_SIZE;
        let floor = VirtAddr(USER_STACK_TOP.0 - stack_size as u64);
        let sp = {
            let mut space = process.address_space.lock();
            load_image(&mut space, request.image)?;
            space.allocate_anonymous_at(floor, stack_size, Prot::READ_WRITE)?;
            build_initial_stack(
                &mut space,
                USER_STACK_TOP,
                floor,
                request.image,
                &StackArgs {
                    argv: request.argv,
                    envp: request.envp,
                    exec_path: request.exec_path,
                    seed: request.seed,
                },
            )?
        };
        let thread = self.create_thread(process, request.image.entry, sp, None, Priority::Normal)?;
        thread.lock().user_stack = Some(USER_STACK_TOP);
        Ok(())
    }

    /// Undo a creation that failed before any thread ran.
    fn discard(&self, process: &Arc<Process>) {
        self.processes.lock().remove(&process.pid);
        if let Some(parent) = process.parent.and_then(|pid| self.get(pid)) {
            parent.inner.lock().children.retain(|pid| *pid != process.pid);
        }
        process.address_space.lock().destroy();
    }

    /// Add a thread starting at `entry` with stack `sp`. `arg`, if given,
    /// arrives in the first argument register.
    pub fn create_thread(
        &self,
        process: &Arc<Process>,
        entry: VirtAddr,
        sp: VirtAddr,
        arg: Option<u64>,
        priority: Priority,
    ) -> Result<Arc<Thread>, KernelError> {
        let mut context = RegisterContext::user(entry, sp);
        if let Some(arg) = arg {
            context.args[0] = arg;
        }
        self.add_thread(process, priority, context)
    }

    fn add_thread(
        &self,
        process: &Arc<Process>,
        priority: Priority,
        context: RegisterContext,
    ) -> Result<Arc<Thread>, KernelError> {
        let tid = ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let thread =
            Thread::with_spin_limit(tid, process.pid, priority, context, self.limits.spin_limit);
        {
            let mut inner = process.inner.lock();
            if inner.state != ProcessState::Running {
                return Err(KernelError::NoSuchProcess(process.pid));
            }
            inner.threads.push(thread.clone());
        }
        self.sched.enqueue_new(&thread);
        Ok(thread)
    }

    /// Copy-on-write duplicate of `parent`. The child has one thread, a
    /// copy of `caller` that sees 0 as the syscall result, and a copy of
    /// the parent's handle table.
    pub fn fork(&self, parent: &Arc<Process>, caller: &Arc<Thread>) -> Result<Arc<Process>, KernelError> {
        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let space_id = AddressSpaceId(self.next_space.fetch_add(1, Ordering::Relaxed));
        let space = parent.address_space.lock().fork(space_id);
        let handles = parent.handles.lock().clone_for_fork();

        let child = Process::new(
            pid,
            Some(parent.pid),
            parent.name.clone(),
            space,
            handles,
            self.limits.spin_limit,
        );
        self.register(&child);

        let mut context = caller.context();
        context.ret = 0;
        match self.add_thread(&child, caller.priority(), context) {
            Ok(thread) => {
                let user_stack = caller.lock().user_stack;
                thread.lock().user_stack = user_stack;
                Ok(child)
            }
            Err(e) => {
                self.discard(&child);
                drop(child.handles.lock().clear());
                Err(e)
            }
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.lock().get(&pid).cloned()
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let processes: Vec<Arc<Process>> = self.processes.lock().values().cloned().collect();
        processes.iter().map(|p| p.info()).collect()
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.processes.lock().values().cloned().collect()
    }

    pub fn all_threads(&self) -> Vec<Arc<Thread>> {
        self.processes()
            .iter()
            .flat_map(|p| p.threads())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Ask every thread of `pid` to die. Returns the cores that must
    /// reschedule before the process can finish dying.
    pub fn kill(&self, pid: ProcessId) -> Result<Vec<Termination>, KernelError> {
        let process = self.get(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        Ok(self.exit_process(&process, KILLED_EXIT_CODE))
    }

    /// Start tearing `process` down with `code`. The first exit code
    /// recorded wins.
    pub fn exit_process(&self, process: &Arc<Process>, code: i64) -> Vec<Termination> {
        let threads = {
            let mut inner = process.inner.lock();
            if inner.state != ProcessState::Running {
                return Vec::new();
            }
            inner.state = ProcessState::Dying;
            inner.exit_code.get_or_insert(code);
            inner.threads.clone()
        };

        let results = threads.iter().map(|t| self.sched.terminate(t)).collect();
        self.finalize_if_done(process);
        results
    }

    /// End one thread. The last thread to go takes the process with it,
    /// using `code` as the exit code.
    pub fn exit_thread(&self, thread: &Arc<Thread>, code: i64) -> Termination {
        let result = self.sched.terminate(thread);
        if let Some(process) = self.get(thread.pid()) {
            let last = process
                .threads()
                .iter()
                .all(|t| Arc::ptr_eq(t, thread) || t.state() == ThreadState::Dead);
            if last {
                process.inner.lock().exit_code.get_or_insert(code);
            }
            self.finalize_if_done(&process);
        }
        result
    }

    /// Account for threads that died at a scheduling point.
    pub fn threads_reaped(&self, threads: &[Arc<Thread>]) {
        for thread in threads {
            if let Some(process) = self.get(thread.pid()) {
                self.finalize_if_done(&process);
            }
        }
    }

    fn finalize_if_done(&self, process: &Arc<Process>) {
        {
            let mut inner = process.inner.lock();
            if inner.finalizing || inner.threads.iter().any(|t| t.state() != ThreadState::Dead) {
                return;
            }
            inner.finalizing = true;
            inner.state = ProcessState::Dying;
            inner.exit_code.get_or_insert(0);
        }
        self.finalize(process);
    }

    fn finalize(&self, process: &Arc<Process>) {
        let closed = process.handles.lock().clear();
        drop(closed);
        process.address_space.lock().destroy();

        let children = {
            let mut inner = process.inner.lock();
            inner.state = ProcessState::Dead;
            core::mem::take(&mut inner.children)
        };
        process.watchers.signal(process.object_id, EventMask::EXITED);

        // Nobody is left to reap dead children; live ones are reaped when
        // they die
        let mut table = self.processes.lock();
        for pid in children {
            if table.get(&pid).is_some_and(|c| c.state() == ProcessState::Dead) {
                table.remove(&pid);
            }
        }
        let orphaned = process.parent.map_or(true, |parent| {
            table
                .get(&parent)
                .map_or(true, |p| p.state() == ProcessState::Dead)
        });
        if orphaned {
            table.remove(&process.pid);
        }
    }

    /// Collect the exit code of `child`, a dead child of `parent`, and
    /// drop it from the table.
    pub fn reap(&self, parent: &Process, child: ProcessId) -> Result<i64, KernelError> {
        if !parent.is_child(child) {
            return Err(KernelError::NoSuchProcess(child));
        }
        let process = self.get(child).ok_or(KernelError::NoSuchProcess(child))?;
        let code = {
            let inner = process.inner.lock();
            if inner.state != ProcessState::Dead {
                return Err(KernelError::StillRunning(child));
            }
            inner.exit_code.unwrap_or(0)
        };

        self.processes.lock().remove(&child);
        parent.inner.lock().children.retain(|pid| *pid != child);
        for thread in process.threads() {
            thread.release_kernel_stack();
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ProgramHeaders, Segment};
    use crate::object::{Event, ResetMode};
    use crate::types::CoreId;
    use crate::wait::{begin_wait, finish_wait, WaitOutcome, WaitResult};

    fn table(frames: usize) -> (Arc<PhysicalMemory>, ProcessTable) {
        let phys = Arc::new(PhysicalMemory::new(frames));
        let sched = Arc::new(Scheduler::new(2, 5));
        let table = ProcessTable::new(phys.clone(), sched, ProcessLimits::default());
        (phys, table)
    }

    fn image() -> ExecutableImage {
        ExecutableImage {
            entry: VirtAddr(0x40_0000),
            segments: alloc::vec![Segment {
                vaddr: VirtAddr(0x40_0000),
                mem_size: PAGE_SIZE,
                data: alloc::vec![0x90; 64],
                prot: Prot::READ_EXECUTE,
            }],
            program_headers: ProgramHeaders::default(),
        }
    }

    fn spawn(table: &ProcessTable, parent: Option<ProcessId>) -> Arc<Process> {
        table
            .spawn(&SpawnRequest {
                name: "init",
                parent,
                image: &image(),
                argv: &["init"],
                envp: &[],
                exec_path: Some("/bin/init"),
                seed: [1; 16],
            })
            .unwrap()
    }

    fn run(table: &ProcessTable, thread: &Arc<Thread>) -> CoreId {
        let core = thread.lock().last_core.unwrap_or(CoreId(0));
        let sched = table.scheduler();
        while !Arc::ptr_eq(&sched.schedule(core).thread, thread) {
            sched.yield_now(core);
        }
        core
    }

    // ========================================================================
    // Creation
    // ========================================================================

    #[test]
    fn test_spawn_starts_thread_at_entry() {
        let (_, table) = table(512);
        let process = spawn(&table, None);

        let threads = process.threads();
        assert_eq!(threads.len(), 1);
        let context = threads[0].context();
        assert_eq!(context.ip, 0x40_0000);
        assert_eq!(context.sp % 16, 0);
        assert_eq!(process.address_space().read_u64(VirtAddr(context.sp)).unwrap(), 1);
        assert_eq!(threads[0].state(), ThreadState::Ready);
        assert_eq!(process.address_space().regions().count(), 2);
    }

    #[test]
    fn test_failed_spawn_leaves_nothing_behind() {
        let (phys, table) = table(1);
        let used = phys.stats().used;
        let result = table.spawn(&SpawnRequest {
            name: "big",
            parent: None,
            image: &image(),
            argv: &[],
            envp: &[],
            exec_path: None,
            seed: [0; 16],
        });
        assert_eq!(result.err(), Some(KernelError::OutOfMemory));
        assert!(table.is_empty());
        assert_eq!(phys.stats().used, used);
    }

    #[test]
    fn test_fork_copies_caller_and_handles() {
        let (_, table) = table(512);
        let parent = spawn(&table, None);
        let caller = parent.threads()[0].clone();
        caller.lock().context.ret = 77;
        parent.handles().insert(Event::new(ResetMode::Sticky)).unwrap();

        let child = table.fork(&parent, &caller).unwrap();
        assert_eq!(child.parent(), Some(parent.pid()));
        assert!(parent.is_child(child.pid()));

        let child_thread = child.threads()[0].clone();
        assert_eq!(child_thread.context().ret, 0);
        assert_eq!(child_thread.context().ip, caller.context().ip);
        assert_eq!(child.handles().len(), 1);
        assert_eq!(
            child.address_space().parent(),
            Some(parent.address_space().id())
        );
    }

    // ========================================================================
    // Termination
    // ========================================================================

    #[test]
    fn test_kill_of_queued_process_finishes_immediately() {
        let (phys, table) = table(512);
        let init = spawn(&table, None);
        let child = spawn(&table, Some(init.pid()));
        let used = phys.stats().used;

        let results = table.kill(child.pid()).unwrap();
        assert_eq!(results, [Termination::Immediate]);
        assert_eq!(child.state(), ProcessState::Dead);
        assert!(phys.stats().used < used);
        assert_eq!(child.address_space().regions().count(), 0);

        assert_eq!(table.reap(&init, child.pid()), Ok(KILLED_EXIT_CODE));
        assert!(table.get(child.pid()).is_none());
        assert!(child.threads()[0].lock().kernel_stack.is_none());
    }

    #[test]
    fn test_kill_of_running_thread_is_deferred() {
        let (_, table) = table(512);
        let init = spawn(&table, None);
        let child = spawn(&table, Some(init.pid()));
        let thread = child.threads()[0].clone();
        let core = run(&table, &thread);

        let results = table.kill(child.pid()).unwrap();
        assert_eq!(results, [Termination::Deferred(core)]);
        assert_eq!(child.state(), ProcessState::Dying);
        assert_eq!(
            table.reap(&init, child.pid()),
            Err(KernelError::StillRunning(child.pid()))
        );

        let dispatch = table.scheduler().schedule(core);
        table.threads_reaped(&dispatch.reaped);
        assert_eq!(child.state(), ProcessState::Dead);
        assert_eq!(table.reap(&init, child.pid()), Ok(KILLED_EXIT_CODE));
    }

    #[test]
    fn test_reap_requires_parent() {
        let (_, table) = table(512);
        let a = spawn(&table, None);
        let b = spawn(&table, None);
        let child = spawn(&table, Some(a.pid()));
        table.kill(child.pid()).unwrap();

        assert_eq!(
            table.reap(&b, child.pid()),
            Err(KernelError::NoSuchProcess(child.pid()))
        );
        assert!(table.reap(&a, child.pid()).is_ok());
    }

    #[test]
    fn test_last_thread_exit_sets_code() {
        let (_, table) = table(512);
        let init = spawn(&table, None);
        let child = spawn(&table, Some(init.pid()));
        let extra = table
            .create_thread(&child, VirtAddr(0x40_0000), VirtAddr(0x1000), Some(5), Priority::Low)
            .unwrap();
        assert_eq!(extra.context().args[0], 5);

        let main = child.threads()[0].clone();
        table.exit_thread(&extra, 1);
        assert_eq!(child.state(), ProcessState::Running);
        table.exit_thread(&main, 3);
        assert_eq!(child.state(), ProcessState::Dead);
        assert_eq!(table.reap(&init, child.pid()), Ok(3));
    }

    #[test]
    fn test_waiting_on_process_completes_at_exit() {
        let (_, table) = table(512);
        let init = spawn(&table, None);
        let child = spawn(&table, Some(init.pid()));
        let waiter = init.threads()[0].clone();
        run(&table, &waiter);

        let outcome = begin_wait(
            table.scheduler(),
            &waiter,
            alloc::vec![child.clone() as Arc<dyn KernelObject>],
            EventMask::EXITED,
            None,
        );
        assert_eq!(outcome, WaitOutcome::Blocked);

        table.kill(child.pid()).unwrap();
        assert_eq!(waiter.state(), ThreadState::Ready);
        assert_eq!(
            finish_wait(table.scheduler(), &waiter),
            WaitResult::Signalled {
                index: 0,
                events: EventMask::EXITED
            }
        );
    }

    #[test]
    fn test_watch_after_death_fires_at_once() {
        let (_, table) = table(512);
        let init = spawn(&table, None);
        let child = spawn(&table, Some(init.pid()));
        table.kill(child.pid()).unwrap();

        let waiter = init.threads()[0].clone();
        run(&table, &waiter);
        let outcome = begin_wait(
            table.scheduler(),
            &waiter,
            alloc::vec![child as Arc<dyn KernelObject>],
            EventMask::EXITED,
            None,
        );
        assert!(matches!(
            outcome,
            WaitOutcome::Complete(WaitResult::Signalled { index: 0, .. })
        ));
    }

    #[test]
    fn test_orphan_removed_when_finalized() {
        let (_, table) = table(512);
        let parent = spawn(&table, None);
        let child = spawn(&table, Some(parent.pid()));
        table.kill(parent.pid()).unwrap();
        // A parentless process has nobody to reap it either
        assert!(table.get(parent.pid()).is_none());

        table.kill(child.pid()).unwrap();
        assert!(table.get(child.pid()).is_none());
    }

    #[test]
    fn test_closing_handles_on_exit_drops_objects() {
        let (_, table) = table(512);
        let init = spawn(&table, None);
        let child = spawn(&table, Some(init.pid()));
        let event = Event::new(ResetMode::Sticky);
        child.handles().insert(event.clone()).unwrap();
        assert_eq!(Arc::strong_count(&event), 2);

        table.kill(child.pid()).unwrap();
        assert_eq!(Arc::strong_count(&event), 1);
    }
}
