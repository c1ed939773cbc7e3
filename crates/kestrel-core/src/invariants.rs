//! Runtime-checkable kernel invariants
//!
//! These hold at every quiescent point: after a syscall, tick or reschedule
//! has finished on every core. They are used for:
//! 1. Assertions in tests and debug builds of the runtime
//! 2. Bounded proofs with Kani
//!
//! # Invariants
//!
//! 1. **Frame accounting**: allocated and free frames are disjoint and sum
//!    to the total
//! 2. **Map count**: a VM object's map count equals the number of regions
//!    mapping it
//! 3. **Frame ownership**: a frame's owner count equals the number of VM
//!    objects holding it
//! 4. **COW protection**: a frame with more than one owner is never mapped
//!    writable
//! 5. **Ready queues**: a thread is in a ready queue iff it is Ready, and in
//!    at most one
//! 6. **Running threads**: every Running thread is current on exactly one
//!    core
//! 7. **Handle tables**: within capacity, ids start at 1
//! 8. **Dead processes**: no live threads, no handles, no mappings

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::phys::PhysicalMemory;
use crate::process::{ProcessState, ProcessTable};
use crate::sched::Scheduler;
use crate::thread::ThreadState;
use crate::types::{FrameNumber, ThreadId, VmObjectId};
use crate::vm::VmObject;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// The subsystems the invariants range over
#[derive(Clone, Copy)]
pub struct KernelView<'a> {
    pub phys: &'a PhysicalMemory,
    pub sched: &'a Scheduler,
    pub processes: &'a ProcessTable,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_frame_accounting(view));
    violations.extend(check_memory_objects(view));
    violations.extend(check_ready_queues(view));
    violations.extend(check_running_threads(view));
    violations.extend(check_handle_tables(view));
    violations.extend(check_dead_processes(view));

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(view: &KernelView<'_>) {
    let violations = check_all_invariants(view);
    if let Some(v) = violations.first() {
        panic!("Invariant violated: {}: {}", v.invariant, v.description);
    }
}

/// Invariant 1: frame bitmap, counters and free stack agree
fn check_frame_accounting(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    match view.phys.verify() {
        Ok(()) => Vec::new(),
        Err(reason) => alloc::vec![InvariantViolation {
            invariant: "frame_accounting",
            description: String::from(reason),
        }],
    }
}

/// Invariants 2-4: map counts, frame owners, COW write protection
fn check_memory_objects(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut objects: BTreeMap<VmObjectId, (Arc<VmObject>, usize)> = BTreeMap::new();

    for process in view.processes.processes() {
        let space = process.address_space();
        for region in space.regions() {
            objects
                .entry(region.object.id())
                .or_insert_with(|| (region.object.clone(), 0))
                .1 += 1;
        }

        for (addr, entry) in space.page_map().mappings() {
            if entry.is_writable() && view.phys.owners(entry.frame()) > 1 {
                violations.push(InvariantViolation {
                    invariant: "cow_write_protected",
                    description: alloc::format!(
                        "Process {} maps shared frame {:#x} writable at {}",
                        process.pid(),
                        entry.frame().0,
                        addr
                    ),
                });
            }
        }
    }

    let mut holders: BTreeMap<FrameNumber, u32> = BTreeMap::new();
    for (id, (object, regions)) in &objects {
        if object.map_count() != *regions {
            violations.push(InvariantViolation {
                invariant: "map_count",
                description: alloc::format!(
                    "VM object {} has map count {} but {} mapping regions",
                    id.0,
                    object.map_count(),
                    regions
                ),
            });
        }
        for frame in object.frames().into_iter().flatten() {
            *holders.entry(frame).or_insert(0) += 1;
        }
    }

    for (frame, count) in holders {
        let owners = view.phys.owners(frame);
        if owners != count {
            violations.push(InvariantViolation {
                invariant: "frame_ownership",
                description: alloc::format!(
                    "Frame {:#x} held by {} objects but has {} owners",
                    frame.0,
                    count,
                    owners
                ),
            });
        }
    }

    violations
}

/// Invariant 5: ready queue membership matches the Ready state
fn check_ready_queues(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut queued: BTreeMap<ThreadId, usize> = BTreeMap::new();

    for core in view.sched.cores() {
        for thread in view.sched.ready_threads(core.id()) {
            *queued.entry(thread.tid()).or_insert(0) += 1;
            let state = thread.state();
            if state != ThreadState::Ready {
                violations.push(InvariantViolation {
                    invariant: "ready_queue_membership",
                    description: alloc::format!(
                        "Thread {} is queued on core {} in state {:?}",
                        thread.tid(),
                        core.id(),
                        state
                    ),
                });
            }
        }
    }

    for thread in view.processes.all_threads() {
        let copies = queued.get(&thread.tid()).copied().unwrap_or(0);
        let ready = thread.state() == ThreadState::Ready;
        if (ready && copies != 1) || (!ready && copies != 0) {
            violations.push(InvariantViolation {
                invariant: "ready_queue_membership",
                description: alloc::format!(
                    "Thread {} is Ready={} but queued {} times",
                    thread.tid(),
                    ready,
                    copies
                ),
            });
        }
    }

    violations
}

/// Invariant 6: Running threads are on exactly one CPU
fn check_running_threads(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut current: BTreeMap<ThreadId, usize> = BTreeMap::new();
    for core in view.sched.cores() {
        if let Some(thread) = view.sched.current(core.id()) {
            *current.entry(thread.tid()).or_insert(0) += 1;
        }
    }

    for thread in view.processes.all_threads() {
        if thread.state() != ThreadState::Running {
            continue;
        }
        let cores = current.get(&thread.tid()).copied().unwrap_or(0);
        if cores != 1 {
            violations.push(InvariantViolation {
                invariant: "running_on_one_core",
                description: alloc::format!(
                    "Thread {} is Running but current on {} cores",
                    thread.tid(),
                    cores
                ),
            });
        }
    }

    violations
}

/// Invariant 7: handle tables stay within capacity
fn check_handle_tables(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for process in view.processes.processes() {
        let handles = process.handles();
        if handles.len() > handles.capacity() {
            violations.push(InvariantViolation {
                invariant: "handle_table",
                description: alloc::format!(
                    "Process {} holds {} handles over capacity {}",
                    process.pid(),
                    handles.len(),
                    handles.capacity()
                ),
            });
        }
        if handles.ids().any(|id| id.0 == 0) {
            violations.push(InvariantViolation {
                invariant: "handle_table",
                description: alloc::format!("Process {} holds handle id 0", process.pid()),
            });
        }
    }
    violations
}

/// Invariant 8: dead processes have released their resources
fn check_dead_processes(view: &KernelView<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for process in view.processes.processes() {
        if process.state() != ProcessState::Dead {
            continue;
        }
        let live = process
            .threads()
            .iter()
            .filter(|t| t.state() != ThreadState::Dead)
            .count();
        let handles = process.handles().len();
        let regions = process.address_space().regions().count();
        if live + handles + regions > 0 {
            violations.push(InvariantViolation {
                invariant: "dead_process_released",
                description: alloc::format!(
                    "Dead process {} still has {} threads, {} handles, {} regions",
                    process.pid(),
                    live,
                    handles,
                    regions
                ),
            });
        }
    }
    violations
}

// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::process::ProcessLimits;

    /// Proof: allocation and release keep the frame accounting invariant
    #[kani::proof]
    #[kani::unwind(10)]
    fn allocation_maintains_frame_accounting() {
        let phys = Arc::new(PhysicalMemory::new(8));
        let sched = Arc::new(Scheduler::new(1, 1));
        let processes = ProcessTable::new(phys.clone(), sched.clone(), ProcessLimits::default());

        let count: usize = kani::any();
        kani::assume(count >= 1 && count <= 3);
        if let Ok(range) = phys.allocate(count) {
            phys.free(range);
        }

        let view = KernelView {
            phys: &phys,
            sched: &sched,
            processes: &processes,
        };
        kani::assert(
            check_frame_accounting(&view).is_empty(),
            "allocate then free should keep frame accounting",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ExecutableImage, ProgramHeaders, Segment};
    use crate::object::{Event, ResetMode};
    use crate::process::{ProcessLimits, SpawnRequest};
    use crate::types::{Access, CoreId, Prot, VirtAddr, PAGE_SIZE};

    struct System {
        phys: Arc<PhysicalMemory>,
        sched: Arc<Scheduler>,
        processes: ProcessTable,
    }

    impl System {
        fn new() -> Self {
            let phys = Arc::new(PhysicalMemory::new(512));
            let sched = Arc::new(Scheduler::new(2, 5));
            let processes = ProcessTable::new(phys.clone(), sched.clone(), ProcessLimits::default());
            Self {
                phys,
                sched,
                processes,
            }
        }

        fn view(&self) -> KernelView<'_> {
            KernelView {
                phys: &self.phys,
                sched: &self.sched,
                processes: &self.processes,
            }
        }

        fn spawn(&self) -> Arc<crate::process::Process> {
            let image = ExecutableImage {
                entry: VirtAddr(0x40_0000),
                segments: alloc::vec![Segment {
                    vaddr: VirtAddr(0x40_0000),
                    mem_size: PAGE_SIZE,
                    data: alloc::vec![1; 8],
                    prot: Prot::READ_EXECUTE,
                }],
                program_headers: ProgramHeaders::default(),
            };
            self.processes
                .spawn(&SpawnRequest {
                    name: "test",
                    parent: None,
                    image: &image,
                    argv: &["test"],
                    envp: &[],
                    exec_path: None,
                    seed: [0; 16],
                })
                .unwrap()
        }
    }

    fn names(violations: &[InvariantViolation]) -> Vec<&'static str> {
        violations.iter().map(|v| v.invariant).collect()
    }

    #[test]
    fn test_invariants_hold_for_new_system() {
        let system = System::new();
        assert!(check_all_invariants(&system.view()).is_empty());
    }

    #[test]
    fn test_invariants_hold_after_spawn_and_dispatch() {
        let system = System::new();
        system.spawn();
        system.spawn();
        system.sched.schedule(CoreId(0));
        system.sched.schedule(CoreId(1));
        assert_invariants(&system.view());
    }

    #[test]
    fn test_invariants_hold_across_fork_write_and_kill() {
        let system = System::new();
        let parent = system.spawn();
        let caller = parent.threads()[0].clone();
        let base = parent
            .address_space()
            .allocate_anonymous(3 * PAGE_SIZE, Prot::READ_WRITE)
            .unwrap();
        parent.address_space().copy_to_user(base, &[1; 16]).unwrap();
        parent.handles().insert(Event::new(ResetMode::Sticky)).unwrap();

        let child = system.processes.fork(&parent, &caller).unwrap();
        assert_invariants(&system.view());

        child
            .address_space()
            .handle_page_fault(base, Access::Write)
            .unwrap();
        assert_invariants(&system.view());

        system.processes.kill(child.pid()).unwrap();
        assert_invariants(&system.view());
    }

    #[test]
    fn test_detects_map_count_drift() {
        let system = System::new();
        let process = system.spawn();
        let object = process
            .address_space()
            .address_to_vm_object(VirtAddr(0x40_0000))
            .unwrap();
        object.acquire_mapping();

        assert_eq!(names(&check_all_invariants(&system.view())), ["map_count"]);
        let _ = object.release_mapping();
    }

    #[test]
    fn test_detects_running_thread_off_cpu() {
        let system = System::new();
        let process = system.spawn();
        let thread = process.threads()[0].clone();
        thread.lock().state = ThreadState::Running;

        let found = names(&check_all_invariants(&system.view()));
        assert!(found.contains(&"ready_queue_membership"));
        assert!(found.contains(&"running_on_one_core"));
    }

    #[test]
    fn test_detects_frame_ownership_mismatch() {
        let system = System::new();
        let process = system.spawn();
        let frame = process
            .address_space()
            .address_to_vm_object(VirtAddr(0x40_0000))
            .and_then(|object| object.frame(0))
            .unwrap();
        system.phys.share(frame);

        assert_eq!(
            names(&check_all_invariants(&system.view())),
            ["frame_ownership"]
        );
        system.phys.release_frame(frame);
    }

    #[test]
    #[should_panic(expected = "Invariant violated")]
    fn test_assert_invariants_panics_on_violation() {
        let system = System::new();
        let process = system.spawn();
        process.threads()[0].lock().state = ThreadState::Blocked;
        assert_invariants(&system.view());
    }
}
