//! Kernel introspection
//!
//! A point-in-time snapshot of the whole kernel, serializable for the
//! debug console or a supervisor.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::Kernel;
use kestrel_core::{CoreStats, PhysStats, ProcessInfo};
use kestrel_hal::HAL;
use serde::Serialize;

/// Snapshot of kernel state
#[derive(Clone, Debug, Serialize)]
pub struct KernelStats {
    pub uptime_nanos: u64,
    pub memory: PhysStats,
    pub cores: Vec<CoreStats>,
    pub processes: Vec<ProcessInfo>,
    /// Events currently held by the syscall log
    pub syslog_events: usize,
    /// Logged requests still awaiting a response
    pub syslog_outstanding: usize,
    /// Syscalls blocked awaiting completion
    pub pending_syscalls: usize,
    pub modules: Vec<&'static str>,
    pub oom_policy: &'static str,
}

impl<H: HAL> Kernel<H> {
    pub fn stats(&self) -> KernelStats {
        let (syslog_events, syslog_outstanding) = {
            let syslog = self.syslog.lock();
            (syslog.len(), syslog.outstanding().len())
        };
        KernelStats {
            uptime_nanos: self.uptime_nanos(),
            memory: self.phys.stats(),
            cores: self.sched.stats(),
            processes: self.processes.list(),
            syslog_events,
            syslog_outstanding,
            pending_syscalls: self.pending_syscalls(),
            modules: self.loaded_modules(),
            oom_policy: self.oom.name(),
        }
    }

    /// [`Kernel::stats`] as JSON.
    pub fn stats_json(&self) -> Result<String, String> {
        serde_json::to_string(&self.stats()).map_err(|e| e.to_string())
    }
}
