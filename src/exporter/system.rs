//! # Process Statistics Collector
//!
//! This module defines the `ProcessCollector`, which sums the resource usage
//! of the web server's process tree (process count, resident and virtual
//! memory, disk I/O) via the `sysinfo` crate.
//!
//! The tree is rooted at the parent of this process, or at this process when
//! it was started by init. Only processes whose name or command line contains
//! one of the configured names are counted, and the walk does not descend
//! below a process that does not match.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::{debug, warn};

/// Summed statistics of the server process tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessTotals {
    pub processes: u64,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// The per-process view the tree walk needs.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub command: String,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// Sums the tree rooted at `root` over `processes`.
pub fn sum_tree(processes: &[ProcessInfo], root: u32, match_names: &[String]) -> ProcessTotals {
    let by_pid: HashMap<u32, &ProcessInfo> = processes.iter().map(|p| (p.pid, p)).collect();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for process in processes {
        if let Some(parent) = process.parent {
            children.entry(parent).or_default().push(process.pid);
        }
    }

    let mut totals = ProcessTotals::default();
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        let Some(process) = by_pid.get(&pid) else {
            continue;
        };
        if !match_names.iter().any(|name| process.command.contains(name.as_str())) {
            continue;
        }
        totals.processes += 1;
        totals.rss_bytes += process.rss_bytes;
        totals.virtual_bytes += process.virtual_bytes;
        totals.read_bytes += process.read_bytes;
        totals.written_bytes += process.written_bytes;
        if let Some(kids) = children.get(&pid) {
            pending.extend(kids.iter().copied().filter(|kid| *kid != pid));
        }
    }
    totals
}

/// The one-minute load average of the host.
pub fn load_average() -> f64 {
    System::load_average().one
}

/// Caches process-tree statistics and refreshes them at most once per
/// refresh interval.
pub struct ProcessCollector {
    system: System,
    match_names: Vec<String>,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
}

impl std::fmt::Debug for ProcessCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCollector")
            .field("match_names", &self.match_names)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl ProcessCollector {
    pub fn new(match_names: Vec<String>, refresh_interval: Duration) -> Self {
        Self {
            system: System::new(),
            match_names,
            refresh_interval,
            last_refresh: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self.last_refresh {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    /// Collects fresh totals when the cached ones are older than the refresh
    /// interval, otherwise returns `None`.
    pub fn refresh_if_stale(&mut self) -> Option<ProcessTotals> {
        if !self.is_stale() {
            return None;
        }
        self.last_refresh = Some(Instant::now());
        Some(self.collect())
    }

    fn collect(&mut self) -> ProcessTotals {
        let own_pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Failed to get current PID: {}", e);
                return ProcessTotals::default();
            }
        };
        self.system.refresh_processes();

        let root = self
            .system
            .process(own_pid)
            .and_then(|process| process.parent())
            .filter(|parent| parent.as_u32() > 1)
            .unwrap_or(own_pid);

        let processes: Vec<ProcessInfo> = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let disk = process.disk_usage();
                ProcessInfo {
                    pid: pid.as_u32(),
                    parent: process.parent().map(Pid::as_u32),
                    command: format!("{} {}", process.name(), process.cmd().join(" ")),
                    rss_bytes: process.memory(),
                    virtual_bytes: process.virtual_memory(),
                    read_bytes: disk.total_read_bytes,
                    written_bytes: disk.total_written_bytes,
                }
            })
            .collect();

        let totals = sum_tree(&processes, root.as_u32(), &self.match_names);
        debug!(root = root.as_u32(), ?totals, "Refreshed process statistics");
        totals
    }
}
