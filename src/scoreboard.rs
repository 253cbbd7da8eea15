//! Worker-status snapshots and their folding into server metrics.
//!
//! The host hands over a [`ServerSnapshot`] of its scoreboard on every tick;
//! [`ServerSnapshot::updates`] turns it into the server-scoped updates for
//! uptime, generations, CPU load, per-state worker counts and the
//! ready/busy worker gauges.

use crate::collector::protocol::Update;
use crate::exporter::{names, qualified, system};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// State of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum WorkerState {
    #[default]
    Dead,
    Starting,
    Ready,
    BusyRead,
    BusyWrite,
    BusyKeepalive,
    BusyLog,
    BusyDns,
    Closing,
    Graceful,
    IdleKill,
}

impl WorkerState {
    /// The `state` label this worker is reported under, if it is reported.
    pub fn label(self) -> Option<&'static str> {
        match self {
            WorkerState::Ready => Some("idle"),
            WorkerState::Starting => Some("startup"),
            WorkerState::BusyRead => Some("read"),
            WorkerState::BusyWrite => Some("reply"),
            WorkerState::BusyKeepalive => Some("keepalive"),
            WorkerState::BusyLog => Some("logging"),
            WorkerState::Closing => Some("closing"),
            WorkerState::Graceful => Some("graceful_stop"),
            WorkerState::IdleKill => Some("idle_cleanup"),
            WorkerState::Dead | WorkerState::BusyDns => None,
        }
    }
}

/// Label of dead slots beyond the configured worker limits.
pub const DISABLED: &str = "disabled";

/// Every label of `<namespace>_workers_scoreboard`, in reporting order.
pub const SCOREBOARD_STATES: [&str; 10] = [
    "idle",
    "startup",
    "read",
    "reply",
    "keepalive",
    "logging",
    "closing",
    "graceful_stop",
    "idle_cleanup",
    DISABLED,
];

/// One server process and its worker slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSlot {
    pub pid: Option<u32>,
    pub quiescing: bool,
    pub generation: u32,
    pub workers: Vec<WorkerState>,
}

/// The host's view of its workers at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSnapshot {
    pub uptime: Duration,
    pub mpm_generation: u32,
    pub config_generation: u32,
    /// One-minute load average; read from the system when `None`.
    pub load_average: Option<f64>,
    pub max_servers: usize,
    pub threads_per_child: usize,
    pub processes: Vec<ProcessSlot>,
}

/// Worker counts derived from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreboardSummary {
    pub states: BTreeMap<&'static str, u64>,
    pub ready: u64,
    pub busy: u64,
}

impl ScoreboardSummary {
    pub fn count(&self, state: &str) -> u64 {
        self.states.get(state).copied().unwrap_or(0)
    }
}

impl ServerSnapshot {
    pub fn summarize(&self) -> ScoreboardSummary {
        let mut summary = ScoreboardSummary::default();
        for state in SCOREBOARD_STATES {
            summary.states.insert(state, 0);
        }
        let threads_per_child = self.threads_per_child.max(1);

        for (i, process) in self.processes.iter().enumerate() {
            let live = process.pid.is_some() && !process.quiescing;
            for (j, &worker) in process.workers.iter().enumerate() {
                let beyond_limits = i >= self.max_servers || j >= threads_per_child;
                if beyond_limits && worker == WorkerState::Dead {
                    *summary.states.entry(DISABLED).or_default() += 1;
                } else if let Some(label) = worker.label() {
                    *summary.states.entry(label).or_default() += 1;
                }

                if !live {
                    continue;
                }
                match worker {
                    WorkerState::Ready => {
                        if process.generation == self.mpm_generation {
                            summary.ready += 1;
                        }
                    }
                    WorkerState::Dead | WorkerState::Starting | WorkerState::IdleKill => {}
                    _ => summary.busy += 1,
                }
            }
        }
        summary
    }

    /// The server-scoped updates describing this snapshot.
    pub fn updates(&self, namespace: &str) -> Vec<Update> {
        let name = |metric: &str| qualified(namespace, metric);
        let load = self.load_average.unwrap_or_else(system::load_average);
        let summary = self.summarize();

        let mut updates = vec![
            Update::server(name(names::SERVER_UPTIME), self.uptime.as_secs() as f64),
            Update::server(name(names::MPM_GENERATION), f64::from(self.mpm_generation)),
            Update::server(name(names::CONFIG_GENERATION), f64::from(self.config_generation)),
            Update::server(name(names::CPU_LOAD), load),
        ];
        for state in SCOREBOARD_STATES {
            updates.push(
                Update::server(name(names::WORKERS_SCOREBOARD), summary.count(state) as f64)
                    .with_labels([state]),
            );
        }
        updates.push(Update::server(name(names::WORKERS), summary.ready as f64).with_labels(["ready"]));
        updates.push(Update::server(name(names::WORKERS), summary.busy as f64).with_labels(["busy"]));
        updates
    }
}

/// Supplies scoreboard snapshots.
pub trait StatusSource: Send + Sync {
    fn snapshot(&self) -> ServerSnapshot;
}

/// The status of this process itself: its own uptime, the host load and an
/// empty scoreboard.
#[derive(Debug, Clone)]
pub struct LocalStatus {
    started: Instant,
}

impl LocalStatus {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for LocalStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSource for LocalStatus {
    fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            uptime: self.started.elapsed(),
            load_average: Some(system::load_average()),
            threads_per_child: 1,
            ..ServerSnapshot::default()
        }
    }
}
