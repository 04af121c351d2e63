//! Time and memory headroom for a single pass.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::Instant;

const MIB: u64 = 1024 * 1024;

/// Ceiling used when no limit is configured or the limit is "unlimited".
pub const DEFAULT_MEMORY_CEILING: u64 = 32_000 * MIB;

/// Fraction of the ceiling, in tenths, at which memory counts as exhausted.
const MEMORY_THRESHOLD_TENTHS: u128 = 9;

/// Who started the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationContext {
    /// A dispatch request arriving over the trigger transport.
    Trigger,
    /// The periodic health check restarting a stalled queue.
    HealthCheck,
    /// An operator-driven run from the command line.
    Cli,
}

impl InvocationContext {
    /// Operator runs are never cut short by the time budget.
    pub fn is_time_exempt(self) -> bool {
        matches!(self, Self::Cli)
    }
}

/// Convert shorthand sizes (`128`, `64k`, `256M`, `2g`) to bytes.
///
/// Mirrors the usual ini semantics: the leading integer is taken, the first
/// `g`, `m` or `k` found scales it, and anything unparsable counts as zero.
/// The result saturates instead of overflowing.
pub fn shorthand_to_bytes(value: &str) -> u64 {
    let value = value.trim().to_ascii_lowercase();
    let digits: String = value
        .chars()
        .skip_while(|c| *c == '+')
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let base: u64 = if value.starts_with('-') {
        0
    } else {
        digits.parse().unwrap_or(if digits.is_empty() { 0 } else { u64::MAX })
    };

    let multiplier = if value.contains('g') {
        1024 * MIB
    } else if value.contains('m') {
        MIB
    } else if value.contains('k') {
        1024
    } else {
        1
    };
    base.saturating_mul(multiplier)
}

/// Resolve the configured limit to a ceiling in bytes.
///
/// Unset, empty, zero and `-1` all resolve to [`DEFAULT_MEMORY_CEILING`] so
/// the 90% check stays meaningful.
pub fn memory_ceiling(limit: Option<&str>) -> u64 {
    let Some(raw) = limit.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_MEMORY_CEILING;
    };
    if raw.starts_with("-1") {
        return DEFAULT_MEMORY_CEILING;
    }
    match shorthand_to_bytes(raw) {
        0 => DEFAULT_MEMORY_CEILING,
        bytes => bytes,
    }
}

/// Source of the current resident memory figure.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> u64;
}

/// Resident set size of this process, read through `sysinfo`.
pub struct ProcessMemory {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn resident_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Point-in-time view of the budget, used in logs and pass reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub elapsed_ms: u64,
    pub time_limit_ms: u64,
    pub resident_bytes: u64,
    pub memory_ceiling: u64,
    pub time_exceeded: bool,
    pub memory_exceeded: bool,
}

/// Decides whether the current pass must stop.
pub struct BudgetMonitor {
    time_limit: Duration,
    memory_ceiling: u64,
    probe: Arc<dyn MemoryProbe>,
    context: InvocationContext,
}

impl BudgetMonitor {
    pub fn new(
        time_limit: Duration,
        memory_ceiling: u64,
        probe: Arc<dyn MemoryProbe>,
        context: InvocationContext,
    ) -> Self {
        Self {
            time_limit,
            memory_ceiling,
            probe,
            context,
        }
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    pub fn memory_ceiling(&self) -> u64 {
        self.memory_ceiling
    }

    /// `now >= start + limit`, except in time-exempt contexts. A limit too
    /// large to add to `start` is never reached.
    pub fn time_exceeded(&self, start: Instant) -> bool {
        if self.context.is_time_exempt() {
            return false;
        }
        start
            .checked_add(self.time_limit)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resident memory at or above 90% of the ceiling.
    pub fn memory_exceeded(&self) -> bool {
        self.memory_exceeded_at(self.probe.resident_bytes())
    }

    fn memory_exceeded_at(&self, resident: u64) -> bool {
        resident as u128 * 10 >= self.memory_ceiling as u128 * MEMORY_THRESHOLD_TENTHS
    }

    pub fn snapshot(&self, start: Instant) -> BudgetSnapshot {
        let resident = self.probe.resident_bytes();
        BudgetSnapshot {
            elapsed_ms: saturating_millis(start.elapsed()),
            time_limit_ms: saturating_millis(self.time_limit),
            resident_bytes: resident,
            memory_ceiling: self.memory_ceiling,
            time_exceeded: self.time_exceeded(start),
            memory_exceeded: self.memory_exceeded_at(resident),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
