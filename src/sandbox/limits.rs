//! Limit enforcer
//!
//! Turns declarative `ResourceLimits` into a plan of `setrlimit` calls that
//! run in the child between fork and exec, so the target program never runs
//! unconstrained. The wall-clock budget is not a kernel limit and is only
//! carried here for the watchdog.

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use std::time::Duration;

use crate::config::{ResourceLimits, RlimitKind};
use crate::core::StatusCode;

/// One `setrlimit` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedLimit {
    pub kind: RlimitKind,
    pub soft: u64,
    pub hard: u64,
    /// Whether the caller asked for it (vs. an engine default)
    pub declared: bool,
}

impl PlannedLimit {
    /// Values handed to `setrlimit`.
    ///
    /// `fsize` is raised by one byte: a file that ends up longer than the
    /// configured size proves the limit was crossed, even if the program
    /// ignores SIGXFSZ.
    fn kernel_values(&self) -> (u64, u64) {
        match self.kind {
            RlimitKind::Fsize => (self.soft.saturating_add(1), self.hard.saturating_add(1)),
            _ => (self.soft, self.hard),
        }
    }
}

/// Everything the launcher needs to constrain a child
#[derive(Debug, Clone, Default)]
pub struct LimitPlan {
    limits: Vec<PlannedLimit>,
    wall_time: Option<Duration>,
}

impl LimitPlan {
    pub fn new(limits: &ResourceLimits) -> Self {
        let mut planned: Vec<PlannedLimit> = limits
            .rlimit
            .iter()
            .map(|(kind, value)| PlannedLimit {
                kind: *kind,
                soft: value.soft,
                hard: value.hard,
                declared: true,
            })
            .collect();

        // Core dumps off unless asked for; a SIGXFSZ would otherwise drop one in cwd.
        if !limits.rlimit.contains_key(&RlimitKind::Core) {
            planned.push(PlannedLimit {
                kind: RlimitKind::Core,
                soft: 0,
                hard: 0,
                declared: false,
            });
        }

        let wall_time = (limits.time_ms > 0).then(|| Duration::from_millis(limits.time_ms));

        Self {
            limits: planned,
            wall_time,
        }
    }

    /// Wall-clock budget for the watchdog, `None` when unlimited
    pub fn wall_time(&self) -> Option<Duration> {
        self.wall_time
    }

    pub fn limits(&self) -> &[PlannedLimit] {
        &self.limits
    }

    pub fn declared(&self, kind: RlimitKind) -> Option<&PlannedLimit> {
        self.limits.iter().find(|l| l.kind == kind && l.declared)
    }

    /// Largest size a path-backed output may keep, when `fsize` is declared
    pub fn output_cap(&self) -> Option<u64> {
        self.declared(RlimitKind::Fsize).map(|limit| limit.soft)
    }

    /// Status implied by a terminating signal, if a declared limit raises it
    pub fn status_for_signal(&self, signal: Signal) -> Option<StatusCode> {
        self.limits
            .iter()
            .filter(|l| l.declared)
            .find_map(|l| match limit_signal(l.kind) {
                Some((sig, status)) if sig == signal => Some(status),
                _ => None,
            })
    }

    /// Apply every limit to the calling process.
    ///
    /// Runs in the forked child: no allocation, no locks.
    pub fn apply(&self) -> std::io::Result<()> {
        for limit in &self.limits {
            let (soft, hard) = limit.kernel_values();
            setrlimit(resource_for(limit.kind), soft as libc::rlim_t, hard as libc::rlim_t)?;
        }
        Ok(())
    }
}

/// The signal the kernel sends when the soft limit is crossed, and what it means
pub fn limit_signal(kind: RlimitKind) -> Option<(Signal, StatusCode)> {
    match kind {
        RlimitKind::Fsize => Some((Signal::SIGXFSZ, StatusCode::OutputLimitExceeded)),
        RlimitKind::Cpu => Some((Signal::SIGXCPU, StatusCode::TimeLimitExceeded)),
        _ => None,
    }
}

fn resource_for(kind: RlimitKind) -> Resource {
    match kind {
        RlimitKind::As => Resource::RLIMIT_AS,
        RlimitKind::Core => Resource::RLIMIT_CORE,
        RlimitKind::Cpu => Resource::RLIMIT_CPU,
        RlimitKind::Fsize => Resource::RLIMIT_FSIZE,
        RlimitKind::Memlock => Resource::RLIMIT_MEMLOCK,
        RlimitKind::Nofile => Resource::RLIMIT_NOFILE,
        RlimitKind::Nproc => Resource::RLIMIT_NPROC,
        RlimitKind::Stack => Resource::RLIMIT_STACK,
    }
}
