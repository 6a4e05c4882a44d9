//! Report emitter
//!
//! Builds the caller-owned `ExecutionReport`. Performs no I/O.

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use super::classify::TerminationFacts;
use super::StatusCode;

/// Best-effort resource figures for the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User CPU time in milliseconds
    pub user_time_ms: u64,
    /// System CPU time in milliseconds
    pub sys_time_ms: u64,
    /// Peak resident set size in KB
    pub max_rss_kb: u64,
    /// Bytes in the stdout file after the run (path-backed stdout only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_bytes: Option<u64>,
    /// Bytes in the stderr file after the run (path-backed stderr only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_bytes: Option<u64>,
}

/// Final result of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal name, e.g. `SIGXFSZ`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    /// Setup error, supervision failure or abort notice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionReport {
    /// Report for a run that never got a child process
    pub fn setup_failure(message: impl Into<String>) -> Self {
        Self::not_started(StatusCode::MountError, message)
    }

    /// Report for a run that stopped before spawn with the given status
    pub fn not_started(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            exit_code: None,
            signal: None,
            elapsed_ms: 0,
            resource_usage: None,
            message: Some(message.into()),
        }
    }

    /// Report for a child that ran
    pub fn from_facts(
        status: StatusCode,
        facts: &TerminationFacts,
        usage: Option<ResourceUsage>,
    ) -> Self {
        let message = match (&facts.failure, facts.aborted) {
            (Some(failure), _) => Some(failure.clone()),
            (None, true) => Some("aborted by caller".to_string()),
            (None, false) => None,
        };

        Self {
            status,
            exit_code: facts.exit_code,
            signal: facts.signal.map(signal_name),
            elapsed_ms: facts.elapsed.as_millis() as u64,
            resource_usage: usage,
            message,
        }
    }
}

/// Conventional name for a signal number, e.g. `SIGXFSZ` or `SIGRTMIN+2`
pub fn signal_name(raw: i32) -> String {
    if let Ok(signal) = Signal::try_from(raw) {
        return signal.as_str().to_string();
    }
    let (rtmin, rtmax) = (libc::SIGRTMIN(), libc::SIGRTMAX());
    if (rtmin..=rtmax).contains(&raw) {
        return match raw - rtmin {
            0 => "SIGRTMIN".to_string(),
            offset => format!("SIGRTMIN+{}", offset),
        };
    }
    format!("SIG{}", raw)
}
