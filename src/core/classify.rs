//! Outcome classification
//!
//! A pure function from termination facts to exactly one `StatusCode`.
//! Rules are evaluated in a fixed order; the first match wins:
//!
//! 1. a declared rlimit was crossed (its signal arrived, or a path-backed
//!    output grew past `fsize`) -> that limit's status
//! 2. the watchdog fired -> `TIME_LIMIT_EXCEEDED`
//! 3. terminated by any other signal -> `SIGNALED`
//! 4. non-zero exit, or no exit status at all -> `RUNTIME_ERROR`
//! 5. `OK`

use nix::sys::signal::Signal;
use std::time::Duration;

use super::StatusCode;
use crate::sandbox::LimitPlan;

/// Raw facts collected after the child is gone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminationFacts {
    /// Exit code, when the child exited normally
    pub exit_code: Option<i32>,
    /// Raw terminating signal number, when the child was killed
    pub signal: Option<i32>,
    /// A path-backed output grew past the declared `fsize`
    pub output_overflow: bool,
    /// The watchdog recorded the terminal observation first
    pub watchdog_fired: bool,
    /// The caller aborted the run
    pub aborted: bool,
    /// Wall time from spawn to reap
    pub elapsed: Duration,
    /// Supervision failure (e.g. the exit status could not be read)
    pub failure: Option<String>,
}

impl TerminationFacts {
    pub fn exited(code: i32, elapsed: Duration) -> Self {
        Self {
            exit_code: Some(code),
            elapsed,
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn signaled(signal: Signal, elapsed: Duration) -> Self {
        Self::signaled_raw(signal as i32, elapsed)
    }

    /// Signal death by number, including ones `Signal` cannot name (realtime)
    pub fn signaled_raw(signal: i32, elapsed: Duration) -> Self {
        Self {
            signal: Some(signal),
            elapsed,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            failure: Some(reason.into()),
            elapsed,
            ..Default::default()
        }
    }
}

/// Map termination facts to the single terminal status
pub fn classify(facts: &TerminationFacts, limits: &LimitPlan) -> StatusCode {
    if let Some(status) = facts
        .signal
        .and_then(|raw| Signal::try_from(raw).ok())
        .and_then(|sig| limits.status_for_signal(sig))
    {
        return status;
    }

    if facts.output_overflow {
        return StatusCode::OutputLimitExceeded;
    }

    if facts.watchdog_fired {
        return StatusCode::TimeLimitExceeded;
    }

    if facts.signal.is_some() {
        return StatusCode::Signaled;
    }

    match facts.exit_code {
        Some(0) if facts.failure.is_none() => StatusCode::Ok,
        _ => StatusCode::RuntimeError,
    }
}
