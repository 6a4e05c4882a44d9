use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    RuntimeError,
    TimeLimitExceeded,
    OutputLimitExceeded,
    Signaled,
    MountError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::RuntimeError => "RUNTIME_ERROR",
            StatusCode::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            StatusCode::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            StatusCode::Signaled => "SIGNALED",
            StatusCode::MountError => "MOUNT_ERROR",
        }
    }

    /// Whether the status was produced before any child ran
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, StatusCode::MountError)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
