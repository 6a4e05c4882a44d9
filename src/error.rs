//! Setup error types
//!
//! Everything that can go wrong before a child process exists. The runner
//! turns any of these into a `MOUNT_ERROR` report; none of them ever leak
//! out as a runtime status.

use std::path::PathBuf;

/// Invalid invocation configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cwd must be an absolute path: {0}")]
    RelativeCwd(PathBuf),

    #[error("command is empty")]
    EmptyCommand,

    #[error("mount target must be an absolute path: {0}")]
    RelativeTarget(PathBuf),

    #[error("mount target must not contain '..': {0}")]
    ParentTraversal(PathBuf),

    #[error("mount target must not be the sandbox root")]
    RootTarget,

    #[error("duplicate mount target: {0}")]
    DuplicateTarget(PathBuf),

    #[error("conflicting mount options on {target}: {first} and {second}")]
    ConflictingOptions {
        target: PathBuf,
        first: &'static str,
        second: &'static str,
    },

    #[error("rlimit {name}: soft limit {soft} exceeds hard limit {hard}")]
    SoftAboveHard { name: &'static str, soft: u64, hard: u64 },

    #[error("malformed path template {template:?}: {reason}")]
    MalformedTemplate { template: String, reason: &'static str },

    #[error("fd.stderr and fd.stderr_to_stdout are mutually exclusive")]
    StderrConflict,

    #[error("unresolved variable ${name} in {template:?}")]
    UnresolvedVariable { name: String, template: String },
}

/// Failure while preparing the sandbox for a child
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("mount source does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("mount source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mount target {target} lies inside mount {covering} but does not exist there")]
    TargetInsideMount { target: PathBuf, covering: PathBuf },

    #[error("mount target {target} exists with a different file type than its source")]
    TargetKindMismatch { target: PathBuf },

    #[error("failed to prepare sandbox root: {0}")]
    Root(#[source] std::io::Error),

    #[error("failed to create mount point {path}: {source}")]
    MountPoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path contains an interior NUL byte: {0}")]
    NulByte(PathBuf),

    #[error("cwd does not exist in the sandbox view: {0}")]
    MissingCwd(PathBuf),

    #[error("failed to open {stream} destination {path}: {source}")]
    Stream {
        stream: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create child status pipe: {0}")]
    StatusPipe(#[source] std::io::Error),
}

pub type SetupResult<T> = std::result::Result<T, SetupError>;
