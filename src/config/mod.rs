//! Config module - Invocation and engine configuration
//!
//! This module provides:
//! - `SandboxConfig`: what one invocation should run, and under which view/limits
//! - `EngineConfig`: process-wide defaults (base mounts, search path, kill grace)
//! - Path templates for fd destinations
//!
//! The config module does NOT touch the filesystem or spawn anything; it only
//! parses and validates.

pub mod engine;
pub mod template;

pub use engine::EngineConfig;
pub use template::{PathTemplate, Substitutions};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;

/// Full description of a single sandboxed invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Working directory inside the sandbox view
    pub cwd: PathBuf,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Extra directories appended to the executable search path
    #[serde(default)]
    pub paths: Vec<String>,
    /// Bind mounts, applied in order
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub fd: FdMap,
}

impl SandboxConfig {
    pub fn new(cwd: impl Into<PathBuf>, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cwd: cwd.into(),
            command: command.into_iter().map(Into::into).collect(),
            paths: Vec::new(),
            mounts: Vec::new(),
            limits: ResourceLimits::default(),
            fd: FdMap::default(),
        }
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_fd(mut self, fd: FdMap) -> Self {
        self.fd = fd;
        self
    }

    /// Program name (first element of the command)
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Check every structural invariant of the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cwd.is_absolute() {
            return Err(ConfigError::RelativeCwd(self.cwd.clone()));
        }
        if self.program().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        validate_mounts(&self.mounts)?;
        self.limits.validate()?;
        self.fd.validate()
    }
}

/// Validate a mount sequence (targets and option combinations)
pub fn validate_mounts(mounts: &[Mount]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for mount in mounts {
        mount.validate()?;
        if !seen.insert(normalize(&mount.to)) {
            return Err(ConfigError::DuplicateTarget(mount.to.clone()));
        }
    }
    Ok(())
}

/// Drop `.` components and redundant separators
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// A bind mount from a host path into the sandbox view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    pub from: PathBuf,
    pub to: PathBuf,
    #[serde(default)]
    pub options: Vec<MountOption>,
}

impl Mount {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            options: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: impl IntoIterator<Item = MountOption>) -> Self {
        self.options.extend(options);
        self
    }

    pub fn has(&self, option: MountOption) -> bool {
        self.options.contains(&option)
    }

    pub fn is_exec(&self) -> bool {
        self.has(MountOption::Exec)
    }

    pub fn is_readonly(&self) -> bool {
        self.has(MountOption::Ro)
    }

    pub fn is_optional(&self) -> bool {
        self.has(MountOption::Optional)
    }

    /// Target relative to the view root (`/usr/bin` -> `usr/bin`)
    pub fn relative_target(&self) -> PathBuf {
        normalize(&self.to)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.to.is_absolute() {
            return Err(ConfigError::RelativeTarget(self.to.clone()));
        }
        if self.to.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ConfigError::ParentTraversal(self.to.clone()));
        }
        if self.relative_target().as_os_str().is_empty() {
            return Err(ConfigError::RootTarget);
        }

        for (a, b) in [
            (MountOption::Exec, MountOption::NoExec),
            (MountOption::Ro, MountOption::Rw),
        ] {
            if self.has(a) && self.has(b) {
                return Err(ConfigError::ConflictingOptions {
                    target: self.to.clone(),
                    first: a.as_str(),
                    second: b.as_str(),
                });
            }
        }
        Ok(())
    }
}

/// Access flags for a mount entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountOption {
    /// Allow executing files from this mount even if the source is noexec
    Exec,
    /// Forbid executing files from this mount (the default)
    NoExec,
    /// Read-only
    Ro,
    /// Read-write (the default)
    Rw,
    /// Skip the entry when the source does not exist
    Optional,
}

impl MountOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountOption::Exec => "exec",
            MountOption::NoExec => "noexec",
            MountOption::Ro => "ro",
            MountOption::Rw => "rw",
            MountOption::Optional => "optional",
        }
    }
}

/// Wall-clock budget plus kernel resource limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// Wall-clock budget in milliseconds, 0 = unlimited
    #[serde(default)]
    pub time_ms: u64,
    #[serde(default)]
    pub rlimit: BTreeMap<RlimitKind, RlimitValue>,
}

impl ResourceLimits {
    pub fn with_time_ms(mut self, time_ms: u64) -> Self {
        self.time_ms = time_ms;
        self
    }

    pub fn with_rlimit(mut self, kind: RlimitKind, soft: u64, hard: u64) -> Self {
        self.rlimit.insert(kind, RlimitValue { soft, hard });
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (kind, value) in &self.rlimit {
            if value.soft > value.hard {
                return Err(ConfigError::SoftAboveHard {
                    name: kind.as_str(),
                    soft: value.soft,
                    hard: value.hard,
                });
            }
        }
        Ok(())
    }
}

/// Named POSIX resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlimitKind {
    As,
    Core,
    Cpu,
    Fsize,
    Memlock,
    Nofile,
    Nproc,
    Stack,
}

impl RlimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RlimitKind::As => "as",
            RlimitKind::Core => "core",
            RlimitKind::Cpu => "cpu",
            RlimitKind::Fsize => "fsize",
            RlimitKind::Memlock => "memlock",
            RlimitKind::Nofile => "nofile",
            RlimitKind::Nproc => "nproc",
            RlimitKind::Stack => "stack",
        }
    }
}

impl fmt::Display for RlimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Soft/hard pair, in the kernel's unit for the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RlimitValue {
    pub soft: u64,
    pub hard: u64,
}

/// Redirections for the three standard streams
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FdMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<FdSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<FdSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<FdSpec>,
    /// Send stderr to wherever stdout goes
    #[serde(default)]
    pub stderr_to_stdout: bool,
}

impl FdMap {
    pub fn with_stdin(mut self, spec: FdSpec) -> Self {
        self.stdin = Some(spec);
        self
    }

    pub fn with_stdout(mut self, spec: FdSpec) -> Self {
        self.stdout = Some(spec);
        self
    }

    pub fn with_stderr(mut self, spec: FdSpec) -> Self {
        self.stderr = Some(spec);
        self
    }

    pub fn with_stderr_to_stdout(mut self, value: bool) -> Self {
        self.stderr_to_stdout = value;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stderr_to_stdout && self.stderr.is_some() {
            return Err(ConfigError::StderrConflict);
        }
        for spec in [&self.stdin, &self.stdout, &self.stderr].into_iter().flatten() {
            if let FdSpec::Path(template) = spec {
                template.validate()?;
            }
        }
        Ok(())
    }
}

/// Where a standard stream goes
///
/// Encoded as a plain string: `"inherit"` or a path template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FdSpec {
    /// Share the caller's stream
    Inherit,
    /// Redirect to/from a file
    Path(PathTemplate),
}

impl FdSpec {
    pub const INHERIT: &'static str = "inherit";

    pub fn path(template: impl Into<String>) -> Self {
        FdSpec::Path(PathTemplate::new(template))
    }
}

impl From<String> for FdSpec {
    fn from(value: String) -> Self {
        if value == FdSpec::INHERIT {
            FdSpec::Inherit
        } else {
            FdSpec::Path(PathTemplate::new(value))
        }
    }
}

impl From<FdSpec> for String {
    fn from(spec: FdSpec) -> Self {
        match spec {
            FdSpec::Inherit => FdSpec::INHERIT.to_string(),
            FdSpec::Path(template) => template.as_str().to_string(),
        }
    }
}
