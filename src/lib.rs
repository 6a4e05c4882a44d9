//! jailrun - sandboxed execution of a single untrusted command
//!
//! One invocation: build an isolated filesystem view from bind mounts, spawn
//! exactly one child under rlimits and a wall-clock watchdog, and classify
//! how it ended into a `StatusCode`.

pub mod config;
pub mod core;
pub mod error;
pub mod runner;
pub mod sandbox;

pub use crate::config::{EngineConfig, SandboxConfig, Substitutions};
pub use crate::core::{ExecutionReport, ResourceUsage, StatusCode};
pub use crate::error::{ConfigError, SetupError};
pub use crate::runner::SandboxedRunner;
