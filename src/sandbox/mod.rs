//! Sandbox module - Process isolation and supervision
//!
//! This module owns everything that touches the kernel for one invocation:
//! - Mount planning and the child-side mount namespace setup
//! - Resource limit plans applied between fork and exec
//! - The wall-clock watchdog and process group termination
//! - Spawning, reaping and `rusage` collection
//!
//! The sandbox module does NOT:
//! - Decide the final status (that's `core::classify`)
//! - Parse configuration
//! - Build reports

pub mod launcher;
pub mod limits;
pub mod mount;
pub mod watchdog;

// Re-exports for convenience
pub use launcher::{resolve_program, ChildStage, LaunchError, LaunchOutcome, Launcher};
pub use limits::{limit_signal, LimitPlan, PlannedLimit};
pub use mount::{ChildMounts, EntryKind, FsView, HostView, MountSession, PlannedMount};
pub use watchdog::{kill_group, terminate_group, Terminal, TerminalSlot, Watchdog};
