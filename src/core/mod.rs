//! Core module - Outcome types
//!
//! This module provides:
//! - `StatusCode`: the closed set of terminal statuses
//! - `classify`: termination facts -> status, as a pure function
//! - `ExecutionReport`: what the caller gets back
//!
//! Nothing here spawns processes or touches the filesystem.

pub mod classify;
pub mod report;
pub mod status;

pub use classify::{classify, TerminationFacts};
pub use report::{signal_name, ExecutionReport, ResourceUsage};
pub use status::StatusCode;
