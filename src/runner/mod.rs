//! Runner module - One sandboxed invocation, start to finish
//!
//! `SandboxedRunner` drives the components in order:
//! validate -> mount view -> limit plan -> launch (+ watchdog) -> classify -> report.
//! The mount session is scoped to `run`, so the view is released on every path.
//!
//! The runner module does NOT:
//! - Touch the kernel directly (that's `sandbox`)
//! - Read configuration files
//! - Schedule or queue invocations

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, SandboxConfig, Substitutions};
use crate::core::{classify, ExecutionReport, StatusCode};
use crate::sandbox::{ChildStage, LaunchError, Launcher, LimitPlan, MountSession};

/// Runs untrusted commands in a fresh sandbox per invocation
#[derive(Debug, Clone)]
pub struct SandboxedRunner {
    engine: EngineConfig,
    launcher: Launcher,
}

impl SandboxedRunner {
    pub fn new(engine: EngineConfig) -> Self {
        let launcher = Launcher::new(engine.search_path.clone(), engine.kill_grace());
        Self { engine, launcher }
    }

    /// Run one invocation. Always produces a report.
    pub async fn run(
        &self,
        config: &SandboxConfig,
        vars: &Substitutions,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        if let Err(e) = config.validate() {
            warn!("Rejected invocation config: {}", e);
            return ExecutionReport::setup_failure(e.to_string());
        }

        // No mounts: run against the host filesystem, no namespace.
        let session = if config.mounts.is_empty() {
            None
        } else {
            let mounts = self.engine.base_mounts.iter().chain(config.mounts.iter());
            match MountSession::prepare(mounts, &self.engine.work_root()) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Sandbox setup failed: {}", e);
                    return ExecutionReport::setup_failure(e.to_string());
                }
            }
        };

        let limits = LimitPlan::new(&config.limits);
        let launched = self
            .launcher
            .launch(config, vars, session.as_ref(), &limits, &cancel)
            .await;

        let report = match launched {
            Ok(outcome) => {
                let status = classify(&outcome.facts, &limits);
                ExecutionReport::from_facts(status, &outcome.facts, Some(outcome.usage))
            }
            Err(e) => failure_report(e),
        };
        drop(session);

        match report.status {
            StatusCode::Ok | StatusCode::RuntimeError => info!(
                "{} finished: {} (exit code {:?}, {}ms)",
                config.program(),
                report.status,
                report.exit_code,
                report.elapsed_ms
            ),
            _ => warn!(
                "{} finished: {} (signal {:?}, {}ms)",
                config.program(),
                report.status,
                report.signal,
                report.elapsed_ms
            ),
        }
        report
    }
}

fn failure_report(err: LaunchError) -> ExecutionReport {
    match &err {
        LaunchError::Setup(_) => {
            warn!("Sandbox setup failed: {}", err);
            ExecutionReport::setup_failure(err.to_string())
        }
        LaunchError::Spawn {
            stage: ChildStage::Mount | ChildStage::Credentials,
            ..
        } => {
            error!("{}", err);
            ExecutionReport::setup_failure(err.to_string())
        }
        LaunchError::NotFound(_) | LaunchError::Spawn { .. } => {
            warn!("{}", err);
            ExecutionReport::not_started(StatusCode::RuntimeError, err.to_string())
        }
    }
}
