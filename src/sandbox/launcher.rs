//! Process launcher
//!
//! Spawns exactly one child and owns it until it is reaped:
//! - resolves `command[0]` against the sandbox view
//! - opens the fd destinations
//! - constrains the child between fork and exec (mounts, rlimits, privileges)
//! - races natural exit against the watchdog and a caller abort
//! - collects exit status, elapsed time and `rusage`
//! - cuts path-backed outputs back to the `fsize` limit

use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::limits::LimitPlan;
use super::mount::{to_cstring, ChildMounts, FsView, HostView, MountSession};
use super::watchdog::{kill_group, terminate_group, Terminal, TerminalSlot, Watchdog};
use crate::config::{FdMap, FdSpec, SandboxConfig, Substitutions};
use crate::core::{ResourceUsage, TerminationFacts};
use crate::error::SetupError;

/// Where in the pre-exec sequence the child gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChildStage {
    ParentDeathSignal = 1,
    Mount = 2,
    Limits = 3,
    /// Switching to the sandbox user and entering cwd
    Credentials = 4,
    NoNewPrivs = 5,
    /// No stage byte was written: `execve` itself failed
    Exec = 6,
}

impl ChildStage {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => ChildStage::ParentDeathSignal,
            2 => ChildStage::Mount,
            3 => ChildStage::Limits,
            4 => ChildStage::Credentials,
            5 => ChildStage::NoNewPrivs,
            _ => ChildStage::Exec,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChildStage::ParentDeathSignal => "parent death signal",
            ChildStage::Mount => "mount setup",
            ChildStage::Limits => "resource limits",
            ChildStage::Credentials => "privilege drop",
            ChildStage::NoNewPrivs => "no_new_privs",
            ChildStage::Exec => "exec",
        }
    }
}

/// Why no child ran
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("executable not found in sandbox: {0}")]
    NotFound(String),

    #[error("child failed during {}: {source}", stage.as_str())]
    Spawn {
        stage: ChildStage,
        #[source]
        source: io::Error,
    },
}

/// What the launcher observed about a child that ran
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub facts: TerminationFacts,
    pub usage: ResourceUsage,
}

/// Spawns and supervises children with engine-wide settings
#[derive(Debug, Clone)]
pub struct Launcher {
    search_path: Vec<PathBuf>,
    kill_grace: Duration,
}

impl Launcher {
    pub fn new(search_path: Vec<PathBuf>, kill_grace: Duration) -> Self {
        Self {
            search_path,
            kill_grace,
        }
    }

    /// Run `config` to completion inside `session` (or the host view when
    /// `None`), under `limits`, until it exits, times out or `cancel` fires.
    pub async fn launch(
        &self,
        config: &SandboxConfig,
        vars: &Substitutions,
        session: Option<&MountSession>,
        limits: &LimitPlan,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutcome, LaunchError> {
        let view: &(dyn FsView + Sync) = match session {
            Some(session) => session,
            None => &HostView,
        };

        if !view.is_dir(&config.cwd) {
            return Err(SetupError::MissingCwd(config.cwd.clone()).into());
        }

        let search_path = self.child_search_path(config);
        let program = resolve_program(view, config.program(), &config.cwd, &search_path)
            .ok_or_else(|| LaunchError::NotFound(config.program().to_string()))?;
        let streams = Streams::open(&config.fd, vars)?;

        let mut cmd = Command::new(&program);
        cmd.arg0(config.program())
            .args(&config.command[1..])
            .env_clear()
            .env("PATH", join_search_path(&search_path))
            .process_group(0)
            .stdin(streams.stdin)
            .stdout(streams.stdout)
            .stderr(streams.stderr);

        let (status_read, status_write) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| SetupError::StatusPipe(e.into()))?;
        let child_setup = ChildSetup {
            mounts: session.map(MountSession::child_mounts),
            cwd: to_cstring(&config.cwd)?,
            limits: limits.clone(),
            status_fd: status_write.as_raw_fd(),
        };
        if session.is_none() {
            cmd.current_dir(&config.cwd);
        }
        unsafe {
            cmd.pre_exec(move || child_setup.run());
        }

        debug!("Spawning {} as {}", config.program(), program.display());
        let started = Instant::now();
        let spawned = cmd.spawn();
        drop(status_write);
        drop(cmd);

        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                return Err(LaunchError::Spawn {
                    stage: read_stage(status_read),
                    source,
                })
            }
        };
        drop(status_read);

        let pid = child.id() as libc::pid_t;
        let pgid = Pid::from_raw(pid);
        drop(child);
        info!("Spawned child {} ({})", pid, config.program());

        let slot = Arc::new(TerminalSlot::new());
        let watchdog = limits
            .wall_time()
            .map(|limit| Watchdog::arm(pgid, limit, self.kill_grace, Arc::clone(&slot)));

        let reaper_slot = Arc::clone(&slot);
        let mut reaper = tokio::task::spawn_blocking(move || await_exit(pid, started, &reaper_slot));

        let exited = tokio::select! {
            exited = &mut reaper => exited,
            _ = cancel.cancelled() => {
                if slot.claim(Terminal::Aborted) {
                    info!("Run aborted by caller, terminating process group {}", pgid);
                    terminate_group(pgid, self.kill_grace).await;
                }
                (&mut reaper).await
            }
        };

        if let Some(watchdog) = watchdog {
            watchdog.disarm().await;
        }

        // Nothing signals the group past this point, so the leader's pid (and
        // with it the pgid) may be released.
        let reaped = match exited {
            Ok(Ok(elapsed)) => collect(pid, elapsed).map_err(|e| format!("wait4 failed: {}", e)),
            Ok(Err(e)) => {
                kill_group(pgid);
                Err(format!("waitid failed: {}", e))
            }
            Err(e) => {
                kill_group(pgid);
                Err(format!("reaper task failed: {}", e))
            }
        };

        let winner = slot.winner();
        let (mut facts, mut usage) = match reaped {
            Ok(reaped) => (reaped.facts(), reaped.usage()),
            Err(reason) => (
                TerminationFacts::failed(reason, started.elapsed()),
                ResourceUsage::default(),
            ),
        };
        facts.watchdog_fired = winner == Some(Terminal::TimedOut);
        facts.aborted = winner == Some(Terminal::Aborted);
        if let Some(cap) = limits.output_cap() {
            for path in [&streams.stdout_path, &streams.stderr_path].into_iter().flatten() {
                facts.output_overflow |= clamp_output(path, cap);
            }
        }
        usage.stdout_bytes = streams.stdout_path.as_deref().and_then(file_len);
        usage.stderr_bytes = streams.stderr_path.as_deref().and_then(file_len);

        Ok(LaunchOutcome { facts, usage })
    }

    /// Engine search path followed by the invocation's extra `paths`
    fn child_search_path(&self, config: &SandboxConfig) -> Vec<PathBuf> {
        self.search_path
            .iter()
            .cloned()
            .chain(config.paths.iter().map(PathBuf::from))
            .collect()
    }
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|meta| meta.len())
}

/// Cut `path` back to `cap` bytes. Returns whether it had grown past `cap`.
fn clamp_output(path: &Path, cap: u64) -> bool {
    let Some(len) = file_len(path) else {
        return false;
    };
    if len <= cap {
        return false;
    }

    warn!(
        "{} reached {} bytes, over the {} byte fsize limit",
        path.display(),
        len,
        cap
    );
    let truncated = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(cap));
    if let Err(e) = truncated {
        warn!("Failed to truncate {}: {}", path.display(), e);
    }
    true
}

fn join_search_path(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|dir| dir.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":")
}

/// Locate `program` in `view` the way `execvp` would after the view is entered.
///
/// Returns the path to hand to `execve` inside the view.
pub fn resolve_program(
    view: &dyn FsView,
    program: &str,
    cwd: &Path,
    search_path: &[PathBuf],
) -> Option<PathBuf> {
    if program.contains('/') {
        let path = cwd.join(program);
        return view.is_executable(&path).then_some(path);
    }

    search_path
        .iter()
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(program))
        .find(|candidate| view.is_executable(candidate))
}

/// Child-side setup, run between fork and exec
struct ChildSetup {
    mounts: Option<Arc<ChildMounts>>,
    cwd: CString,
    limits: LimitPlan,
    status_fd: RawFd,
}

impl ChildSetup {
    fn run(&self) -> io::Result<()> {
        self.stage(
            ChildStage::ParentDeathSignal,
            prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from),
        )?;
        if let Some(mounts) = &self.mounts {
            self.stage(ChildStage::Mount, mounts.enter())?;
        }
        self.stage(ChildStage::Limits, self.limits.apply())?;
        if let Some(mounts) = &self.mounts {
            self.stage(ChildStage::Credentials, mounts.drop_privileges(&self.cwd))?;
        }
        self.stage(
            ChildStage::NoNewPrivs,
            prctl::set_no_new_privs().map_err(io::Error::from),
        )
    }

    /// Report the failing stage to the parent before passing the error on
    fn stage(&self, stage: ChildStage, result: io::Result<()>) -> io::Result<()> {
        if result.is_err() {
            let byte = stage as u8;
            unsafe {
                libc::write(self.status_fd, (&byte as *const u8).cast(), 1);
            }
        }
        result
    }
}

fn read_stage(status_read: OwnedFd) -> ChildStage {
    let mut byte = [0u8; 1];
    match File::from(status_read).read(&mut byte) {
        Ok(1) => ChildStage::from_byte(byte[0]),
        _ => ChildStage::Exec,
    }
}

/// Child's standard streams plus the paths whose size is reported afterward
struct Streams {
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
}

impl Streams {
    fn open(fd: &FdMap, vars: &Substitutions) -> Result<Self, SetupError> {
        let stdin = match &fd.stdin {
            None => Stdio::null(),
            Some(FdSpec::Inherit) => Stdio::inherit(),
            Some(FdSpec::Path(template)) => {
                let path = template.resolve(vars)?;
                let file = File::open(&path).map_err(|source| SetupError::Stream {
                    stream: "stdin",
                    path: path.clone(),
                    source,
                })?;
                Stdio::from(file)
            }
        };

        let (stdout, stdout_shared, stdout_path) = open_output("stdout", fd.stdout.as_ref(), vars)?;

        let (stderr, stderr_path) = if fd.stderr_to_stdout {
            (stdout_shared, None)
        } else {
            let (stderr, _, path) = open_output("stderr", fd.stderr.as_ref(), vars)?;
            (stderr, path)
        };

        Ok(Self {
            stdin,
            stdout,
            stderr,
            stdout_path,
            stderr_path,
        })
    }
}

/// Open an output destination, also returning a second handle to the same sink
fn open_output(
    stream: &'static str,
    spec: Option<&FdSpec>,
    vars: &Substitutions,
) -> Result<(Stdio, Stdio, Option<PathBuf>), SetupError> {
    let stream_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SetupError::Stream {
            stream,
            path,
            source,
        }
    };

    match spec {
        None => Ok((Stdio::null(), Stdio::null(), None)),
        Some(FdSpec::Inherit) => {
            let own = match stream {
                "stderr" => io::stderr().as_fd().try_clone_to_owned(),
                _ => io::stdout().as_fd().try_clone_to_owned(),
            }
            .map_err(stream_err(Path::new(stream)))?;
            let shared = own.try_clone().map_err(stream_err(Path::new(stream)))?;
            Ok((Stdio::from(own), Stdio::from(shared), None))
        }
        Some(FdSpec::Path(template)) => {
            let path = template.resolve(vars)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(stream_err(&path))?;
            }
            let file = File::create(&path).map_err(stream_err(&path))?;
            let shared = file.try_clone().map_err(stream_err(&path))?;
            debug!("{} -> {}", stream, path.display());
            Ok((Stdio::from(file), Stdio::from(shared), Some(path)))
        }
    }
}

/// Raw result of `wait4`
struct Reaped {
    status: libc::c_int,
    rusage: libc::rusage,
    elapsed: Duration,
}

impl Reaped {
    fn facts(&self) -> TerminationFacts {
        if libc::WIFEXITED(self.status) {
            return TerminationFacts::exited(libc::WEXITSTATUS(self.status), self.elapsed);
        }
        if libc::WIFSIGNALED(self.status) {
            return TerminationFacts::signaled_raw(libc::WTERMSIG(self.status), self.elapsed);
        }
        TerminationFacts::failed(
            format!("unexpected wait status {:#x}", self.status),
            self.elapsed,
        )
    }

    fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            user_time_ms: timeval_ms(&self.rusage.ru_utime),
            sys_time_ms: timeval_ms(&self.rusage.ru_stime),
            // Linux reports KB
            max_rss_kb: self.rusage.ru_maxrss.max(0) as u64,
            stdout_bytes: None,
            stderr_bytes: None,
        }
    }
}

fn timeval_ms(tv: &libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}

/// Block until `pid` exits, claim the exit and kill what is left of its
/// process group. Returns the elapsed wall time.
///
/// The leader stays an uncollected zombie: its pid, and with it the pgid,
/// cannot go to another process until `collect`.
fn await_exit(pid: libc::pid_t, started: Instant, slot: &TerminalSlot) -> io::Result<Duration> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    let elapsed = started.elapsed();
    slot.claim(Terminal::Exited);
    // Descendants that outlived the leader
    kill_group(Pid::from_raw(pid));
    Ok(elapsed)
}

/// Collect an exited child with `wait4`. Does not block once `await_exit`
/// has returned.
fn collect(pid: libc::pid_t, elapsed: Duration) -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(Reaped {
        status,
        rusage,
        elapsed,
    })
}
