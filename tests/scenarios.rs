//! End-to-end invocations through `SandboxedRunner`

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jailrun::config::{FdMap, FdSpec, Mount, MountOption, ResourceLimits, RlimitKind};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use jailrun::{EngineConfig, ExecutionReport, SandboxConfig, SandboxedRunner, StatusCode, Substitutions};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn host_runner() -> SandboxedRunner {
    SandboxedRunner::new(EngineConfig::default())
}

/// Runner with the bundled base mounts and a private work root
fn isolated_runner(work: &Path) -> SandboxedRunner {
    let mut engine = EngineConfig::bundled().unwrap();
    engine.work_root = Some(work.to_path_buf());
    SandboxedRunner::new(engine)
}

async fn run(runner: &SandboxedRunner, config: &SandboxConfig, vars: &Substitutions) -> ExecutionReport {
    runner.run(config, vars, CancellationToken::new()).await
}

fn sh(script: &str) -> SandboxConfig {
    SandboxConfig::new("/", ["sh", "-c", script])
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A tmpfs mounted `noexec` in the test's own namespace, unmounted on drop
struct NoexecDir {
    dir: TempDir,
}

impl NoexecDir {
    /// `None` unless we may mount here (root)
    fn new() -> Option<Self> {
        let dir = TempDir::new().unwrap();
        mount(
            Some("tmpfs"),
            dir.path(),
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=0755"),
        )
        .ok()?;
        Some(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for NoexecDir {
    fn drop(&mut self) {
        let _ = umount2(self.dir.path(), MntFlags::MNT_DETACH);
    }
}

/// Whether this host lets us build a mount namespace at all
async fn namespaces_available(runner: &SandboxedRunner, scratch: &Path) -> bool {
    let config = sh("true").with_mount(Mount::new(scratch, "/probe"));
    let report = run(runner, &config, &Substitutions::new()).await;
    if report.status == StatusCode::MountError {
        eprintln!("skipping: mount namespaces unavailable ({:?})", report.message);
        return false;
    }
    true
}

#[tokio::test]
async fn test_clean_exit_is_ok() {
    let report = run(&host_runner(), &sh("exit 0"), &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::Ok);
    assert_eq!(report.exit_code, Some(0));
    assert!(report.resource_usage.is_some());
}

#[tokio::test]
async fn test_nonzero_exit_is_runtime_error() {
    let report = run(&host_runner(), &sh("exit 3"), &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::RuntimeError);
    assert_eq!(report.exit_code, Some(3));
    assert_eq!(report.signal, None);
}

#[tokio::test]
async fn test_fatal_signal_is_signaled() {
    let report = run(&host_runner(), &sh("kill -SEGV $$"), &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::Signaled);
    assert_eq!(report.signal.as_deref(), Some("SIGSEGV"));
    assert_eq!(report.exit_code, None);
}

#[tokio::test]
async fn test_wall_time_limit() {
    let config = sh("sleep 10").with_limits(ResourceLimits::default().with_time_ms(300));
    let report = run(&host_runner(), &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::TimeLimitExceeded);
    assert!(report.elapsed_ms >= 300, "elapsed {}ms", report.elapsed_ms);
    assert!(report.elapsed_ms < 1300, "elapsed {}ms", report.elapsed_ms);
}

#[tokio::test]
async fn test_wall_time_limit_catches_descendants() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("survived");
    let script = format!("(sleep 1; touch {}) & sleep 10", marker.display());
    let config = sh(&script).with_limits(ResourceLimits::default().with_time_ms(200));

    let report = run(&host_runner(), &config, &Substitutions::new()).await;
    assert_eq!(report.status, StatusCode::TimeLimitExceeded);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_output_limit_truncates_file() {
    let dir = TempDir::new().unwrap();
    let config = sh("while :; do echo 0123456789; done")
        .with_limits(
            ResourceLimits::default()
                .with_time_ms(2000)
                .with_rlimit(RlimitKind::Fsize, 1024, 1024),
        )
        .with_fd(FdMap::default().with_stdout(FdSpec::path("$TEMP_PATH/stdout.txt")));
    let vars = Substitutions::new().with("TEMP_PATH", dir.path().to_string_lossy());

    let report = run(&host_runner(), &config, &vars).await;

    assert_eq!(report.status, StatusCode::OutputLimitExceeded);
    let written = fs::metadata(dir.path().join("stdout.txt")).unwrap().len();
    assert!(written <= 1024, "wrote {} bytes", written);
    assert_eq!(report.resource_usage.unwrap().stdout_bytes, Some(written));
}

#[tokio::test]
async fn test_output_limit_when_program_ignores_sigxfsz() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("stdout.txt");
    let config = sh("trap '' XFSZ; while :; do echo 0123456789; done")
        .with_limits(
            ResourceLimits::default()
                .with_time_ms(500)
                .with_rlimit(RlimitKind::Fsize, 1024, 1024),
        )
        .with_fd(FdMap::default().with_stdout(FdSpec::path(out.to_string_lossy())));

    let report = run(&host_runner(), &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::OutputLimitExceeded);
    assert_eq!(fs::metadata(&out).unwrap().len(), 1024);
}

#[tokio::test]
async fn test_output_limit_for_python() {
    if !Path::new("/usr/bin/python3").exists() {
        eprintln!("skipping: python3 not installed");
        return;
    }
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("stdout.txt");
    let config = SandboxConfig::new("/", ["python3", "-c", "while True: print('x' * 100)"])
        .with_limits(
            ResourceLimits::default()
                .with_time_ms(2000)
                .with_rlimit(RlimitKind::Fsize, 1024, 1024),
        )
        .with_fd(FdMap::default().with_stdout(FdSpec::path(out.to_string_lossy())));

    let report = run(&host_runner(), &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::OutputLimitExceeded);
    assert!(fs::metadata(&out).unwrap().len() <= 1024);
}

#[tokio::test]
async fn test_realtime_signal_is_signaled() {
    let script = format!("kill -{} $$", libc::SIGRTMIN() + 2);
    let report = run(&host_runner(), &sh(&script), &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::Signaled);
    assert_eq!(report.signal.as_deref(), Some("SIGRTMIN+2"));
    assert_eq!(report.message, None);
}

#[tokio::test]
async fn test_repeated_runs_agree() {
    let config = sh("echo stable; exit 7");

    let first = run(&host_runner(), &config, &Substitutions::new()).await;
    let second = run(&host_runner(), &config, &Substitutions::new()).await;

    assert_eq!(first.status, StatusCode::RuntimeError);
    assert_eq!(first.status, second.status);
    assert_eq!(first.exit_code, second.exit_code);
}

#[tokio::test]
async fn test_missing_mount_source_is_mount_error() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let config = sh(&format!("touch {}", marker.display()))
        .with_mount(Mount::new(dir.path().join("does-not-exist"), "/data"));

    let report = run(&isolated_runner(dir.path()), &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::MountError);
    assert!(report.message.unwrap().contains("does-not-exist"));
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_abort_terminates_run() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = host_runner()
        .run(&sh("sleep 10"), &Substitutions::new(), cancel)
        .await;

    assert_eq!(report.status, StatusCode::Signaled);
    assert_eq!(report.message.as_deref(), Some("aborted by caller"));
    assert!(report.elapsed_ms < 2000);
}

#[tokio::test]
async fn test_fixture_output_limit_exceeded() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let main = write_script(temp.path(), "main", "while :; do printf 'x'; done");
    let fixture = fs::read_to_string(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/output_limit_exceeded.json"
    ))
    .unwrap()
    .replace("@MAIN@", &main.to_string_lossy());
    let config: SandboxConfig = serde_json::from_str(&fixture).unwrap();
    let vars = Substitutions::new().with("TEMP_PATH", temp.path().to_string_lossy());

    let report = run(&runner, &config, &vars).await;

    assert_eq!(report.status, StatusCode::OutputLimitExceeded);
    assert!(fs::metadata(temp.path().join("stdout.txt")).unwrap().len() <= 1024);
}

#[tokio::test]
async fn test_exec_mount_runs_binary() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let main = write_script(temp.path(), "main", "echo from-main; exit 5");
    let out = temp.path().join("out.txt");
    let config = SandboxConfig::new("/", ["main"])
        .with_mount(Mount::new(&main, "/usr/local/bin/main").with_options([MountOption::Exec]))
        .with_fd(FdMap::default().with_stdout(FdSpec::path(out.to_string_lossy())));

    let report = run(&runner, &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::RuntimeError);
    assert_eq!(report.exit_code, Some(5));
    assert_eq!(fs::read_to_string(&out).unwrap(), "from-main\n");
}

#[tokio::test]
async fn test_exec_mount_overrides_noexec_backing() {
    let Some(noexec) = NoexecDir::new() else {
        eprintln!("skipping: cannot mount a noexec tmpfs here");
        return;
    };
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let main = write_script(noexec.path(), "main", "exit 5");

    // Straight from the noexec tmpfs the kernel refuses it
    let direct = SandboxConfig::new("/", [main.to_string_lossy()]);
    let report = run(&host_runner(), &direct, &Substitutions::new()).await;
    assert_eq!(report.status, StatusCode::RuntimeError);
    assert_eq!(report.exit_code, None);

    let config = SandboxConfig::new("/", ["main"])
        .with_mount(Mount::new(&main, "/usr/local/bin/main").with_options([MountOption::Exec]));
    let report = run(&runner, &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::RuntimeError);
    assert_eq!(report.exit_code, Some(5));
}

#[tokio::test]
async fn test_child_is_unprivileged_and_confined() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let data = temp.path().join("data");
    fs::create_dir(&data).unwrap();
    fs::set_permissions(&data, fs::Permissions::from_mode(0o777)).unwrap();
    let out = temp.path().join("out.txt");
    // A second chroot is the classic way out of a chroot-only jail
    let script = "id -u; \
        chroot / true && echo ESCAPED; \
        test -e /proc/self && echo HOST_PROC; \
        echo x > /data/written || echo RO_HELD";
    let config = sh(script)
        .with_mount(Mount::new(&data, "/data").with_options([MountOption::Ro]))
        .with_fd(FdMap::default().with_stdout(FdSpec::path(out.to_string_lossy())));

    let report = run(&runner, &config, &Substitutions::new()).await;
    let output = fs::read_to_string(&out).unwrap();

    assert_eq!(report.status, StatusCode::Ok);
    assert_eq!(output.lines().next(), Some("65534"));
    assert!(!output.contains("ESCAPED"), "{}", output);
    assert!(!output.contains("HOST_PROC"), "{}", output);
    assert!(output.contains("RO_HELD"), "{}", output);
    assert!(!data.join("written").exists());
}

#[tokio::test]
async fn test_mount_without_exec_cannot_run() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let main = write_script(temp.path(), "main", "exit 0");
    let config = SandboxConfig::new("/", ["/opt/main"]).with_mount(Mount::new(&main, "/opt/main"));

    let report = run(&runner, &config, &Substitutions::new()).await;
    assert_eq!(report.status, StatusCode::RuntimeError);
    assert_eq!(report.exit_code, None);
}

#[tokio::test]
async fn test_view_hides_unmounted_paths() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let secret = temp.path().join("secret");
    fs::write(&secret, "hidden").unwrap();
    let script = format!("test ! -e {}", secret.display());
    let config = sh(&script).with_mount(Mount::new(temp.path().join("secret"), "/visible"));

    let report = run(&runner, &config, &Substitutions::new()).await;
    assert_eq!(report.status, StatusCode::Ok);
}

#[tokio::test]
async fn test_readonly_mount_rejects_writes() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let data = temp.path().join("data");
    fs::create_dir(&data).unwrap();
    let config = sh("echo x > /data/written")
        .with_mount(Mount::new(&data, "/data").with_options([MountOption::Ro]));

    let report = run(&runner, &config, &Substitutions::new()).await;

    assert_eq!(report.status, StatusCode::RuntimeError);
    assert!(!data.join("written").exists());
}

#[tokio::test]
async fn test_view_root_is_released() {
    let work = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let runner = isolated_runner(work.path());
    if !namespaces_available(&runner, temp.path()).await {
        return;
    }

    let config = sh("exit 0").with_mount(Mount::new(temp.path(), "/scratch"));
    run(&runner, &config, &Substitutions::new()).await;

    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}
