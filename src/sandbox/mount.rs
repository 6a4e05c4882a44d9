//! Mount manager
//!
//! Builds the sandbox filesystem view in two halves:
//! - parent side (`MountSession::prepare`): resolve sources, create mount
//!   point stubs under a fresh view root, precompute every syscall argument
//! - child side (`ChildMounts::enter`): new mount namespace, bind + remount
//!   each entry in order, pivot_root into the view root and detach the old
//!   root; then `ChildMounts::drop_privileges` switches to the sandbox user
//!
//! Mounts only ever exist inside the child's private namespace. The parent
//! never writes into a mounted source; a target that lands inside an earlier
//! mount must already exist there.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::unistd::{chdir, pivot_root, setgroups, setresgid, setresuid, Gid, Uid};
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::Mount;
use crate::error::{SetupError, SetupResult};

/// uid and gid the child runs as inside the view (`nobody`/`nogroup`)
pub const SANDBOX_ID: u32 = 65534;

/// Maps paths in the sandbox view to the host paths that back them
pub trait FsView {
    fn host_path(&self, view_path: &Path) -> PathBuf;

    /// Whether `view_path` is an executable regular file in the view
    fn is_executable(&self, view_path: &Path) -> bool {
        fs::metadata(self.host_path(view_path))
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn is_dir(&self, view_path: &Path) -> bool {
        self.host_path(view_path).is_dir()
    }
}

/// The caller's own filesystem, used when no mounts are configured
#[derive(Debug, Clone, Copy, Default)]
pub struct HostView;

impl FsView for HostView {
    fn host_path(&self, view_path: &Path) -> PathBuf {
        view_path.to_path_buf()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

impl EntryKind {
    fn of(meta: &fs::Metadata) -> Self {
        if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        }
    }
}

/// A mount entry with its source resolved on the host
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMount {
    /// Canonical host source
    pub source: PathBuf,
    /// Absolute target inside the view
    pub target: PathBuf,
    pub kind: EntryKind,
    pub readonly: bool,
    pub exec: bool,
}

impl PlannedMount {
    fn relative_target(&self) -> &Path {
        self.target.strip_prefix("/").unwrap_or(&self.target)
    }

    /// Flags for the second (remount) pass that actually applies access options
    fn remount_flags(&self) -> MsFlags {
        let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if self.readonly {
            flags |= MsFlags::MS_RDONLY;
        }
        if !self.exec {
            flags |= MsFlags::MS_NOEXEC;
        }
        flags | self.inherited_flags()
    }

    /// Flags of the source mount that a remount may not drop.
    ///
    /// `noexec` is left out when `exec` was requested: that override is the
    /// point of the option.
    fn inherited_flags(&self) -> MsFlags {
        let Ok(stat) = statvfs(&self.source) else {
            return MsFlags::empty();
        };
        let source = stat.flags();
        let mut flags = MsFlags::empty();
        for (fs_flag, ms_flag) in [
            (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
            (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
            (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
            (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
        ] {
            if source.contains(fs_flag) {
                flags |= ms_flag;
            }
        }
        if !self.exec && source.contains(FsFlags::ST_NOEXEC) {
            flags |= MsFlags::MS_NOEXEC;
        }
        flags
    }
}

/// One bind mount, ready for the child
#[derive(Debug)]
struct MountOp {
    source: CString,
    target: CString,
    remount: MsFlags,
}

/// Everything the child needs to enter the view, with no allocation left to do
#[derive(Debug)]
pub struct ChildMounts {
    ops: Vec<MountOp>,
    root: CString,
    user_namespace: bool,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl ChildMounts {
    /// Enter a private mount namespace, apply every mount and make the view
    /// root `/`. The caller's root is detached, not just hidden.
    ///
    /// Runs in the forked child: only syscalls on precomputed arguments.
    pub fn enter(&self) -> io::Result<()> {
        let mut flags = CloneFlags::CLONE_NEWNS;
        if self.user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        unshare(flags)?;

        if self.user_namespace {
            write_proc(c"/proc/self/setgroups", b"deny")?;
            write_proc(c"/proc/self/uid_map", &self.uid_map)?;
            write_proc(c"/proc/self/gid_map", &self.gid_map)?;
        }

        // Nothing below may propagate back into the caller's namespace.
        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )?;

        // pivot_root wants the new root to be a mount point of its own.
        mount(
            Some(self.root.as_c_str()),
            self.root.as_c_str(),
            None::<&CStr>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&CStr>,
        )?;

        for op in &self.ops {
            mount(
                Some(op.source.as_c_str()),
                op.target.as_c_str(),
                None::<&CStr>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&CStr>,
            )?;
            mount(
                None::<&CStr>,
                op.target.as_c_str(),
                None::<&CStr>,
                op.remount,
                None::<&CStr>,
            )?;
        }

        chdir(self.root.as_c_str())?;
        pivot_root(c".", c".")?;
        umount2(c".", MntFlags::MNT_DETACH)?;
        chdir(c"/")?;
        Ok(())
    }

    /// Become `SANDBOX_ID` for good, then enter `cwd` as that user.
    ///
    /// Group ids go first; after the uid switch there is no way back.
    pub fn drop_privileges(&self, cwd: &CStr) -> io::Result<()> {
        let gid = Gid::from_raw(SANDBOX_ID);
        let uid = Uid::from_raw(SANDBOX_ID);
        // Denied inside a user namespace, and the mapping leaves none anyway.
        if !self.user_namespace {
            setgroups(&[])?;
        }
        setresgid(gid, gid, gid)?;
        setresuid(uid, uid, uid)?;
        chdir(cwd)?;
        Ok(())
    }
}

fn write_proc(path: &CStr, content: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, content.as_ptr().cast(), content.len()) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if written < 0 || written as usize != content.len() {
        return Err(err);
    }
    Ok(())
}

/// A prepared sandbox view, released on drop
#[derive(Debug)]
pub struct MountSession {
    root: Option<TempDir>,
    root_path: PathBuf,
    mounts: Vec<PlannedMount>,
    child: Arc<ChildMounts>,
}

impl MountSession {
    /// Plan `mounts` in order under a new view root inside `work_root`.
    ///
    /// Nothing is mounted yet; on error every stub created so far is removed.
    pub fn prepare<'a>(
        mounts: impl IntoIterator<Item = &'a Mount>,
        work_root: &Path,
    ) -> SetupResult<Self> {
        fs::create_dir_all(work_root).map_err(SetupError::Root)?;
        let root = tempfile::Builder::new()
            .prefix("jailrun-")
            .tempdir_in(work_root)
            .map_err(SetupError::Root)?;
        let root_path = root.path().to_path_buf();
        // The child walks it as SANDBOX_ID
        fs::set_permissions(&root_path, fs::Permissions::from_mode(0o755)).map_err(SetupError::Root)?;

        let mut planned: Vec<PlannedMount> = Vec::new();
        for mount in mounts {
            let Some(entry) = plan_one(mount, &root_path, &planned)? else {
                continue;
            };
            debug!(
                "Planned mount {} -> {} (ro: {}, exec: {})",
                entry.source.display(),
                entry.target.display(),
                entry.readonly,
                entry.exec
            );
            planned.push(entry);
        }

        let child = build_child_mounts(&root_path, &planned)?;
        info!(
            "Prepared sandbox view at {} with {} mount(s)",
            root_path.display(),
            planned.len()
        );

        Ok(Self {
            root: Some(root),
            root_path,
            mounts: planned,
            child: Arc::new(child),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn mounts(&self) -> &[PlannedMount] {
        &self.mounts
    }

    /// Shared handle for the pre-exec closure
    pub fn child_mounts(&self) -> Arc<ChildMounts> {
        Arc::clone(&self.child)
    }
}

impl FsView for MountSession {
    fn host_path(&self, view_path: &Path) -> PathBuf {
        let view_path = Path::new("/").join(view_path);
        for mount in self.mounts.iter().rev() {
            if let Ok(rest) = view_path.strip_prefix(&mount.target) {
                // join("") would add a trailing slash, which breaks file mounts
                if rest.as_os_str().is_empty() {
                    return mount.source.clone();
                }
                return mount.source.join(rest);
            }
        }
        self.root_path
            .join(view_path.strip_prefix("/").unwrap_or(&view_path))
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        for mount in self.mounts.iter().rev() {
            let target = self.root_path.join(mount.relative_target());
            // EINVAL here is the normal case: the mount lived in the child's namespace.
            let _ = umount2(&target, MntFlags::MNT_DETACH);
        }

        let Some(root) = self.root.take() else {
            return;
        };
        if has_mounts_under(&self.root_path) {
            warn!(
                "Sandbox view {} still has mounts in this namespace, leaving it on disk",
                self.root_path.display()
            );
            let _ = root.keep();
            return;
        }
        if let Err(e) = root.close() {
            warn!(
                "Failed to remove sandbox view {}: {}",
                self.root_path.display(),
                e
            );
        } else {
            debug!("Released sandbox view {}", self.root_path.display());
        }
    }
}

/// Whether any mount point in the current namespace sits under `root`
fn has_mounts_under(root: &Path) -> bool {
    let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| Path::new(mount_point).starts_with(root))
}

fn plan_one(
    mount: &Mount,
    root: &Path,
    planned: &[PlannedMount],
) -> SetupResult<Option<PlannedMount>> {
    let source = match fs::canonicalize(&mount.from) {
        Ok(path) => path,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if mount.is_optional() {
                debug!("Skipping optional mount, source missing: {}", mount.from.display());
                return Ok(None);
            }
            return Err(SetupError::MissingSource(mount.from.clone()));
        }
        Err(source) => {
            return Err(SetupError::Source {
                path: mount.from.clone(),
                source,
            })
        }
    };
    let kind = fs::metadata(&source)
        .map(|meta| EntryKind::of(&meta))
        .map_err(|e| SetupError::Source {
            path: mount.from.clone(),
            source: e,
        })?;

    let target = Path::new("/").join(mount.relative_target());
    ensure_mount_point(&target, kind, root, planned)?;

    Ok(Some(PlannedMount {
        source,
        target,
        kind,
        readonly: mount.is_readonly(),
        exec: mount.is_exec(),
    }))
}

/// Make sure a mount point of the right kind will exist at `target`
fn ensure_mount_point(
    target: &Path,
    kind: EntryKind,
    root: &Path,
    planned: &[PlannedMount],
) -> SetupResult<()> {
    let covering = planned
        .iter()
        .rev()
        .find(|earlier| target.starts_with(&earlier.target));

    if let Some(earlier) = covering {
        if earlier.target == target {
            if earlier.kind != kind {
                return Err(SetupError::TargetKindMismatch {
                    target: target.to_path_buf(),
                });
            }
            return Ok(());
        }

        let rest = target.strip_prefix(&earlier.target).unwrap_or(target);
        let backing = earlier.source.join(rest);
        return match fs::metadata(&backing) {
            Ok(meta) if EntryKind::of(&meta) == kind => Ok(()),
            Ok(_) => Err(SetupError::TargetKindMismatch {
                target: target.to_path_buf(),
            }),
            Err(_) => Err(SetupError::TargetInsideMount {
                target: target.to_path_buf(),
                covering: earlier.target.clone(),
            }),
        };
    }

    let stub = root.join(target.strip_prefix("/").unwrap_or(target));
    let mount_point_err = |source| SetupError::MountPoint {
        path: target.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(&stub) {
        Ok(meta) if EntryKind::of(&meta) == kind && !meta.file_type().is_symlink() => return Ok(()),
        Ok(_) => {
            return Err(SetupError::TargetKindMismatch {
                target: target.to_path_buf(),
            })
        }
        Err(_) => {}
    }

    match kind {
        EntryKind::Dir => fs::create_dir_all(&stub).map_err(mount_point_err)?,
        EntryKind::File => {
            if let Some(parent) = stub.parent() {
                fs::create_dir_all(parent).map_err(mount_point_err)?;
            }
            fs::File::create(&stub).map_err(mount_point_err)?;
        }
    }
    Ok(())
}

fn build_child_mounts(root: &Path, planned: &[PlannedMount]) -> SetupResult<ChildMounts> {
    let ops = planned
        .iter()
        .map(|mount| {
            Ok(MountOp {
                source: to_cstring(&mount.source)?,
                target: to_cstring(&root.join(mount.relative_target()))?,
                remount: mount.remount_flags(),
            })
        })
        .collect::<SetupResult<Vec<_>>>()?;

    let uid = Uid::effective();
    let gid = Gid::effective();

    Ok(ChildMounts {
        ops,
        root: to_cstring(root)?,
        user_namespace: !uid.is_root(),
        uid_map: format!("{SANDBOX_ID} {uid} 1\n").into_bytes(),
        gid_map: format!("{SANDBOX_ID} {gid} 1\n").into_bytes(),
    })
}

pub(crate) fn to_cstring(path: &Path) -> SetupResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| SetupError::NulByte(path.to_path_buf()))
}
