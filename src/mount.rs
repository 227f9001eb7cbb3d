//! tmpfs mount management for secret volumes
//!
//! A published volume is a fresh directory with a private tmpfs on top.
//! Mounting refuses a target that already exists, which is what makes a
//! second publish to the same path fail instead of clobbering the first.
//! Teardown is two-phase: the unmount is advisory (the path may never have
//! been mounted), the recursive removal is authoritative.

use std::fmt;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Mode of a freshly created target directory
pub const TARGET_DIR_MODE: u32 = 0o750;

/// Filesystem type and source for every secret volume
pub const TMPFS: &str = "tmpfs";

/// Flags applied to a secret tmpfs mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MountOption {
    /// Files on the mount cannot be executed
    NoExec,
    /// setuid/setgid bits are ignored
    NoSuid,
    /// Device files are not interpreted
    NoDev,
}

impl fmt::Display for MountOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountOption::NoExec => "noexec",
            MountOption::NoSuid => "nosuid",
            MountOption::NoDev => "nodev",
        };
        f.write_str(s)
    }
}

/// The only option set secret volumes are ever mounted with
pub const HARDENING_OPTIONS: [MountOption; 3] =
    [MountOption::NoExec, MountOption::NoSuid, MountOption::NoDev];

/// Kernel mount operations
#[cfg_attr(test, automock)]
pub trait Mounter: Send + Sync {
    /// Mount a tmpfs at `target` with the given options
    fn mount_tmpfs(&self, target: &Path, options: &[MountOption]) -> Result<()>;

    /// Unmount whatever is mounted at `target`
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Mounter backed by mount(2)/umount2(2)
#[derive(Clone, Copy, Debug, Default)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount_tmpfs(&self, target: &Path, options: &[MountOption]) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        let flags = options.iter().fold(MsFlags::empty(), |acc, opt| {
            acc | match opt {
                MountOption::NoExec => MsFlags::MS_NOEXEC,
                MountOption::NoSuid => MsFlags::MS_NOSUID,
                MountOption::NoDev => MsFlags::MS_NODEV,
            }
        });

        mount(Some(TMPFS), target, Some(TMPFS), flags, None::<&str>)
            .map_err(|e| Error::io("mount", e.into()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        use nix::mount::{umount2, MntFlags};

        umount2(target, MntFlags::empty()).map_err(|e| Error::io("unmount", e.into()))
    }
}

/// Creates and tears down secret volume mounts
#[derive(Clone)]
pub struct MountManager {
    mounter: Arc<dyn Mounter>,
}

impl MountManager {
    /// Create a manager issuing mounts through `mounter`
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self { mounter }
    }

    /// Create `target` and mount a hardened tmpfs on it
    ///
    /// Fails without touching anything if `target` already exists or its
    /// existence cannot be determined.
    pub fn mount(&self, target: &Path) -> Result<()> {
        match target.try_exists() {
            Err(e) => {
                warn!(target = %target.display(), error = %e, "failed to check if target path exists");
                return Err(Error::io("stat target", e));
            }
            Ok(true) => {
                warn!(target = %target.display(), "target path already exists");
                return Err(Error::internal_with_context(
                    "mount",
                    "target path already exists",
                ));
            }
            Ok(false) => {}
        }

        DirBuilder::new()
            .recursive(true)
            .mode(TARGET_DIR_MODE)
            .create(target)
            .map_err(|e| Error::io("create target", e))?;

        self.mounter.mount_tmpfs(target, &HARDENING_OPTIONS)?;
        info!(
            target = %target.display(),
            fs_type = TMPFS,
            options = ?HARDENING_OPTIONS.map(|o| o.to_string()),
            "volume mounted"
        );
        Ok(())
    }

    /// Unmount `target`, logging and swallowing any failure
    pub fn unmount(&self, target: &Path) {
        match self.mounter.unmount(target) {
            Ok(()) => debug!(target = %target.display(), "volume unmounted"),
            Err(e) => {
                info!(target = %target.display(), error = %e, "unmount failed, continuing with removal")
            }
        }
    }

    /// Recursively remove `target`; a missing path is success
    pub fn remove(&self, target: &Path) -> Result<()> {
        match std::fs::remove_dir_all(target) {
            Ok(()) => {
                debug!(target = %target.display(), "target path removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("remove target", e)),
        }
    }

    /// Advisory unmount followed by authoritative removal
    pub fn teardown(&self, target: &Path) -> Result<()> {
        self.unmount(target);
        self.remove(target)
    }
}
