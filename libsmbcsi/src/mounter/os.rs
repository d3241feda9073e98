//! [`Mounter`] backed by real mount syscalls.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use super::{FsInfo, Mounter, redact_options};
use crate::error::CsiError;

/// Filesystem type used for network share mounts.
const SHARE_FS_TYPE: &str = "cifs";

/// Mode of directories created implicitly as mount targets.
const MOUNT_DIR_MODE: u32 = 0o750;

/// Issues CIFS and bind mounts through `nix::mount`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMounter;

impl OsMounter {
    pub fn new() -> Self {
        Self
    }
}

/// Return `true` if `path` is listed as a mount point in `/proc/self/mounts`.
fn is_mountpoint(path: &Path) -> bool {
    match fs::read_to_string("/proc/self/mounts") {
        Ok(contents) => mount_table_lists(&contents, path),
        Err(_) => false,
    }
}

// Compared as `Path`s: trailing slashes are ignored and `/` still matches.
fn mount_table_lists(contents: &str, path: &Path) -> bool {
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mp| Path::new(&unescape_mount_path(mp)) == path)
    })
}

/// Decode the octal escapes (`\040` for space, ...) used in the mount table.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let v = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(v) = u8::try_from(v) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn create_dir_all(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

impl Mounter for OsMounter {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir(&self, path: &Path, mode: u32) -> Result<(), CsiError> {
        create_dir_all(path, mode)
            .map_err(|e| CsiError::Internal(format!("create dir {}: {e}", path.display())))
    }

    fn delete_dir(&self, path: &Path) -> Result<(), CsiError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::Internal(format!(
                "remove dir {}: {e}",
                path.display()
            ))),
        }
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        is_mountpoint(path)
    }

    fn mount(&self, source: &str, target: &Path, options: &[String]) -> Result<(), CsiError> {
        create_dir_all(target, MOUNT_DIR_MODE).map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("create mount directory: {e}"),
        })?;

        let data = options.join(",");
        debug!(%source, target = %target.display(), options = %redact_options(options), "mounting share");
        nix::mount::mount(
            Some(source),
            target,
            Some(SHARE_FS_TYPE),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })?;

        info!(%source, target = %target.display(), "share mounted");
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError> {
        if !source.exists() {
            return Err(CsiError::InvalidArgument(format!(
                "bind source {} does not exist",
                source.display()
            )));
        }

        create_dir_all(target, MOUNT_DIR_MODE).map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("create mount directory: {e}"),
        })?;

        let bind = nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .and_then(|()| {
            // The initial bind ignores MS_RDONLY; a remount enforces it.
            if read_only {
                nix::mount::mount(
                    None::<&str>,
                    target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
            } else {
                Ok(())
            }
        });

        if let Err(e) = bind {
            if is_mountpoint(target)
                && let Err(umount_err) = nix::mount::umount(target)
            {
                warn!(target = %target.display(), error = %umount_err, "failed to undo partial bind mount");
            }
            if let Err(cleanup) = fs::remove_dir(target) {
                warn!(target = %target.display(), error = %cleanup, "failed to remove bind target after mount failure");
            }
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            });
        }

        info!(source = %source.display(), target = %target.display(), read_only, "bind mount created");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        if !target.exists() {
            debug!(target = %target.display(), "unmount target absent");
            return Ok(());
        }
        if !is_mountpoint(target) {
            debug!(target = %target.display(), "unmount target is not a mount point");
            return Ok(());
        }
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })?;
        info!(target = %target.display(), "unmounted");
        Ok(())
    }

    fn filesystem_info(&self, path: &Path) -> Result<FsInfo, CsiError> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| CsiError::Internal(format!("statvfs {}: {e}", path.display())))?;
        Ok(FsInfo {
            block_size: stat.fragment_size() as u64,
            total_blocks: stat.blocks() as u64,
            free_blocks: stat.blocks_free() as u64,
            available_blocks: stat.blocks_available() as u64,
            total_inodes: stat.files() as u64,
            free_inodes: stat.files_free() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_octal_sequences() {
        assert_eq!(unescape_mount_path("/mnt/with\\040space"), "/mnt/with space");
        assert_eq!(unescape_mount_path("/plain/path"), "/plain/path");
        assert_eq!(unescape_mount_path("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn mount_table_matching() {
        let table = "/dev/sda1 / ext4 rw 0 0\n\
                     //fs01/data /mnt/with\\040space cifs rw 0 0\n";
        assert!(mount_table_lists(table, Path::new("/")));
        assert!(mount_table_lists(table, Path::new("/mnt/with space/")));
        assert!(!mount_table_lists(table, Path::new("/mnt")));
        assert!(!mount_table_lists("", Path::new("/")));
    }

    #[test]
    fn root_is_a_mount_point() {
        assert!(OsMounter::new().is_mount_point(Path::new("/")));
    }

    #[test]
    fn create_and_delete_dir_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let m = OsMounter::new();
        let dir = tmp.path().join("a/b/c");
        m.create_dir(&dir, 0o755).unwrap();
        m.create_dir(&dir, 0o755).unwrap();
        assert!(m.path_exists(&dir));
        m.delete_dir(&tmp.path().join("a")).unwrap();
        m.delete_dir(&tmp.path().join("a")).unwrap();
        assert!(!m.path_exists(&dir));
    }

    #[test]
    fn unmount_missing_or_plain_dir_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let m = OsMounter::new();
        m.unmount(&tmp.path().join("missing")).unwrap();
        m.unmount(tmp.path()).unwrap();
    }

    #[test]
    fn bind_mount_requires_source() {
        let tmp = tempfile::tempdir().unwrap();
        let err = OsMounter::new()
            .bind_mount(&tmp.path().join("nope"), &tmp.path().join("target"), false)
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(!tmp.path().join("target").exists());
    }

    #[test]
    fn filesystem_info_of_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let info = OsMounter::new().filesystem_info(tmp.path()).unwrap();
        assert!(info.block_size > 0);
        assert!(info.capacity_bytes() > 0);
    }
}
