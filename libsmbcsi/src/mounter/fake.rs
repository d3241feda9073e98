//! In-memory [`Mounter`] for tests.
//!
//! Directory operations hit the real filesystem (tests run against temp
//! dirs) but mounts only update an in-memory table, so no privileges are
//! needed.  Bind mounts are not followed: the target stays an ordinary
//! directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use super::{FsInfo, Mounter};
use crate::error::CsiError;

/// One entry of the fake mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub target: PathBuf,
    pub options: Vec<String>,
    pub bind: bool,
    pub read_only: bool,
}

/// Test double that records mounts instead of performing them.
#[derive(Debug)]
pub struct FakeMounter {
    mounts: DashMap<PathBuf, MountRecord>,
    fs_info: Mutex<FsInfo>,
    fail_mounts: AtomicBool,
    mount_delay: Mutex<Duration>,
    mount_calls: Mutex<Vec<MountRecord>>,
}

impl Default for FakeMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMounter {
    /// A fake reporting a roomy 1 GiB filesystem.
    pub fn new() -> Self {
        Self {
            mounts: DashMap::new(),
            fs_info: Mutex::new(FsInfo {
                block_size: 4096,
                total_blocks: 262_144,
                free_blocks: 262_144,
                available_blocks: 262_144,
                total_inodes: 65_536,
                free_inodes: 65_000,
            }),
            fail_mounts: AtomicBool::new(false),
            mount_delay: Mutex::new(Duration::ZERO),
            mount_calls: Mutex::new(Vec::new()),
        }
    }

    /// Statistics returned by [`Mounter::filesystem_info`] from now on.
    pub fn set_fs_info(&self, info: FsInfo) {
        if let Ok(mut guard) = self.fs_info.lock() {
            *guard = info;
        }
    }

    /// Make every subsequent `mount`/`bind_mount` fail.
    pub fn fail_mounts(&self, fail: bool) {
        self.fail_mounts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent share `mount` block for `delay` first.
    pub fn set_mount_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.mount_delay.lock() {
            *guard = delay;
        }
    }

    /// Currently active mount for `target`.
    pub fn mount_at(&self, target: &Path) -> Option<MountRecord> {
        self.mounts.get(target).map(|r| r.clone())
    }

    pub fn active_mounts(&self) -> usize {
        self.mounts.len()
    }

    /// Every successful mount issued so far, in order.
    pub fn mount_calls(&self) -> Vec<MountRecord> {
        self.mount_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, record: MountRecord) {
        if let Ok(mut calls) = self.mount_calls.lock() {
            calls.push(record.clone());
        }
        self.mounts.insert(record.target.clone(), record);
    }
}

impl Mounter for FakeMounter {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir(&self, path: &Path, _mode: u32) -> Result<(), CsiError> {
        fs::create_dir_all(path)
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
        self.mounts.contains_key(path)
    }

    fn mount(&self, source: &str, target: &Path, options: &[String]) -> Result<(), CsiError> {
        let delay = self.mount_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.create_dir(target, 0o750)?;
        if self.fail_mounts.load(Ordering::SeqCst) {
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: "injected mount failure".into(),
            });
        }
        self.record(MountRecord {
            source: source.to_owned(),
            target: target.to_path_buf(),
            options: options.to_vec(),
            bind: false,
            read_only: false,
        });
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError> {
        if !source.exists() {
            return Err(CsiError::InvalidArgument(format!(
                "bind source {} does not exist",
                source.display()
            )));
        }
        self.create_dir(target, 0o750)?;
        if self.fail_mounts.load(Ordering::SeqCst) {
            let _ = fs::remove_dir(target);
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: "injected mount failure".into(),
            });
        }
        self.record(MountRecord {
            source: source.display().to_string(),
            target: target.to_path_buf(),
            options: Vec::new(),
            bind: true,
            read_only,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        self.mounts.remove(target);
        Ok(())
    }

    fn filesystem_info(&self, path: &Path) -> Result<FsInfo, CsiError> {
        if !path.exists() {
            return Err(CsiError::Internal(format!(
                "statvfs {}: no such file or directory",
                path.display()
            )));
        }
        self.fs_info
            .lock()
            .map(|info| *info)
            .map_err(|_| CsiError::Internal("fake fs info lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn auth_mount_records_options() {
        let tmp = tempfile::tempdir().unwrap();
        let m = FakeMounter::new();
        let target = tmp.path().join("share");
        let secrets = HashMap::from([("username".to_owned(), "bob".to_owned())]);
        m.auth_mount("//fs01/data", &target, &secrets, &["noperm".to_owned()])
            .unwrap();

        assert!(m.is_mount_point(&target));
        assert!(target.is_dir());
        let rec = m.mount_at(&target).unwrap();
        assert_eq!(rec.options, ["username=bob", "vers=3.0", "noperm"]);

        m.unmount(&target).unwrap();
        assert!(!m.is_mount_point(&target));
    }

    #[test]
    fn injected_failure_leaves_target_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let m = FakeMounter::new();
        m.fail_mounts(true);
        let target = tmp.path().join("share");
        let err = m.mount("//fs01/data", &target, &[]).unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }));
        assert!(target.exists());
        assert_eq!(m.active_mounts(), 0);
    }
}
