//! Mount manager: remote share mounts, local bind mounts and the directory
//! plumbing around them.
//!
//! [`Mounter`] is synchronous; every call may block on I/O (a CIFS mount
//! against an unreachable server can hang for a long time).  Async callers
//! go through [`run_blocking`] / [`run_mount`], which move the call onto the
//! blocking pool and optionally bound it with a deadline.
//!
//! Two implementations exist: [`OsMounter`] issues real syscalls through
//! `nix`, [`FakeMounter`] keeps an in-memory mount table for tests.

mod fake;
mod os;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::CsiError;
use crate::types::{SECRET_PASSWORD, SECRET_USERNAME};

pub use fake::{FakeMounter, MountRecord};
pub use os::OsMounter;

/// SMB protocol dialect requested for every authenticated mount.
pub const SMB_PROTOCOL_VERSION: &str = "3.0";

/// Filesystem statistics of the filesystem containing a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// Blocks available to unprivileged users.
    pub available_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

impl FsInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.total_blocks)
    }

    pub fn available_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.available_blocks)
    }
}

/// Filesystem mount operations used by the controller and node services.
pub trait Mounter: Send + Sync {
    fn path_exists(&self, path: &Path) -> bool;

    /// Create `path` and its parents; succeeds if it is already present.
    fn create_dir(&self, path: &Path, mode: u32) -> Result<(), CsiError>;

    /// Remove `path` recursively; succeeds if it is already absent.
    fn delete_dir(&self, path: &Path) -> Result<(), CsiError>;

    /// Whether `path` is currently a mount point.
    fn is_mount_point(&self, path: &Path) -> bool;

    /// Mount `source` at `target` with `options` joined by commas.  The
    /// target directory is created first and left in place on failure.
    fn mount(&self, source: &str, target: &Path, options: &[String]) -> Result<(), CsiError>;

    /// Same-host rebind of `source` onto `target`.  `source` must exist.  On
    /// failure the target directory is removed again.
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError>;

    /// Unmount `target`.  A missing target, or one that is not mounted, is
    /// already satisfied.
    fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    fn filesystem_info(&self, path: &Path) -> Result<FsInfo, CsiError>;

    /// Mount a share with the credentials found in `secrets` plus
    /// `extra_flags`.
    fn auth_mount(
        &self,
        source: &str,
        target: &Path,
        secrets: &HashMap<String, String>,
        extra_flags: &[String],
    ) -> Result<(), CsiError> {
        let options = auth_mount_options(secrets, extra_flags);
        self.mount(source, target, &options)
    }
}

/// Build the option list for an authenticated share mount.  Missing
/// credentials are omitted rather than rejected.
pub fn auth_mount_options(secrets: &HashMap<String, String>, extra_flags: &[String]) -> Vec<String> {
    let mut options = Vec::with_capacity(3 + extra_flags.len());
    match secrets.get(SECRET_USERNAME) {
        Some(user) => options.push(format!("username={user}")),
        None => debug!("no username in secrets"),
    }
    match secrets.get(SECRET_PASSWORD) {
        Some(pass) => options.push(format!("password={pass}")),
        None => debug!("no password in secrets"),
    }
    options.push(format!("vers={SMB_PROTOCOL_VERSION}"));
    options.extend(extra_flags.iter().cloned());
    options
}

/// Render mount options for logs with credentials masked.
pub fn redact_options(options: &[String]) -> String {
    options
        .iter()
        .map(|opt| {
            if opt.starts_with("password=") {
                "password=****"
            } else {
                opt.as_str()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Run blocking filesystem work on the blocking pool.
pub async fn run_blocking<T, F>(op: &'static str, f: F) -> Result<T, CsiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CsiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(join_error(op, e)))
}

pub(crate) fn join_error(op: &str, e: tokio::task::JoinError) -> CsiError {
    if e.is_cancelled() {
        CsiError::Cancelled(format!("{op} was cancelled"))
    } else {
        CsiError::Internal(format!("{op} panicked: {e}"))
    }
}

/// Like [`run_blocking`], bounded by `timeout` when one is configured.
///
/// On expiry the syscall keeps running on the blocking pool; the caller
/// gets [`CsiError::DeadlineExceeded`] and must not commit any state.
pub async fn run_mount<T, F>(
    op: &'static str,
    timeout: Option<Duration>,
    f: F,
) -> Result<T, CsiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CsiError> + Send + 'static,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, run_blocking(op, f))
            .await
            .map_err(|_| CsiError::DeadlineExceeded(format!("{op} did not finish within {limit:?}")))?,
        None => run_blocking(op, f).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_options_with_credentials() {
        let secrets = HashMap::from([
            ("username".to_owned(), "alice".to_owned()),
            ("password".to_owned(), "s3cret".to_owned()),
        ]);
        let opts = auth_mount_options(&secrets, &["noperm".to_owned()]);
        assert_eq!(opts, ["username=alice", "password=s3cret", "vers=3.0", "noperm"]);
        assert_eq!(
            redact_options(&opts),
            "username=alice,password=****,vers=3.0,noperm"
        );
    }

    #[test]
    fn auth_options_without_credentials() {
        let opts = auth_mount_options(&HashMap::new(), &[]);
        assert_eq!(opts, ["vers=3.0"]);
    }

    #[tokio::test]
    async fn run_mount_times_out() {
        let result = run_mount("slow mount", Some(Duration::from_millis(20)), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CsiError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn run_blocking_passes_errors_through() {
        let result: Result<(), _> =
            run_blocking("failing op", || Err(CsiError::Internal("boom".into()))).await;
        assert!(matches!(result, Err(CsiError::Internal(msg)) if msg == "boom"));
    }
}
