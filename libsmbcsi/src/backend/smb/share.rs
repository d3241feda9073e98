//! Controller-side mounts of the shares that back volumes.
//!
//! The controller needs a share mounted to create, clone, snapshot or
//! delete the per-volume directories inside it.  Each remote share is
//! mounted once under `<state_dir>/shares/<share-key>` and reference counted;
//! the last [`ShareLease`] to be released unmounts it again, unless the
//! share was already mounted before the controller touched it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::mounter::{Mounter, join_error, run_blocking, run_mount};
use crate::types::ShareSource;

#[derive(Debug, Default)]
struct ShareSlot {
    users: usize,
    /// We mounted it and therefore own the unmount.
    mounted: bool,
}

struct Inner {
    share_dir: PathBuf,
    mounter: Arc<dyn Mounter>,
    mount_timeout: Option<Duration>,
    slots: DashMap<String, Arc<Mutex<ShareSlot>>>,
}

#[derive(Clone)]
pub struct ShareTable {
    inner: Arc<Inner>,
}

/// A share kept reachable at [`ShareLease::root`].
pub struct ShareLease {
    table: ShareTable,
    /// `None` for local shares, which need no mount.
    key: Option<String>,
    root: PathBuf,
}

impl ShareTable {
    pub fn new(
        share_dir: impl Into<PathBuf>,
        mounter: Arc<dyn Mounter>,
        mount_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                share_dir: share_dir.into(),
                mounter,
                mount_timeout,
                slots: DashMap::new(),
            }),
        }
    }

    /// Where `source` is reachable on the controller host.
    pub fn root_of(&self, source: &ShareSource) -> PathBuf {
        match source {
            ShareSource::Local(path) => path.clone(),
            ShareSource::Remote(_) => self.inner.share_dir.join(source.key()),
        }
    }

    /// Make `source` reachable, mounting it with `secrets` if this is its
    /// first user.
    pub async fn acquire(
        &self,
        source: &ShareSource,
        secrets: &HashMap<String, String>,
    ) -> Result<ShareLease, CsiError> {
        let root = self.root_of(source);
        let ShareSource::Remote(remote) = source else {
            return Ok(ShareLease {
                table: self.clone(),
                key: None,
                root,
            });
        };

        let key = source.key();
        let slot = Arc::clone(self.inner.slots.entry(key.clone()).or_default().value());
        let mut slot = slot.lock().await;
        if slot.users == 0 {
            let mounted = self.mount_share(remote, &root, secrets).await?;
            if mounted {
                info!(share = %source, root = %root.display(), "share mounted");
            } else {
                debug!(share = %source, root = %root.display(), "share already mounted");
            }
            slot.mounted = mounted;
        }
        slot.users += 1;

        Ok(ShareLease {
            table: self.clone(),
            key: Some(key),
            root,
        })
    }

    /// Mount `remote` at `root` unless something is already mounted there.
    /// Returns whether this call mounted it.
    ///
    /// A mount that completes after the caller stopped waiting, through
    /// `mount_timeout` or a dropped future, is unmounted again by the
    /// blocking task, since no slot records it.
    async fn mount_share(
        &self,
        remote: &str,
        root: &Path,
        secrets: &HashMap<String, String>,
    ) -> Result<bool, CsiError> {
        let waiter = Waiter::new();
        let state = Arc::clone(&waiter.0);
        let mounter = Arc::clone(&self.inner.mounter);
        let (remote, target, secrets) = (remote.to_owned(), root.to_path_buf(), secrets.clone());
        let mut task = tokio::task::spawn_blocking(move || -> Result<bool, CsiError> {
            if mounter.is_mount_point(&target) {
                return Ok(false);
            }
            mounter.auth_mount(&remote, &target, &secrets, &[])?;
            if state
                .compare_exchange(PENDING, DONE, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                match mounter.unmount(&target) {
                    Ok(()) => {
                        info!(share = %remote, root = %target.display(), "late share mount undone");
                    }
                    Err(e) => warn!(
                        share = %remote,
                        root = %target.display(),
                        error = %e,
                        "failed to undo late share mount",
                    ),
                }
            }
            Ok(true)
        });

        let joined = match self.inner.mount_timeout {
            None => (&mut task).await,
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) if waiter.abandon() => {
                    return Err(CsiError::DeadlineExceeded(format!(
                        "mount share did not finish within {limit:?}"
                    )));
                }
                // Finished right at the deadline.
                Err(_) => task.await,
            },
        };
        joined.unwrap_or_else(|e| Err(join_error("mount share", e)))
    }

    /// Lease `source` only if it is already reachable, never mounting it.
    ///
    /// Local shares always are.  A remote share qualifies while another
    /// lease holds it or when something else already mounted it.
    pub async fn lease_if_mounted(
        &self,
        source: &ShareSource,
    ) -> Result<Option<ShareLease>, CsiError> {
        let root = self.root_of(source);
        if matches!(source, ShareSource::Local(_)) {
            return Ok(Some(ShareLease {
                table: self.clone(),
                key: None,
                root,
            }));
        }

        let key = source.key();
        let slot = Arc::clone(self.inner.slots.entry(key.clone()).or_default().value());
        let mut slot = slot.lock().await;
        if slot.users == 0 {
            let mounter = Arc::clone(&self.inner.mounter);
            let target = root.clone();
            let mounted =
                run_blocking("check share mount", move || Ok(mounter.is_mount_point(&target)))
                    .await?;
            if !mounted {
                return Ok(None);
            }
        }
        slot.users += 1;

        Ok(Some(ShareLease {
            table: self.clone(),
            key: Some(key),
            root,
        }))
    }

    async fn release_key(&self, key: &str) {
        let Some(slot) = self.inner.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut slot = slot.lock().await;
        slot.users = slot.users.saturating_sub(1);
        if slot.users > 0 || !slot.mounted {
            return;
        }

        let mounter = Arc::clone(&self.inner.mounter);
        let target = self.inner.share_dir.join(key);
        let result = run_mount("unmount share", self.inner.mount_timeout, {
            let target = target.clone();
            move || mounter.unmount(&target)
        })
        .await;
        match result {
            Ok(()) => {
                slot.mounted = false;
                info!(root = %target.display(), "share unmounted");
            }
            Err(e) => warn!(root = %target.display(), error = %e, "failed to unmount share"),
        }
    }
}

const PENDING: u8 = 0;
const DONE: u8 = 1;
const ABANDONED: u8 = 2;

/// The caller's side of an in-flight share mount.  Dropping it while the
/// mount is pending hands the mount over to the blocking task.
struct Waiter(Arc<AtomicU8>);

impl Waiter {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PENDING)))
    }

    /// Stop waiting.  `false` when the mount already completed.
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl ShareLease {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn release(mut self) {
        if let Some(key) = self.key.take() {
            self.table.release_key(&key).await;
        }
    }
}

impl Drop for ShareLease {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let table = self.table.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { table.release_key(&key).await });
            }
            Err(_) => warn!(share = %key, "share lease dropped outside a runtime"),
        }
    }
}
