//! Registry persisted to a single JSON record file.
//!
//! # On-disk layout
//!
//! ```text
//! <state_dir>/
//!   state.json       # { "volumes": [...], "snapshots": [...] }
//!   state.json.tmp   # only exists while a write is in flight
//! ```
//!
//! Every mutation rewrites the whole file: write to the temporary sibling,
//! `fsync`, `rename` over the record, `fsync` the directory.  A crash at any
//! point leaves either the old or the new file, never a torn one.
//!
//! Mutations run one at a time under the persist lock.  The file is written
//! from a staged copy of the committed state and memory is only updated once
//! that write succeeded, so readers and the file never see a change that
//! could still fail.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::memory::updated;
use super::{MemoryRegistry, Registry, VolumeUpdate};
use crate::error::CsiError;
use crate::types::{Snapshot, SnapshotId, Volume, VolumeId};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    volumes: Vec<Volume>,
    #[serde(default)]
    snapshots: Vec<Snapshot>,
}

/// Durable registry: a [`MemoryRegistry`] mirrored to `path`.
#[derive(Debug)]
pub struct FileRegistry {
    inner: MemoryRegistry,
    path: PathBuf,
    /// Held for the whole stage, write, publish sequence of a mutation.
    persist_lock: Mutex<()>,
}

impl FileRegistry {
    /// Load the registry stored at `path`.  A missing file is an empty
    /// registry; a corrupt one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CsiError> {
        let path = path.into();
        let inner = MemoryRegistry::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes).map_err(|e| {
                    CsiError::Internal(format!("corrupt registry {}: {e}", path.display()))
                })?;
                for vol in state.volumes {
                    inner.insert_volume(vol);
                }
                for snap in state.snapshots {
                    inner.insert_snapshot(snap);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no registry file yet, starting empty");
            }
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read registry {}: {e}",
                    path.display()
                )));
            }
        }

        let tmp = tmp_path(&path);
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => warn!(path = %tmp.display(), "removed leftover registry temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %tmp.display(), error = %e, "failed to remove registry temp file"),
        }

        info!(
            path = %path.display(),
            volumes = inner.sorted_volumes().len(),
            snapshots = inner.sorted_snapshots().len(),
            "registry loaded",
        );
        Ok(Self {
            inner,
            path,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `state` as the new record file.  Callers hold `persist_lock`.
    async fn persist(&self, state: &PersistedState) -> Result<(), CsiError> {
        let json = serde_json::to_vec_pretty(state).map_err(CsiError::internal)?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| CsiError::Internal(format!("persist registry {}: {e}", self.path.display())))
    }

    /// Committed state with `volume` inserted or replaced (`Ok`) or the
    /// volume `id` removed (`Err`).
    fn stage_volume(&self, change: Result<&Volume, &VolumeId>) -> PersistedState {
        let id = change.map_or_else(|id| id, |v| &v.volume_id);
        let mut volumes = self.inner.sorted_volumes();
        volumes.retain(|v| &v.volume_id != id);
        if let Ok(volume) = change {
            volumes.push(volume.clone());
            volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        }
        PersistedState {
            volumes,
            snapshots: self.inner.sorted_snapshots(),
        }
    }

    fn stage_snapshot(&self, change: Result<&Snapshot, &SnapshotId>) -> PersistedState {
        let id = change.map_or_else(|id| id, |s| &s.snapshot_id);
        let mut snapshots = self.inner.sorted_snapshots();
        snapshots.retain(|s| &s.snapshot_id != id);
        if let Ok(snapshot) = change {
            snapshots.push(snapshot.clone());
            snapshots.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        }
        PersistedState {
            volumes: self.inner.sorted_volumes(),
            snapshots,
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    if let Some(parent) = parent {
        tokio::fs::File::open(parent).await?.sync_all().await?;
    }
    Ok(())
}

#[async_trait]
impl Registry for FileRegistry {
    async fn get_volume(&self, id: &VolumeId) -> Option<Volume> {
        self.inner.get_volume(id).await
    }

    async fn get_volume_by_name(&self, name: &str) -> Option<Volume> {
        self.inner.get_volume_by_name(name).await
    }

    async fn put_volume(&self, volume: Volume) -> Result<(), CsiError> {
        let _guard = self.persist_lock.lock().await;
        self.persist(&self.stage_volume(Ok(&volume))).await?;
        self.inner.insert_volume(volume);
        Ok(())
    }

    async fn update_volume(
        &self,
        id: &VolumeId,
        apply: VolumeUpdate,
    ) -> Result<Option<Volume>, CsiError> {
        let _guard = self.persist_lock.lock().await;
        let Some(current) = self.inner.get_volume(id).await else {
            return Ok(None);
        };
        let next = updated(&current, apply);
        self.persist(&self.stage_volume(Ok(&next))).await?;
        self.inner.insert_volume(next.clone());
        Ok(Some(next))
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<(), CsiError> {
        let _guard = self.persist_lock.lock().await;
        if self.inner.get_volume(id).await.is_none() {
            return Ok(());
        }
        self.persist(&self.stage_volume(Err(id))).await?;
        self.inner.remove_volume(id);
        Ok(())
    }

    async fn list_volumes(&self) -> Vec<Volume> {
        self.inner.list_volumes().await
    }

    async fn get_snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.inner.get_snapshot(id).await
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Option<Snapshot> {
        self.inner.get_snapshot_by_name(name).await
    }

    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        let _guard = self.persist_lock.lock().await;
        self.persist(&self.stage_snapshot(Ok(&snapshot))).await?;
        self.inner.insert_snapshot(snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), CsiError> {
        let _guard = self.persist_lock.lock().await;
        if self.inner.get_snapshot(id).await.is_none() {
            return Ok(());
        }
        self.persist(&self.stage_snapshot(Err(id))).await?;
        self.inner.remove_snapshot(id);
        Ok(())
    }

    async fn list_snapshots(&self) -> Vec<Snapshot> {
        self.inner.list_snapshots().await
    }
}
