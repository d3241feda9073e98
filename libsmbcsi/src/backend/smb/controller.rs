//! SMB controller: volume and snapshot lifecycle.
//!
//! # On-disk layout
//!
//! ```text
//! <share root>/<volume-id>/              # one directory per volume
//! <state_dir>/snapshots/<snap-id>.tar.gz  # snapshot archives
//! <state_dir>/tmp/clone-<uuid>.tar.gz     # transient, while cloning
//! ```
//!
//! The share root is either a local directory or the controller's mount of
//! a remote share (see [`ShareTable`]).  Every registry commit happens after
//! the mount or archive work it records has finished.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::inflight::OperationLocks;
use super::pagination::paginate;
use super::share::{ShareLease, ShareTable};
use crate::archiver;
use crate::config::DriverConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::health;
use crate::mounter::{Mounter, run_blocking};
use crate::registry::Registry;
use crate::types::*;

const VOLUME_DIR_MODE: u32 = 0o755;

/// Pre-populated content for a new volume, resolved from the registry.
enum Seed {
    Snapshot(Snapshot),
    Volume(Volume),
}

pub struct SmbController {
    registry: Arc<dyn Registry>,
    mounter: Arc<dyn Mounter>,
    shares: ShareTable,
    locks: OperationLocks,
    snapshot_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl SmbController {
    pub fn new(
        config: &DriverConfig,
        registry: Arc<dyn Registry>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            shares: ShareTable::new(
                config.share_dir(),
                Arc::clone(&mounter),
                config.mount_timeout(),
            ),
            registry,
            mounter,
            locks: OperationLocks::new(),
            snapshot_dir: config.snapshot_dir(),
            scratch_dir: config.scratch_dir(),
        }
    }

    async fn resolve_seed(&self, source: Option<&ContentSource>) -> Result<Option<Seed>, CsiError> {
        match source {
            None => Ok(None),
            Some(ContentSource::Snapshot(id)) => {
                let snapshot = self.registry.get_snapshot(id).await.ok_or_else(|| {
                    CsiError::InvalidArgument(format!("snapshot {id} does not exist"))
                })?;
                Ok(Some(Seed::Snapshot(snapshot)))
            }
            Some(ContentSource::Volume(id)) => {
                let volume = self.registry.get_volume(id).await.ok_or_else(|| {
                    CsiError::InvalidArgument(format!("volume {id} does not exist"))
                })?;
                if volume.path.as_os_str().is_empty() {
                    return Err(CsiError::InvalidArgument(format!(
                        "volume {id} has no backing directory to clone"
                    )));
                }
                Ok(Some(Seed::Volume(volume)))
            }
        }
    }

    async fn acquire_share(
        &self,
        source: Option<&ShareSource>,
        secrets: &HashMap<String, String>,
    ) -> Result<Option<ShareLease>, CsiError> {
        match source {
            Some(source) => Ok(Some(self.shares.acquire(source, secrets).await?)),
            None => Ok(None),
        }
    }

    /// Create the volume directory at `target` and fill it from `seed`.
    async fn populate(
        &self,
        target: &Path,
        seed: Option<Seed>,
        secrets: &HashMap<String, String>,
    ) -> Result<(), CsiError> {
        let mounter = Arc::clone(&self.mounter);
        let dir = target.to_path_buf();
        run_blocking("create volume dir", move || {
            mounter.create_dir(&dir, VOLUME_DIR_MODE)
        })
        .await?;

        match seed {
            None => Ok(()),
            Some(Seed::Snapshot(snapshot)) => {
                let (archive, dir) = (snapshot.path.clone(), target.to_path_buf());
                let summary = run_blocking("restore snapshot", move || {
                    archiver::extract_snapshot(&archive, &dir).map_err(|e| {
                        CsiError::Internal(format!("restore {}: {e}", archive.display()))
                    })
                })
                .await?;
                info!(
                    snapshot_id = %snapshot.snapshot_id,
                    files = summary.files,
                    "volume restored from snapshot",
                );
                Ok(())
            }
            Some(Seed::Volume(source)) => self.clone_volume(&source, target, secrets).await,
        }
    }

    /// Copy `source`'s tree into `target` through a scratch archive.
    async fn clone_volume(
        &self,
        source: &Volume,
        target: &Path,
        secrets: &HashMap<String, String>,
    ) -> Result<(), CsiError> {
        let lease = self.acquire_share(source.source.as_ref(), secrets).await?;

        let scratch = self
            .scratch_dir
            .join(format!("clone-{}.tar.gz", uuid::Uuid::new_v4()));
        let (from, to) = (source.path.clone(), target.to_path_buf());
        let result = run_blocking("clone volume", move || {
            let copied = archiver::create_snapshot(&from, &scratch)
                .and_then(|_| archiver::extract_snapshot(&scratch, &to));
            if let Err(e) = archiver::delete_snapshot(&scratch) {
                warn!(archive = %scratch.display(), error = %e, "failed to remove clone scratch archive");
            }
            copied.map_err(|e| CsiError::Internal(format!("clone {}: {e}", from.display())))
        })
        .await;

        if let Some(lease) = lease {
            lease.release().await;
        }
        let summary = result?;
        info!(
            source_volume_id = %source.volume_id,
            files = summary.files,
            "volume cloned",
        );
        Ok(())
    }

    async fn remove_dir_best_effort(&self, path: &Path) {
        let mounter = Arc::clone(&self.mounter);
        let dir = path.to_path_buf();
        if let Err(e) = run_blocking("remove volume dir", move || mounter.delete_dir(&dir)).await {
            warn!(path = %path.display(), error = %e, "failed to clean up volume directory");
        }
    }

    async fn probe(&self, volume: &Volume) -> VolumeCondition {
        let mounter = Arc::clone(&self.mounter);
        let (path, claimed) = (volume.path.clone(), volume.capacity_bytes);
        run_blocking("probe volume", move || {
            Ok(health::probe(mounter.as_ref(), &path, claimed))
        })
        .await
        .unwrap_or_else(|e| VolumeCondition {
            abnormal: true,
            message: e.to_string(),
        })
    }
}

fn unsupported_mode(capabilities: &[VolumeCapability]) -> Option<AccessMode> {
    capabilities
        .iter()
        .map(|c| c.access_mode)
        .find(|mode| !mode.is_supported())
}

#[async_trait]
impl CsiController for SmbController {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        if req.parameters.is_empty() {
            return Err(CsiError::InvalidArgument("parameters are required".into()));
        }
        let source = ShareSource::from_parameters(&req.parameters)?;
        if let Some(mode) = unsupported_mode(&req.volume_capabilities) {
            return Err(CsiError::InvalidArgument(format!(
                "access mode {mode:?} is not supported"
            )));
        }

        let _guard = self.locks.try_acquire(format!("volume-name/{}", req.name))?;

        if let Some(existing) = self.registry.get_volume_by_name(&req.name).await {
            if existing.capacity_bytes >= req.capacity_bytes {
                debug!(volume_id = %existing.volume_id, "returning existing volume for idempotent create");
                return Ok(existing);
            }
            return Err(CsiError::AlreadyExists(format!(
                "volume {} has {} bytes, {} requested",
                req.name, existing.capacity_bytes, req.capacity_bytes
            )));
        }

        if let ShareSource::Local(root) = &source
            && !self.mounter.path_exists(root)
        {
            return Err(CsiError::InvalidArgument(format!(
                "source {} does not exist",
                root.display()
            )));
        }
        let seed = self.resolve_seed(req.content_source.as_ref()).await?;

        let volume_id = VolumeId(format!("smb-{}", uuid::Uuid::new_v4()));
        let lease = self.shares.acquire(&source, &req.secrets).await?;
        let path = lease.root().join(&volume_id.0);

        if let Err(e) = self.populate(&path, seed, &req.secrets).await {
            self.remove_dir_best_effort(&path).await;
            lease.release().await;
            return Err(e);
        }

        let volume = Volume {
            volume_id: volume_id.clone(),
            name: req.name,
            capacity_bytes: req.capacity_bytes,
            path: path.clone(),
            source: Some(source),
            volume_context: req.parameters,
            content_source: req.content_source,
            access_type: ACCESS_TYPE_MOUNT.to_owned(),
            attached: false,
            published: false,
            staged: false,
            node_id: String::new(),
        };
        let committed = self.registry.put_volume(volume.clone()).await;
        if committed.is_err() {
            self.remove_dir_best_effort(&path).await;
        }
        lease.release().await;
        committed?;

        info!(%volume_id, path = %path.display(), "volume created");
        Ok(volume)
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        let _guard = self.locks.try_acquire(format!("volume/{}", req.volume_id))?;

        let Some(volume) = self.registry.get_volume(&req.volume_id).await else {
            debug!("volume not found, nothing to delete");
            return Ok(());
        };
        if volume.in_use() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is in use (attached={}, published={}, staged={})",
                volume.volume_id, volume.attached, volume.published, volume.staged
            )));
        }

        if !volume.path.as_os_str().is_empty() {
            let lease = self
                .acquire_share(volume.source.as_ref(), &req.secrets)
                .await?;
            let mounter = Arc::clone(&self.mounter);
            let path = volume.path.clone();
            let removed = run_blocking("delete volume dir", move || mounter.delete_dir(&path)).await;
            if let Some(lease) = lease {
                lease.release().await;
            }
            removed?;
        }

        self.registry.delete_volume(&req.volume_id).await?;
        info!(path = %volume.path.display(), "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }
        if let Some(mode) = unsupported_mode(std::slice::from_ref(&req.volume_capability)) {
            return Err(CsiError::InvalidArgument(format!(
                "access mode {mode:?} is not supported"
            )));
        }
        let _guard = self.locks.try_acquire(format!("volume/{}", req.volume_id))?;

        let node_id = req.node_id.clone();
        let updated = self
            .registry
            .update_volume(
                &req.volume_id,
                Box::new(move |v: &mut Volume| {
                    v.attached = true;
                    v.node_id = node_id;
                }),
            )
            .await?;
        if updated.is_some() {
            info!("volume attached");
            return Ok(());
        }

        // Provisioned outside this controller: remember the attachment anyway.
        let volume = Volume {
            volume_id: req.volume_id.clone(),
            name: req.volume_id.0.clone(),
            capacity_bytes: 0,
            path: PathBuf::new(),
            source: ShareSource::from_parameters(&req.volume_context).ok(),
            volume_context: req.volume_context,
            content_source: None,
            access_type: ACCESS_TYPE_MOUNT.to_owned(),
            attached: true,
            published: false,
            staged: false,
            node_id: req.node_id,
        };
        self.registry.put_volume(volume).await?;
        info!("attachment recorded for unregistered volume");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        let _guard = self.locks.try_acquire(format!("volume/{volume_id}"))?;

        let Some(volume) = self.registry.get_volume(volume_id).await else {
            debug!("volume not found, nothing to unpublish");
            return Ok(());
        };
        if !node_id.is_empty() && !volume.node_id.is_empty() && volume.node_id != node_id {
            debug!(attached_to = %volume.node_id, "volume is not attached to this node");
            return Ok(());
        }

        self.registry
            .update_volume(
                volume_id,
                Box::new(|v: &mut Volume| {
                    v.attached = false;
                    v.node_id.clear();
                }),
            )
            .await?;
        info!("volume detached");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }

        if let Some(mode) = unsupported_mode(&req.volume_capabilities) {
            debug!(volume_id = %req.volume_id, ?mode, "unsupported access mode requested");
            return Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: format!("access mode {mode:?} is not supported"),
            });
        }
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(
                SUPPORTED_ACCESS_MODES
                    .iter()
                    .map(|mode| VolumeCapability::mount(*mode))
                    .collect(),
            ),
            message: String::new(),
        })
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError> {
        let (page, next_token) = paginate(
            self.registry.list_volumes().await,
            req.max_entries,
            &req.starting_token,
        )?;

        // One lease per distinct share for the whole page.  Shares are never
        // mounted here: ListVolumes carries no secrets.
        let mut leases: HashMap<String, ShareLease> = HashMap::new();
        let mut skipped: HashMap<String, String> = HashMap::new();
        let mut entries = Vec::with_capacity(page.len());
        for volume in page {
            let share_key = volume.source.as_ref().map(|s| s.to_string());
            if let (Some(source), Some(key)) = (&volume.source, &share_key)
                && !leases.contains_key(key)
                && !skipped.contains_key(key)
            {
                match self.shares.lease_if_mounted(source).await {
                    Ok(Some(lease)) => {
                        leases.insert(key.clone(), lease);
                    }
                    Ok(None) => {
                        debug!(share = %key, "share not mounted; skipping health probe");
                        skipped.insert(
                            key.clone(),
                            "share not mounted on controller; condition not probed".into(),
                        );
                    }
                    Err(e) => {
                        warn!(share = %key, error = %e, "cannot check share for health probe");
                        skipped.insert(key.clone(), format!("condition not probed: {e}"));
                    }
                }
            }

            let condition = match share_key.as_ref().and_then(|k| skipped.get(k)) {
                Some(reason) => VolumeCondition {
                    abnormal: false,
                    message: reason.clone(),
                },
                None => self.probe(&volume).await,
            };
            let published_node_ids = if volume.attached && !volume.node_id.is_empty() {
                vec![volume.node_id.clone()]
            } else {
                Vec::new()
            };
            entries.push(ListVolumesEntry {
                volume,
                status: VolumeStatus {
                    published_node_ids,
                    condition,
                },
            });
        }
        for lease in leases.into_values() {
            lease.release().await;
        }

        Ok(ListVolumesResponse {
            entries,
            next_token,
        })
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented(
            "capacity queries are not supported".into(),
        ))
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::ListVolumesPublishedNodes,
            ControllerCapability::VolumeCondition,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
            ControllerCapability::CloneVolume,
        ])
    }

    #[instrument(skip(self, req), fields(name = %req.name, source_volume_id = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot name is required".into()));
        }
        if req.source_volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "source volume id is required".into(),
            ));
        }
        let _guard = self.locks.try_acquire(format!("snapshot-name/{}", req.name))?;

        if let Some(existing) = self.registry.get_snapshot_by_name(&req.name).await {
            if existing.source_volume_id == req.source_volume_id {
                debug!(snapshot_id = %existing.snapshot_id, "returning existing snapshot for idempotent create");
                return Ok(existing);
            }
            return Err(CsiError::AlreadyExists(format!(
                "snapshot {} already exists for volume {}",
                req.name, existing.source_volume_id
            )));
        }

        let volume = self
            .registry
            .get_volume(&req.source_volume_id)
            .await
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!(
                    "source volume {} does not exist",
                    req.source_volume_id
                ))
            })?;
        if volume.path.as_os_str().is_empty() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} has no backing directory",
                volume.volume_id
            )));
        }

        let snapshot_id = SnapshotId(format!("snap-{}", uuid::Uuid::new_v4()));
        let archive = snapshot_archive_path(&self.snapshot_dir, &snapshot_id);

        let lease = self
            .acquire_share(volume.source.as_ref(), &req.secrets)
            .await?;
        let (from, to) = (volume.path.clone(), archive.clone());
        let result = run_blocking("create snapshot", move || {
            archiver::create_snapshot(&from, &to)
                .map_err(|e| CsiError::Internal(format!("archive {}: {e}", from.display())))
        })
        .await;
        if let Some(lease) = lease {
            lease.release().await;
        }
        let summary = result?;

        let snapshot = Snapshot {
            snapshot_id,
            name: req.name,
            source_volume_id: req.source_volume_id,
            path: archive,
            creation_time: Utc::now(),
            size_bytes: summary.bytes,
            ready_to_use: true,
        };
        if let Err(e) = self.registry.put_snapshot(snapshot.clone()).await {
            let archive = snapshot.path.clone();
            let cleanup = run_blocking("remove snapshot archive", move || {
                archiver::delete_snapshot(&archive).map_err(CsiError::internal)
            })
            .await;
            if let Err(cleanup) = cleanup {
                warn!(error = %cleanup, "failed to remove unregistered snapshot archive");
            }
            return Err(e);
        }

        info!(
            snapshot_id = %snapshot.snapshot_id,
            size_bytes = snapshot.size_bytes,
            "snapshot created",
        );
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        if snapshot_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot id is required".into()));
        }
        let _guard = self.locks.try_acquire(format!("snapshot/{snapshot_id}"))?;

        let Some(snapshot) = self.registry.get_snapshot(snapshot_id).await else {
            debug!("snapshot not found, nothing to delete");
            return Ok(());
        };

        // The record stays until the archive is gone, so a failure can be
        // retried.
        let archive = snapshot.path.clone();
        run_blocking("delete snapshot archive", move || {
            archiver::delete_snapshot(&archive).map_err(|e| {
                CsiError::Internal(format!("delete archive {}: {e}", archive.display()))
            })
        })
        .await?;

        self.registry.delete_snapshot(snapshot_id).await?;
        info!(archive = %snapshot.path.display(), "snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        let snapshots: Vec<Snapshot> = self
            .registry
            .list_snapshots()
            .await
            .into_iter()
            .filter(|s| req.snapshot_id.as_ref().is_none_or(|id| &s.snapshot_id == id))
            .filter(|s| {
                req.source_volume_id
                    .as_ref()
                    .is_none_or(|id| &s.source_volume_id == id)
            })
            .collect();
        let (entries, next_token) = paginate(snapshots, req.max_entries, &req.starting_token)?;
        Ok(ListSnapshotsResponse {
            entries,
            next_token,
        })
    }

    async fn controller_expand_volume(
        &self,
        _volume_id: &VolumeId,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented(
            "volume expansion is not supported".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::error::Code;
    use crate::mounter::FakeMounter;
    use crate::registry::MemoryRegistry;

    struct Fixture {
        _tmp: tempfile::TempDir,
        export: PathBuf,
        state_dir: PathBuf,
        registry: Arc<MemoryRegistry>,
        mounter: Arc<FakeMounter>,
        controller: SmbController,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let export = tmp.path().join("export/a");
        fs::create_dir_all(&export).unwrap();
        let config = DriverConfig {
            state_dir: tmp.path().join("state"),
            ..Default::default()
        };
        let registry = Arc::new(MemoryRegistry::new());
        let mounter = Arc::new(FakeMounter::new());
        let controller = SmbController::new(&config, registry.clone(), mounter.clone());
        Fixture {
            export,
            state_dir: config.state_dir.clone(),
            _tmp: tmp,
            registry,
            mounter,
            controller,
        }
    }

    impl Fixture {
        fn create_req(&self, name: &str, bytes: u64) -> CreateVolumeRequest {
            CreateVolumeRequest {
                name: name.into(),
                capacity_bytes: bytes,
                parameters: HashMap::from([(
                    PARAM_SOURCE.to_owned(),
                    self.export.display().to_string(),
                )]),
                ..Default::default()
            }
        }

        async fn create(&self, name: &str, bytes: u64) -> Volume {
            self.controller
                .create_volume(self.create_req(name, bytes))
                .await
                .unwrap()
        }

        async fn publish(&self, id: &VolumeId, node: &str) -> Result<(), CsiError> {
            self.controller
                .controller_publish_volume(ControllerPublishVolumeRequest {
                    volume_id: id.clone(),
                    node_id: node.into(),
                    volume_capability: VolumeCapability::default(),
                    readonly: false,
                    volume_context: HashMap::new(),
                })
                .await
        }

        async fn snapshot(&self, name: &str, vol: &VolumeId) -> Result<Snapshot, CsiError> {
            self.controller
                .create_snapshot(CreateSnapshotRequest {
                    name: name.into(),
                    source_volume_id: vol.clone(),
                    ..Default::default()
                })
                .await
        }

        async fn list(&self, max_entries: i32, token: &str) -> Result<ListVolumesResponse, CsiError> {
            self.controller
                .list_volumes(ListVolumesRequest {
                    max_entries,
                    starting_token: token.into(),
                })
                .await
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_by_name() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        assert!(vol.volume_id.0.starts_with("smb-"));
        assert_eq!(vol.capacity_bytes, 1024);
        assert_eq!(vol.path, fx.export.join(&vol.volume_id.0));
        assert!(vol.path.is_dir());
        assert_eq!(vol.source, Some(ShareSource::Local(fx.export.clone())));

        let again = fx.create("vol-a", 1024).await;
        assert_eq!(again.volume_id, vol.volume_id);
        let smaller = fx.create("vol-a", 512).await;
        assert_eq!(smaller.volume_id, vol.volume_id);

        let err = fx
            .controller
            .create_volume(fx.create_req("vol-a", 2048))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(fx.registry.list_volumes().await.len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_bad_requests() {
        let fx = fixture();

        let mut req = fx.create_req("", 1);
        assert_eq!(fx.controller.create_volume(req.clone()).await.unwrap_err().code(), Code::InvalidArgument);

        req.name = "v".into();
        req.parameters.clear();
        assert_eq!(fx.controller.create_volume(req.clone()).await.unwrap_err().code(), Code::InvalidArgument);

        req.parameters = HashMap::from([(PARAM_SERVER.to_owned(), "fs01".to_owned())]);
        assert_eq!(fx.controller.create_volume(req.clone()).await.unwrap_err().code(), Code::InvalidArgument);

        let mut req = fx.create_req("v", 1);
        req.volume_capabilities = vec![VolumeCapability::mount(AccessMode::SingleNodeMultiWriter)];
        assert_eq!(fx.controller.create_volume(req).await.unwrap_err().code(), Code::InvalidArgument);

        let mut req = fx.create_req("v", 1);
        req.parameters.insert(PARAM_SOURCE.to_owned(), "/definitely/not/here".to_owned());
        assert_eq!(fx.controller.create_volume(req).await.unwrap_err().code(), Code::InvalidArgument);

        assert!(fx.registry.list_volumes().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_duplicate_is_aborted() {
        let fx = fixture();
        let _busy = fx.controller.locks.try_acquire("volume-name/vol-a").unwrap();
        let err = fx
            .controller
            .create_volume(fx.create_req("vol-a", 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        fs::write(vol.path.join("data.txt"), b"payload").unwrap();

        fx.controller
            .delete_volume(vol.volume_id.clone().into())
            .await
            .unwrap();
        assert!(!vol.path.exists());
        assert!(fx.registry.get_volume(&vol.volume_id).await.is_none());

        fx.controller
            .delete_volume(vol.volume_id.clone().into())
            .await
            .unwrap();
        fx.controller
            .delete_volume(VolumeId::from("never-existed").into())
            .await
            .unwrap();
        let err = fx
            .controller
            .delete_volume(DeleteVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_while_attached_fails() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        fx.publish(&vol.volume_id, "node-a").await.unwrap();

        let err = fx
            .controller
            .delete_volume(vol.volume_id.clone().into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(vol.path.is_dir());

        fx.controller
            .controller_unpublish_volume(&vol.volume_id, "node-a")
            .await
            .unwrap();
        fx.controller
            .delete_volume(vol.volume_id.clone().into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_and_unpublish() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;

        fx.publish(&vol.volume_id, "node-a").await.unwrap();
        let stored = fx.registry.get_volume(&vol.volume_id).await.unwrap();
        assert!(stored.attached);
        assert_eq!(stored.node_id, "node-a");

        // Another node's detach leaves the attachment alone.
        fx.controller
            .controller_unpublish_volume(&vol.volume_id, "node-b")
            .await
            .unwrap();
        assert!(fx.registry.get_volume(&vol.volume_id).await.unwrap().attached);

        fx.controller
            .controller_unpublish_volume(&vol.volume_id, "node-a")
            .await
            .unwrap();
        let stored = fx.registry.get_volume(&vol.volume_id).await.unwrap();
        assert!(!stored.attached);
        assert!(stored.node_id.is_empty());

        fx.controller
            .controller_unpublish_volume(&"unknown".into(), "node-a")
            .await
            .unwrap();
        let err = fx.publish(&vol.volume_id, "").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn publish_unregistered_volume_records_it() {
        let fx = fixture();
        let id = VolumeId::from("provisioned-elsewhere");
        fx.publish(&id, "node-a").await.unwrap();

        let stored = fx.registry.get_volume(&id).await.unwrap();
        assert!(stored.attached);
        assert_eq!(stored.node_id, "node-a");
        assert!(stored.path.as_os_str().is_empty());
    }

    #[tokio::test]
    async fn validate_capabilities() {
        let fx = fixture();
        let supported = fx
            .controller
            .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
                volume_id: "v".into(),
                volume_capabilities: vec![
                    VolumeCapability::mount(AccessMode::MultiNodeMultiWriter),
                    VolumeCapability::mount(AccessMode::SingleNodeReaderOnly),
                ],
            })
            .await
            .unwrap();
        assert_eq!(supported.confirmed.unwrap().len(), SUPPORTED_ACCESS_MODES.len());
        assert!(supported.message.is_empty());

        let rejected = fx
            .controller
            .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
                volume_id: "v".into(),
                volume_capabilities: vec![
                    VolumeCapability::mount(AccessMode::MultiNodeMultiWriter),
                    VolumeCapability::mount(AccessMode::SingleNodeMultiWriter),
                ],
            })
            .await
            .unwrap();
        assert!(rejected.confirmed.is_none());
        assert!(!rejected.message.is_empty());

        let err = fx
            .controller
            .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
                volume_id: "v".into(),
                volume_capabilities: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn list_volumes_walks_every_page() {
        let fx = fixture();
        for i in 0..5 {
            fx.create(&format!("vol-{i}"), 1024).await;
        }

        let first = fx.list(2, "").await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_token, "3");
        let second = fx.list(2, &first.next_token).await.unwrap();
        assert_eq!(second.entries.len(), 2);
        assert_eq!(second.next_token, "5");
        let third = fx.list(2, &second.next_token).await.unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(third.next_token.is_empty());

        let ids: Vec<VolumeId> = [first, second, third]
            .into_iter()
            .flat_map(|page| page.entries)
            .map(|entry| {
                assert!(!entry.status.condition.abnormal, "{:?}", entry.status.condition);
                entry.volume.volume_id
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 5);

        assert_eq!(fx.list(-1, "").await.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(fx.list(2, "abc").await.unwrap_err().code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn list_volumes_reports_health_and_nodes() {
        let fx = fixture();
        let healthy = fx.create("healthy", 1024).await;
        let gone = fx.create("gone", 1024).await;
        fs::remove_dir(&gone.path).unwrap();
        fx.publish(&healthy.volume_id, "node-a").await.unwrap();

        let page = fx.list(0, "").await.unwrap();
        for entry in page.entries {
            if entry.volume.volume_id == healthy.volume_id {
                assert!(!entry.status.condition.abnormal);
                assert_eq!(entry.status.published_node_ids, ["node-a"]);
            } else {
                assert!(entry.status.condition.abnormal);
                assert_eq!(entry.status.condition.message, health::REASON_PATH_MISSING);
                assert!(entry.status.published_node_ids.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn list_volumes_never_mounts_shares() {
        let fx = fixture();
        let vol = fx
            .controller
            .create_volume(CreateVolumeRequest {
                name: "remote".into(),
                capacity_bytes: 1,
                parameters: HashMap::from([(PARAM_SOURCE.to_owned(), "//fs01/data".to_owned())]),
                secrets: HashMap::from([(SECRET_USERNAME.to_owned(), "svc".to_owned())]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fx.mounter.active_mounts(), 0);

        // Without credentials the share would refuse the mount.
        fx.mounter.fail_mounts(true);
        let page = fx.list(0, "").await.unwrap();
        let condition = &page.entries[0].status.condition;
        assert!(!condition.abnormal);
        assert!(condition.message.contains("not probed"), "{}", condition.message);
        assert_eq!(fx.mounter.mount_calls().len(), 1);

        let share_root = vol.path.parent().unwrap().to_path_buf();
        fx.mounter.fail_mounts(false);
        fx.mounter.mount("//fs01/data", &share_root, &[]).unwrap();
        let page = fx.list(0, "").await.unwrap();
        let condition = &page.entries[0].status.condition;
        assert!(!condition.abnormal);
        assert!(condition.message.is_empty(), "{}", condition.message);
        assert!(fx.mounter.is_mount_point(&share_root));
    }

    #[tokio::test]
    async fn snapshot_create_is_idempotent() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        fs::write(vol.path.join("a.txt"), b"hello").unwrap();
        fs::create_dir(vol.path.join("dir")).unwrap();
        fs::write(vol.path.join("dir/b.txt"), b"world!").unwrap();

        let snap = fx.snapshot("snap-1", &vol.volume_id).await.unwrap();
        assert!(snap.snapshot_id.0.starts_with("snap-"));
        assert!(snap.ready_to_use);
        assert_eq!(snap.size_bytes, 11);
        assert_eq!(snap.source_volume_id, vol.volume_id);
        assert_eq!(
            snap.path,
            fx.state_dir
                .join("snapshots")
                .join(format!("{}.tar.gz", snap.snapshot_id))
        );
        assert!(snap.path.is_file());

        let again = fx.snapshot("snap-1", &vol.volume_id).await.unwrap();
        assert_eq!(again, snap);

        let other = fx.create("vol-b", 1024).await;
        let err = fx.snapshot("snap-1", &other.volume_id).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);

        let err = fx.snapshot("snap-2", &"missing".into()).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn restore_from_snapshot() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        fs::write(vol.path.join("a.txt"), b"original").unwrap();
        let snap = fx.snapshot("snap-1", &vol.volume_id).await.unwrap();
        fs::write(vol.path.join("a.txt"), b"changed later").unwrap();

        // The snapshot outlives its source volume.
        fx.controller
            .delete_volume(vol.volume_id.clone().into())
            .await
            .unwrap();

        let mut req = fx.create_req("restored", 1024);
        req.content_source = Some(ContentSource::Snapshot(snap.snapshot_id.clone()));
        let restored = fx.controller.create_volume(req).await.unwrap();
        assert_eq!(fs::read(restored.path.join("a.txt")).unwrap(), b"original");
        assert_eq!(
            restored.content_source,
            Some(ContentSource::Snapshot(snap.snapshot_id))
        );

        let mut req = fx.create_req("bad-restore", 1024);
        req.content_source = Some(ContentSource::Snapshot("snap-unknown".into()));
        let err = fx.controller.create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn clone_from_volume() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        fs::create_dir_all(vol.path.join("nested")).unwrap();
        fs::write(vol.path.join("nested/c.txt"), b"clone me").unwrap();

        let mut req = fx.create_req("vol-clone", 1024);
        req.content_source = Some(ContentSource::Volume(vol.volume_id.clone()));
        let clone = fx.controller.create_volume(req).await.unwrap();

        assert_ne!(clone.path, vol.path);
        assert_eq!(fs::read(clone.path.join("nested/c.txt")).unwrap(), b"clone me");
        let scratch = fx.state_dir.join("tmp");
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);

        let mut req = fx.create_req("bad-clone", 1024);
        req.content_source = Some(ContentSource::Volume("missing".into()));
        let err = fx.controller.create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn failed_restore_leaves_nothing_behind() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        let snap = fx.snapshot("snap-1", &vol.volume_id).await.unwrap();
        fs::remove_file(&snap.path).unwrap();

        let mut req = fx.create_req("restored", 1024);
        req.content_source = Some(ContentSource::Snapshot(snap.snapshot_id));
        let err = fx.controller.create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(fx.registry.get_volume_by_name("restored").await.is_none());
        assert_eq!(fs::read_dir(&fx.export).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn delete_snapshot_removes_archive() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        let snap = fx.snapshot("snap-1", &vol.volume_id).await.unwrap();

        fx.controller.delete_snapshot(&snap.snapshot_id).await.unwrap();
        assert!(!snap.path.exists());
        assert!(fx.registry.get_snapshot(&snap.snapshot_id).await.is_none());

        fx.controller.delete_snapshot(&snap.snapshot_id).await.unwrap();
        let err = fx.controller.delete_snapshot(&"".into()).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn failed_archive_delete_keeps_record() {
        let fx = fixture();
        let vol = fx.create("vol-a", 1024).await;
        let snap = fx.snapshot("snap-1", &vol.volume_id).await.unwrap();
        // A non-empty directory in place of the archive cannot be unlinked.
        fs::remove_file(&snap.path).unwrap();
        fs::create_dir_all(snap.path.join("blocker")).unwrap();

        let err = fx
            .controller
            .delete_snapshot(&snap.snapshot_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(fx.registry.get_snapshot(&snap.snapshot_id).await.is_some());
    }

    #[tokio::test]
    async fn list_snapshots_filters_and_pages() {
        let fx = fixture();
        let a = fx.create("vol-a", 1024).await;
        let b = fx.create("vol-b", 1024).await;
        let s1 = fx.snapshot("s1", &a.volume_id).await.unwrap();
        fx.snapshot("s2", &a.volume_id).await.unwrap();
        fx.snapshot("s3", &b.volume_id).await.unwrap();

        let all = fx
            .controller
            .list_snapshots(ListSnapshotsRequest::default())
            .await
            .unwrap();
        assert_eq!(all.entries.len(), 3);
        assert!(all.next_token.is_empty());

        let of_a = fx
            .controller
            .list_snapshots(ListSnapshotsRequest {
                source_volume_id: Some(a.volume_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(of_a.entries.len(), 2);
        assert!(of_a.entries.iter().all(|s| s.source_volume_id == a.volume_id));

        let one = fx
            .controller
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: Some(s1.snapshot_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(one.entries, [s1]);

        let page = fx
            .controller
            .list_snapshots(ListSnapshotsRequest {
                max_entries: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_token, "3");
    }

    #[tokio::test]
    async fn remote_share_is_mounted_for_the_operation() {
        let fx = fixture();
        let req = CreateVolumeRequest {
            name: "remote".into(),
            capacity_bytes: 1,
            parameters: HashMap::from([
                (PARAM_SERVER.to_owned(), "fs01".to_owned()),
                (PARAM_SHARE.to_owned(), "data".to_owned()),
            ]),
            secrets: HashMap::from([
                (SECRET_USERNAME.to_owned(), "svc".to_owned()),
                (SECRET_PASSWORD.to_owned(), "pw".to_owned()),
            ]),
            ..Default::default()
        };
        let vol = fx.controller.create_volume(req).await.unwrap();

        let share_root = fx.state_dir.join("shares/_2f_2ffs01_2fdata");
        assert_eq!(vol.path, share_root.join(&vol.volume_id.0));
        assert_eq!(vol.volume_context.get(PARAM_SERVER).unwrap(), "fs01");

        let calls = fx.mounter.mount_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source, "//fs01/data");
        assert_eq!(calls[0].options, ["username=svc", "password=pw", "vers=3.0"]);
        assert_eq!(fx.mounter.active_mounts(), 0);

        fx.mounter.fail_mounts(true);
        let err = fx
            .controller
            .delete_volume(vol.volume_id.clone().into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(fx.registry.get_volume(&vol.volume_id).await.is_some());
    }

    #[tokio::test]
    async fn unsupported_operations() {
        let fx = fixture();
        assert_eq!(
            fx.controller.get_capacity().await.unwrap_err().code(),
            Code::Unimplemented
        );
        assert_eq!(
            fx.controller
                .controller_expand_volume(&"v".into(), 1)
                .await
                .unwrap_err()
                .code(),
            Code::Unimplemented
        );
        let caps = fx.controller.controller_get_capabilities().await.unwrap();
        assert!(caps.contains(&ControllerCapability::CloneVolume));
        assert_eq!(caps.len(), 8);
    }
}
