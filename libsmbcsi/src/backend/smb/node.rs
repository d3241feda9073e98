//! SMB node service: stage the share once per node, bind it into workloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::inflight::OperationLocks;
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::mounter::{Mounter, run_blocking, run_mount};
use crate::node::CsiNode;
use crate::registry::{Registry, VolumeUpdate};
use crate::types::*;

const SUB_DIR_MODE: u32 = 0o777;

pub struct SmbNode {
    node_id: String,
    max_volumes: u64,
    mounter: Arc<dyn Mounter>,
    /// Present when the node shares the controller's registry.
    registry: Option<Arc<dyn Registry>>,
    locks: OperationLocks,
    mount_timeout: Option<Duration>,
}

impl SmbNode {
    pub fn new(config: &DriverConfig, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            node_id: config.node_id.clone(),
            max_volumes: config.max_volumes_per_node,
            mounter,
            registry: None,
            locks: OperationLocks::new(),
            mount_timeout: config.mount_timeout(),
        }
    }

    /// Record stage and publish transitions in `registry`.
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    async fn record(&self, volume_id: &VolumeId, apply: VolumeUpdate) -> Result<(), CsiError> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        if registry.update_volume(volume_id, apply).await?.is_none() {
            debug!(%volume_id, "volume not registered, flags not recorded");
        }
        Ok(())
    }

    /// Unmount `target` and remove it.
    async fn tear_down(&self, op: &'static str, target: &str) -> Result<(), CsiError> {
        let mounter = Arc::clone(&self.mounter);
        let target = PathBuf::from(target);
        run_mount(op, self.mount_timeout, move || {
            mounter.unmount(&target)?;
            mounter.delete_dir(&target)
        })
        .await
    }
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

fn is_read_only(mode: AccessMode) -> bool {
    matches!(
        mode,
        AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly
    )
}

fn used_bytes(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[async_trait]
impl CsiNode for SmbNode {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let source = ShareSource::from_parameters(&req.volume_context)?;
        let sub_dir = create_sub_dir(&req.volume_context)?;
        let _guard = self
            .locks
            .try_acquire(format!("target/{}", req.staging_target_path))?;

        let mounter = Arc::clone(&self.mounter);
        let staging = PathBuf::from(&req.staging_target_path);
        let target = staging.clone();
        let flags = req.volume_capability.mount_flags.clone();
        let secrets = req.secrets;
        let mounted = run_mount("stage volume", self.mount_timeout, move || {
            if mounter.is_mount_point(&target) {
                return Ok(false);
            }
            let result = match &source {
                ShareSource::Remote(remote) => mounter.auth_mount(remote, &target, &secrets, &flags),
                ShareSource::Local(dir) => mounter.bind_mount(dir, &target, false),
            };
            if let Err(e) = result {
                if let Err(cleanup) = mounter.delete_dir(&target) {
                    warn!(path = %target.display(), error = %cleanup, "failed to remove staging dir");
                }
                return Err(e);
            }
            Ok(true)
        })
        .await?;
        if mounted {
            info!("volume staged");
        } else {
            debug!("staging path already mounted");
        }

        if sub_dir {
            let mounter = Arc::clone(&self.mounter);
            let dir = staging.join(&req.volume_id.0);
            run_blocking("create sub dir", move || mounter.create_dir(&dir, SUB_DIR_MODE)).await?;
        }

        self.record(&req.volume_id, Box::new(|v: &mut Volume| v.staged = true))
            .await
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(staging_target_path, "staging target path")?;
        let _guard = self.locks.try_acquire(format!("target/{staging_target_path}"))?;

        self.tear_down("unstage volume", staging_target_path).await?;
        info!("volume unstaged");
        self.record(volume_id, Box::new(|v: &mut Volume| v.staged = false))
            .await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        require(&req.target_path, "target path")?;
        let sub_dir = create_sub_dir(&req.volume_context)?;
        let _guard = self.locks.try_acquire(format!("target/{}", req.target_path))?;

        let mut source = PathBuf::from(&req.staging_target_path);
        if sub_dir {
            source.push(&req.volume_id.0);
        }
        let target = PathBuf::from(&req.target_path);
        let read_only = req.read_only || is_read_only(req.volume_capability.access_mode);

        let mounter = Arc::clone(&self.mounter);
        let mounted = run_mount("publish volume", self.mount_timeout, move || {
            if mounter.is_mount_point(&target) {
                return Ok(false);
            }
            mounter.bind_mount(&source, &target, read_only)?;
            Ok(true)
        })
        .await?;
        if mounted {
            info!(read_only, "volume published");
        } else {
            debug!("target already mounted");
        }

        self.record(&req.volume_id, Box::new(|v: &mut Volume| v.published = true))
            .await
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(target_path, "target path")?;
        let _guard = self.locks.try_acquire(format!("target/{target_path}"))?;

        self.tear_down("unpublish volume", target_path).await?;
        info!("volume unpublished");
        self.record(volume_id, Box::new(|v: &mut Volume| v.published = false))
            .await
    }

    #[instrument(skip(self))]
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        require(&volume_id.0, "volume id")?;
        require(volume_path, "volume path")?;

        let mounter = Arc::clone(&self.mounter);
        let path = PathBuf::from(volume_path);
        run_blocking("volume stats", move || {
            if !mounter.path_exists(&path) {
                return Err(CsiError::NotFound(format!(
                    "path {} does not exist",
                    path.display()
                )));
            }
            let info = mounter.filesystem_info(&path)?;
            let total = info.capacity_bytes();
            let used = used_bytes(&path);
            Ok(VolumeStats {
                usage: vec![
                    VolumeUsage {
                        unit: UsageUnit::Bytes,
                        total,
                        used,
                        available: total.saturating_sub(used),
                    },
                    VolumeUsage {
                        unit: UsageUnit::Inodes,
                        total: info.total_inodes,
                        used: info.total_inodes.saturating_sub(info.free_inodes),
                        available: info.free_inodes,
                    },
                ],
            })
        })
        .await
    }

    async fn node_expand_volume(
        &self,
        _volume_id: &VolumeId,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented(
            "volume expansion is not supported".into(),
        ))
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::GetVolumeStats,
        ])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    use crate::error::Code;
    use crate::mounter::FakeMounter;
    use crate::registry::MemoryRegistry;

    struct Fixture {
        tmp: tempfile::TempDir,
        mounter: Arc<FakeMounter>,
        registry: Arc<MemoryRegistry>,
        node: SmbNode,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            node_id: "node-a".into(),
            state_dir: tmp.path().join("state"),
            ..Default::default()
        };
        let mounter = Arc::new(FakeMounter::new());
        let registry = Arc::new(MemoryRegistry::new());
        let node = SmbNode::new(&config, mounter.clone()).with_registry(registry.clone());
        Fixture {
            tmp,
            mounter,
            registry,
            node,
        }
    }

    fn remote_context() -> HashMap<String, String> {
        HashMap::from([
            (PARAM_SERVER.to_owned(), "fs01".to_owned()),
            (PARAM_SHARE.to_owned(), "data".to_owned()),
        ])
    }

    fn volume(id: &str) -> Volume {
        Volume {
            volume_id: id.into(),
            name: id.into(),
            capacity_bytes: 1,
            path: PathBuf::new(),
            source: None,
            volume_context: HashMap::new(),
            content_source: None,
            access_type: ACCESS_TYPE_MOUNT.into(),
            attached: true,
            published: false,
            staged: false,
            node_id: "node-a".into(),
        }
    }

    impl Fixture {
        fn path(&self, name: &str) -> String {
            self.tmp.path().join(name).display().to_string()
        }

        fn stage_req(&self, context: HashMap<String, String>) -> NodeStageVolumeRequest {
            NodeStageVolumeRequest {
                volume_id: "vol-1".into(),
                staging_target_path: self.path("staging"),
                volume_capability: VolumeCapability {
                    mount_flags: vec!["noperm".into()],
                    ..Default::default()
                },
                volume_context: context,
                secrets: HashMap::from([(SECRET_USERNAME.to_owned(), "svc".to_owned())]),
            }
        }

        fn publish_req(&self, context: HashMap<String, String>) -> NodePublishVolumeRequest {
            NodePublishVolumeRequest {
                volume_id: "vol-1".into(),
                staging_target_path: self.path("staging"),
                target_path: self.path("pod/volume"),
                volume_capability: VolumeCapability::default(),
                read_only: false,
                volume_context: context,
            }
        }
    }

    #[tokio::test]
    async fn stage_mounts_share_once() {
        let fx = fixture();
        fx.registry.put_volume(volume("vol-1")).await.unwrap();

        fx.node.stage_volume(fx.stage_req(remote_context())).await.unwrap();
        fx.node.stage_volume(fx.stage_req(remote_context())).await.unwrap();

        let calls = fx.mounter.mount_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source, "//fs01/data");
        assert_eq!(calls[0].target, PathBuf::from(fx.path("staging")));
        assert_eq!(calls[0].options, ["username=svc", "vers=3.0", "noperm"]);
        assert!(fx.registry.get_volume(&"vol-1".into()).await.unwrap().staged);
    }

    #[tokio::test]
    async fn stage_creates_sub_dir() {
        let fx = fixture();
        let mut context = remote_context();
        context.insert(PARAM_CREATE_SUB_DIR.into(), "true".into());

        fx.node.stage_volume(fx.stage_req(context)).await.unwrap();
        assert!(fx.tmp.path().join("staging/vol-1").is_dir());
    }

    #[tokio::test]
    async fn failed_stage_removes_staging_dir() {
        let fx = fixture();
        fx.mounter.fail_mounts(true);

        let err = fx
            .node
            .stage_volume(fx.stage_req(remote_context()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(!fx.tmp.path().join("staging").exists());
    }

    #[tokio::test]
    async fn stage_local_source_binds() {
        let fx = fixture();
        let export = fx.tmp.path().join("export");
        fs::create_dir(&export).unwrap();
        let context = HashMap::from([(PARAM_SOURCE.to_owned(), export.display().to_string())]);

        fx.node.stage_volume(fx.stage_req(context)).await.unwrap();
        let record = fx.mounter.mount_at(Path::new(&fx.path("staging"))).unwrap();
        assert!(record.bind);
        assert_eq!(record.source, export.display().to_string());
    }

    #[tokio::test]
    async fn stage_rejects_bad_requests() {
        let fx = fixture();
        let err = fx
            .node
            .stage_volume(fx.stage_req(HashMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut req = fx.stage_req(remote_context());
        req.staging_target_path.clear();
        let err = fx.node.stage_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut context = remote_context();
        context.insert(PARAM_CREATE_SUB_DIR.into(), "maybe".into());
        let err = fx.node.stage_volume(fx.stage_req(context)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(fx.mounter.mount_calls().is_empty());
    }

    #[tokio::test]
    async fn publish_binds_staging_path() {
        let fx = fixture();
        fx.registry.put_volume(volume("vol-1")).await.unwrap();
        fx.node.stage_volume(fx.stage_req(remote_context())).await.unwrap();

        fx.node.publish_volume(fx.publish_req(remote_context())).await.unwrap();
        fx.node.publish_volume(fx.publish_req(remote_context())).await.unwrap();

        let record = fx.mounter.mount_at(Path::new(&fx.path("pod/volume"))).unwrap();
        assert!(record.bind);
        assert!(!record.read_only);
        assert_eq!(record.source, fx.path("staging"));
        assert_eq!(fx.mounter.mount_calls().len(), 2);
        assert!(fx.registry.get_volume(&"vol-1".into()).await.unwrap().published);
    }

    #[tokio::test]
    async fn publish_sub_dir_read_only() {
        let fx = fixture();
        let mut context = remote_context();
        context.insert(PARAM_CREATE_SUB_DIR.into(), "true".into());
        fx.node.stage_volume(fx.stage_req(context.clone())).await.unwrap();

        let mut req = fx.publish_req(context);
        req.volume_capability = VolumeCapability::mount(AccessMode::MultiNodeReaderOnly);
        fx.node.publish_volume(req).await.unwrap();

        let record = fx.mounter.mount_at(Path::new(&fx.path("pod/volume"))).unwrap();
        assert!(record.read_only);
        assert_eq!(record.source, fx.tmp.path().join("staging/vol-1").display().to_string());
    }

    #[tokio::test]
    async fn publish_without_staging_fails() {
        let fx = fixture();
        let err = fx
            .node
            .publish_volume(fx.publish_req(HashMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let fx = fixture();
        fx.registry.put_volume(volume("vol-1")).await.unwrap();
        fx.node.stage_volume(fx.stage_req(remote_context())).await.unwrap();
        fx.node.publish_volume(fx.publish_req(remote_context())).await.unwrap();

        let id = VolumeId::from("vol-1");
        for _ in 0..2 {
            fx.node.unpublish_volume(&id, &fx.path("pod/volume")).await.unwrap();
            fx.node.unstage_volume(&id, &fx.path("staging")).await.unwrap();
        }

        assert_eq!(fx.mounter.active_mounts(), 0);
        assert!(!fx.tmp.path().join("pod/volume").exists());
        assert!(!fx.tmp.path().join("staging").exists());
        let stored = fx.registry.get_volume(&id).await.unwrap();
        assert!(!stored.published);
        assert!(!stored.staged);

        let err = fx.node.unstage_volume(&id, "").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn volume_stats() {
        let fx = fixture();
        let dir = fx.tmp.path().join("vol");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a"), vec![0u8; 60]).unwrap();
        fs::write(dir.join("sub/b"), vec![0u8; 40]).unwrap();

        let stats = fx
            .node
            .get_volume_stats(&"vol-1".into(), &dir.display().to_string())
            .await
            .unwrap();
        let total = 4096 * 262_144;
        assert_eq!(
            stats.usage,
            [
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total,
                    used: 100,
                    available: total - 100,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: 65_536,
                    used: 536,
                    available: 65_000,
                },
            ]
        );

        let err = fx.node.get_volume_stats(&"vol-1".into(), "").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = fx
            .node
            .get_volume_stats(&"vol-1".into(), &fx.path("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn info_and_capabilities() {
        let fx = fixture();
        let info = fx.node.get_info().await.unwrap();
        assert_eq!(info.node_id, "node-a");
        assert_eq!(info.max_volumes, 256);
        assert_eq!(fx.node.get_capabilities().await.unwrap().len(), 2);
        assert_eq!(
            fx.node
                .node_expand_volume(&"vol-1".into(), 1)
                .await
                .unwrap_err()
                .code(),
            Code::Unimplemented
        );
    }
}
