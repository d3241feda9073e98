//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local mounts
//! required to make a volume available to Pod containers:
//!
//! 1. **Stage**: mount the SMB share once per node at a staging path.
//! 2. **Publish**: bind-mount the staging path into the Pod's container.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: unmount the share.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
    VolumeStats,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: mount the share at the staging path.
    ///
    /// This is idempotent; calling it again for an already-staged volume
    /// succeeds without mounting twice.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the share and remove the staging path.
    ///
    /// This is idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the container.
    ///
    /// This is idempotent; calling it again for the same `target_path`
    /// succeeds without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: remove the bind-mount and its target directory.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Capacity and usage of the filesystem mounted at `volume_path`.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    async fn node_expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
