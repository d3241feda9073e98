//! CSI Controller service trait.
//!
//! The Controller service owns the cluster-wide volume and snapshot
//! lifecycle: provisioning (optionally from a snapshot or another volume),
//! attachment bookkeeping, listing with health conditions, and snapshots.
//! It runs once per cluster, next to the registry.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerPublishVolumeRequest, CreateSnapshotRequest,
    CreateVolumeRequest, DeleteVolumeRequest, ListSnapshotsRequest, ListSnapshotsResponse,
    ListVolumesRequest, ListVolumesResponse, Snapshot, SnapshotId,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume, VolumeId,
};

/// Controller service: centralized volume management.
///
/// Every mutating call may be retried by the orchestrator.  Implementations
/// must return an equivalent result for a repeated identical request and
/// treat deletes of unknown identifiers as already satisfied.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one with the same
    /// name if it is large enough.
    ///
    /// The returned [`Volume`] carries the `volume_context` that must be
    /// forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume and its backing directory.  Fails with
    /// [`CsiError::FailedPrecondition`] while the volume is in use.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// Record that `node_id` holds the volume.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Clear the attachment recorded by [`Self::controller_publish_volume`].
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Check the requested access modes against what SMB shares support.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// One page of volumes, ascending by identifier, with health.
    async fn list_volumes(&self, req: ListVolumesRequest)
    -> Result<ListVolumesResponse, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Archive a volume's file tree.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// One page of snapshots, ascending by identifier.
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError>;

    /// Grow a volume to at least `capacity_bytes`.
    async fn controller_expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;
}
