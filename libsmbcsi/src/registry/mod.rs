//! Volume / snapshot registry: the single source of truth for lifecycle
//! state.
//!
//! [`MemoryRegistry`] keeps both collections in concurrent maps and is used
//! directly by tests.  [`FileRegistry`] layers atomic persistence to one JSON
//! record file on top of it, so state survives a plugin restart.
//!
//! In memory, mutations of one identifier are serialized by the map's entry
//! locks.  The file registry runs all mutations one at a time, since each
//! rewrites the whole record file.

mod file;
mod memory;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{Snapshot, SnapshotId, Volume, VolumeId};

pub use file::FileRegistry;
pub use memory::MemoryRegistry;

/// In-place modification applied atomically by [`Registry::update_volume`].
pub type VolumeUpdate = Box<dyn FnOnce(&mut Volume) + Send>;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_volume(&self, id: &VolumeId) -> Option<Volume>;

    async fn get_volume_by_name(&self, name: &str) -> Option<Volume>;

    /// Insert or replace the volume keyed by its identifier.
    async fn put_volume(&self, volume: Volume) -> Result<(), CsiError>;

    /// Read-modify-write of an existing volume.  Returns the updated record,
    /// or `None` when the identifier is unknown.
    async fn update_volume(
        &self,
        id: &VolumeId,
        apply: VolumeUpdate,
    ) -> Result<Option<Volume>, CsiError>;

    /// Remove a volume.  Unknown identifiers are a no-op.
    async fn delete_volume(&self, id: &VolumeId) -> Result<(), CsiError>;

    /// All volumes, ascending by identifier.
    async fn list_volumes(&self) -> Vec<Volume>;

    async fn get_snapshot(&self, id: &SnapshotId) -> Option<Snapshot>;

    async fn get_snapshot_by_name(&self, name: &str) -> Option<Snapshot>;

    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError>;

    /// Remove a snapshot record.  Unknown identifiers are a no-op.
    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), CsiError>;

    /// All snapshots, ascending by identifier.
    async fn list_snapshots(&self) -> Vec<Snapshot>;
}
