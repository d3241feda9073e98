use async_trait::async_trait;
use dashmap::DashMap;

use super::{Registry, VolumeUpdate};
use crate::error::CsiError;
use crate::types::{Snapshot, SnapshotId, Volume, VolumeId};

/// Registry held entirely in memory.
///
/// # Thread safety
///
/// Each collection is a [`DashMap`]; name indices are kept next to it so
/// idempotent creates can look records up by caller-supplied name.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    volumes: DashMap<VolumeId, Volume>,
    volume_names: DashMap<String, VolumeId>,
    snapshots: DashMap<SnapshotId, Snapshot>,
    snapshot_names: DashMap<String, SnapshotId>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_volume(&self, volume: Volume) -> Option<Volume> {
        let id = volume.volume_id.clone();
        let name = volume.name.clone();
        let previous = self.volumes.insert(id.clone(), volume);
        if let Some(prev) = &previous
            && prev.name != name
        {
            self.volume_names.remove_if(&prev.name, |_, v| *v == id);
        }
        self.volume_names.insert(name, id);
        previous
    }

    pub(crate) fn modify_volume(
        &self,
        id: &VolumeId,
        apply: VolumeUpdate,
    ) -> Option<(Volume, Volume)> {
        let mut entry = self.volumes.get_mut(id)?;
        let before = entry.clone();
        let after = updated(&before, apply);
        *entry.value_mut() = after.clone();
        Some((before, after))
    }

    pub(crate) fn remove_volume(&self, id: &VolumeId) -> Option<Volume> {
        let (_, removed) = self.volumes.remove(id)?;
        self.volume_names.remove_if(&removed.name, |_, v| v == id);
        Some(removed)
    }

    pub(crate) fn insert_snapshot(&self, snapshot: Snapshot) -> Option<Snapshot> {
        let id = snapshot.snapshot_id.clone();
        let name = snapshot.name.clone();
        let previous = self.snapshots.insert(id.clone(), snapshot);
        if let Some(prev) = &previous
            && prev.name != name
        {
            self.snapshot_names.remove_if(&prev.name, |_, v| *v == id);
        }
        self.snapshot_names.insert(name, id);
        previous
    }

    pub(crate) fn remove_snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        let (_, removed) = self.snapshots.remove(id)?;
        self.snapshot_names.remove_if(&removed.name, |_, v| v == id);
        Some(removed)
    }

    pub(crate) fn sorted_volumes(&self) -> Vec<Volume> {
        let mut vols: Vec<Volume> = self.volumes.iter().map(|e| e.value().clone()).collect();
        vols.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        vols
    }

    pub(crate) fn sorted_snapshots(&self) -> Vec<Snapshot> {
        let mut snaps: Vec<Snapshot> = self.snapshots.iter().map(|e| e.value().clone()).collect();
        snaps.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        snaps
    }

    fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.volumes.get(id).map(|r| r.clone())
    }

    fn volume_by_name(&self, name: &str) -> Option<Volume> {
        let id = self.volume_names.get(name).map(|r| r.clone())?;
        self.volume(&id)
    }

    fn snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.snapshots.get(id).map(|r| r.clone())
    }

    fn snapshot_by_name(&self, name: &str) -> Option<Snapshot> {
        let id = self.snapshot_names.get(name).map(|r| r.clone())?;
        self.snapshot(&id)
    }
}

/// `volume` with `apply` run on a copy.  Identity fields are immutable.
pub(crate) fn updated(volume: &Volume, apply: VolumeUpdate) -> Volume {
    let mut next = volume.clone();
    apply(&mut next);
    next.volume_id = volume.volume_id.clone();
    next.name = volume.name.clone();
    next
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_volume(&self, id: &VolumeId) -> Option<Volume> {
        self.volume(id)
    }

    async fn get_volume_by_name(&self, name: &str) -> Option<Volume> {
        self.volume_by_name(name)
    }

    async fn put_volume(&self, volume: Volume) -> Result<(), CsiError> {
        self.insert_volume(volume);
        Ok(())
    }

    async fn update_volume(
        &self,
        id: &VolumeId,
        apply: VolumeUpdate,
    ) -> Result<Option<Volume>, CsiError> {
        Ok(self.modify_volume(id, apply).map(|(_, after)| after))
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<(), CsiError> {
        self.remove_volume(id);
        Ok(())
    }

    async fn list_volumes(&self) -> Vec<Volume> {
        self.sorted_volumes()
    }

    async fn get_snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.snapshot(id)
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Option<Snapshot> {
        self.snapshot_by_name(name)
    }

    async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        self.insert_snapshot(snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), CsiError> {
        self.remove_snapshot(id);
        Ok(())
    }

    async fn list_snapshots(&self) -> Vec<Snapshot> {
        self.sorted_snapshots()
    }
}
