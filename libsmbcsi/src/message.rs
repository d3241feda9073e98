//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the orchestrator and the plugin via QUIC
//! bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests -----------------------------------------------
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // ----- Controller requests ---------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume {
        volume_id: VolumeId,
        #[serde(default)]
        node_id: String,
    },
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ListVolumes(ListVolumesRequest),
    GetCapacity,
    ControllerGetCapabilities,
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot(SnapshotId),
    ListSnapshots(ListSnapshotsRequest),
    ControllerExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },

    // ----- Node requests ---------------------------------------------------
    /// Mount the share at the node's staging path.
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Bind-mount a staged volume into a Pod.
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },
    GetNodeCapabilities,
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    VolumeCreated(Volume),
    VolumeList(ListVolumesResponse),
    /// Available capacity in bytes.
    Capacity(u64),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    ControllerCapabilities(Vec<ControllerCapability>),
    SnapshotCreated(Snapshot),
    SnapshotList(ListSnapshotsResponse),
    /// New capacity in bytes.
    VolumeExpanded(u64),
    VolumeStatsResponse(VolumeStats),
    NodeCapabilities(Vec<NodeCapability>),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    ProbeResult(bool),
    Error(CsiError),
}

// Secrets never appear here: this is what request logs show.
impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),

            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume { volume_id, node_id } => {
                write!(f, "ControllerUnpublishVolume({volume_id}, node={node_id})")
            }
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ListVolumes(req) => write!(
                f,
                "ListVolumes(max={}, token={:?})",
                req.max_entries, req.starting_token
            ),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::CreateSnapshot(req) => write!(
                f,
                "CreateSnapshot(name={}, source={})",
                req.name, req.source_volume_id
            ),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots(req) => write!(
                f,
                "ListSnapshots(max={}, token={:?})",
                req.max_entries, req.starting_token
            ),
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({volume_id})")
            }

            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => write!(f, "UnpublishVolume({volume_id})"),
            Self::GetVolumeStats { volume_id, .. } => write!(f, "GetVolumeStats({volume_id})"),
            Self::NodeExpandVolume { volume_id, .. } => write!(f, "NodeExpandVolume({volume_id})"),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),

            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(resp) => write!(
                f,
                "VolumeList(count={}, next={:?})",
                resp.entries.len(),
                resp.next_token
            ),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilitiesValidated(resp) => {
                write!(f, "CapabilitiesValidated(confirmed={})", resp.confirmed.is_some())
            }
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::SnapshotList(resp) => write!(
                f,
                "SnapshotList(count={}, next={:?})",
                resp.entries.len(),
                resp.next_token
            ),
            Self::VolumeExpanded(c) => write!(f, "VolumeExpanded({c})"),
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(count={})", stats.usage.len())
            }
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
