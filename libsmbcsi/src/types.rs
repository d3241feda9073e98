//! Core CSI types: volumes, snapshots, capabilities, requests and responses.
//!
//! These types form the data model shared by the CSI traits, the registry,
//! the transport layer and the SMB backend.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be persisted as JSON and
//! transmitted over QUIC.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CsiError;

// ---------------------------------------------------------------------------
// Recognized parameter / volume-context / secret keys
// ---------------------------------------------------------------------------

/// SMB server host, combined with [`PARAM_SHARE`] into `//server/share`.
pub const PARAM_SERVER: &str = "server";
/// SMB share name on [`PARAM_SERVER`].
pub const PARAM_SHARE: &str = "share";
/// Free-form mount source (`//host/share` or a local absolute path).
pub const PARAM_SOURCE: &str = "source";
/// Stage a per-volume subdirectory instead of the share root.
pub const PARAM_CREATE_SUB_DIR: &str = "createSubDir";
/// Credential user name (secrets).
pub const SECRET_USERNAME: &str = "username";
/// Credential password (secrets).
pub const SECRET_PASSWORD: &str = "password";

/// The only access type supported by SMB-backed volumes.
pub const ACCESS_TYPE_MOUNT: &str = "mount";

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque, unique identifier for a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be shared between nodes and writers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// Access modes an SMB share can honour.
pub const SUPPORTED_ACCESS_MODES: [AccessMode; 5] = [
    AccessMode::MultiNodeMultiWriter,
    AccessMode::MultiNodeReaderOnly,
    AccessMode::MultiNodeSingleWriter,
    AccessMode::SingleNodeReaderOnly,
    AccessMode::SingleNodeWriter,
];

impl AccessMode {
    pub fn is_supported(self) -> bool {
        SUPPORTED_ACCESS_MODES.contains(&self)
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noperm"`, `"dir_mode=0777"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type; empty means "whatever the share provides".
    #[serde(default)]
    pub fs_type: String,
}

impl VolumeCapability {
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            mount_flags: Vec::new(),
            fs_type: String::new(),
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount(AccessMode::MultiNodeMultiWriter)
    }
}

// ---------------------------------------------------------------------------
// Share source
// ---------------------------------------------------------------------------

/// Where a volume's data lives, parsed from request parameters or a volume
/// context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShareSource {
    /// A network share that must be mounted, e.g. `//server/share`.
    Remote(String),
    /// A directory that is already reachable on the local host.
    Local(PathBuf),
}

impl ShareSource {
    /// Resolve the recognized source keys of `params`.  Unknown keys are
    /// ignored.
    pub fn from_parameters(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let server = params.get(PARAM_SERVER).filter(|s| !s.is_empty());
        let share = params.get(PARAM_SHARE).filter(|s| !s.is_empty());
        match (server, share) {
            (Some(server), Some(share)) => {
                let share = share.trim_matches('/');
                return Ok(Self::Remote(format!("//{server}/{share}")));
            }
            (Some(_), None) => {
                return Err(CsiError::InvalidArgument(
                    "parameter `server` requires `share`".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(CsiError::InvalidArgument(
                    "parameter `share` requires `server`".into(),
                ));
            }
            (None, None) => {}
        }

        match params.get(PARAM_SOURCE).map(|s| s.trim()) {
            Some(src) if src.starts_with('/') && !src.starts_with("//") => {
                Ok(Self::Local(PathBuf::from(src)))
            }
            Some(src) if !src.is_empty() => Ok(Self::Remote(src.to_owned())),
            _ => Err(CsiError::InvalidArgument(
                "no share source: expected `server`/`share` or `source`".into(),
            )),
        }
    }

    /// A filesystem-safe key identifying the share, used to name its
    /// controller mount point.
    ///
    /// ASCII letters, digits, `-` and non-leading `.` are kept; every other
    /// byte becomes `_` followed by two hex digits.  Since `_` itself is
    /// always escaped, distinct sources never share a key.
    pub fn key(&self) -> String {
        let raw = match self {
            Self::Remote(s) => s.as_bytes(),
            Self::Local(p) => p.as_os_str().as_bytes(),
        };
        if raw.is_empty() {
            return "_".to_owned();
        }
        let mut key = String::with_capacity(raw.len());
        for (i, &b) in raw.iter().enumerate() {
            if b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i > 0) {
                key.push(char::from(b));
            } else {
                key.push_str(&format!("_{b:02x}"));
            }
        }
        key
    }
}

impl fmt::Display for ShareSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(s) => f.write_str(s),
            Self::Local(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Parse the `createSubDir` flag.  Absent means `false`.
pub fn create_sub_dir(context: &HashMap<String, String>) -> Result<bool, CsiError> {
    match context.get(PARAM_CREATE_SUB_DIR).map(|v| v.trim()) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) => Err(CsiError::InvalidArgument(format!(
            "`{PARAM_CREATE_SUB_DIR}` must be a boolean, got {v:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Volume / snapshot records
// ---------------------------------------------------------------------------

/// An existing snapshot or volume used to pre-populate a new volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentSource {
    Snapshot(SnapshotId),
    Volume(VolumeId),
}

/// Full metadata for a provisioned volume, as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Caller-supplied name, unique within the registry.
    pub name: String,
    /// Capacity requested at creation, in bytes.
    pub capacity_bytes: u64,
    /// Backing directory on the controller host.
    #[serde(default)]
    pub path: PathBuf,
    /// Upstream share holding the backing directory.
    #[serde(default)]
    pub source: Option<ShareSource>,
    /// Opaque context forwarded from the controller to node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Snapshot or volume this volume was populated from.
    #[serde(default)]
    pub content_source: Option<ContentSource>,
    #[serde(default = "default_access_type")]
    pub access_type: String,
    /// Bound to a node by `ControllerPublishVolume`.
    #[serde(default)]
    pub attached: bool,
    /// A node-local bind mount exists.
    #[serde(default)]
    pub published: bool,
    /// A node-local network mount exists.
    #[serde(default)]
    pub staged: bool,
    /// Node currently holding the volume; empty when detached.
    #[serde(default)]
    pub node_id: String,
}

fn default_access_type() -> String {
    ACCESS_TYPE_MOUNT.to_owned()
}

impl Volume {
    /// Whether any lifecycle flag forbids deletion.
    pub fn in_use(&self) -> bool {
        self.attached || self.published || self.staged
    }
}

/// A point-in-time archive of a volume's file tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    /// Caller-supplied name.
    pub name: String,
    pub source_volume_id: VolumeId,
    /// Location of the compressed archive.
    pub path: PathBuf,
    pub creation_time: DateTime<Utc>,
    /// Total bytes of regular file content captured.
    pub size_bytes: u64,
    pub ready_to_use: bool,
}

/// Snapshot archive location for `snapshot_id` below `snapshot_dir`.
pub fn snapshot_archive_path(snapshot_dir: &Path, snapshot_id: &SnapshotId) -> PathBuf {
    snapshot_dir.join(format!("{}.tar.gz", snapshot_id.0))
}

/// Outcome of a health probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Controller requests / responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-supplied name; repeated calls with the same name are
    /// idempotent.
    pub name: String,
    /// Minimum capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters (`server`/`share` or `source`).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Share credentials.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<ContentSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: VolumeId,
    /// Credentials for mounting the backing share, if it is remote.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

impl From<VolumeId> for DeleteVolumeRequest {
    fn from(volume_id: VolumeId) -> Self {
        Self {
            volume_id,
            secrets: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
}

/// Either a confirmed capability list or a rejection message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Page size; `0` means "all".
    #[serde(default)]
    pub max_entries: i32,
    /// 1-based decimal start index; empty means `"1"`.
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub published_node_ids: Vec<String>,
    pub condition: VolumeCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVolumesEntry {
    pub volume: Volume,
    pub status: VolumeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    pub entries: Vec<ListVolumesEntry>,
    /// Empty when this is the last page.
    pub next_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: VolumeId,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
    /// Only return this snapshot.
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    /// Only return snapshots of this volume.
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
    pub next_token: String,
}

/// RPCs advertised by `ControllerGetCapabilities`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    ListVolumesPublishedNodes,
    VolumeCondition,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
}

// ---------------------------------------------------------------------------
// Node requests / responses
// ---------------------------------------------------------------------------

/// Request to stage (network-mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Per-node staging mount point.
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    /// Context carried from `CreateVolume`; holds the share source.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// The staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Workload-visible target path.
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub unit: UsageUnit,
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
}

/// RPCs advertised by `NodeGetCapabilities`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.smb.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
}
