//! Driver configuration and the on-disk layout derived from it.
//!
//! ```text
//! <state_dir>/
//!   state.json                 # registry record file
//!   snapshots/<snap-id>.tar.gz # snapshot archives
//!   shares/<share-key>/        # controller mounts of remote shares
//!   tmp/                       # scratch archives for volume clones
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DRIVER_NAME: &str = "rk8s.smb.csi";
pub const DEFAULT_STATE_DIR: &str = "/csi-data-dir";
pub const DEFAULT_MAX_VOLUMES_PER_NODE: u64 = 256;

/// Which services this process runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Controller,
    Node,
    #[default]
    All,
}

impl Mode {
    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    pub state_dir: PathBuf,
    pub mode: Mode,
    pub listen: SocketAddr,
    /// Upper bound for a single mount or unmount, in seconds.
    pub mount_timeout: Option<u64>,
    pub max_volumes_per_node: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: String::new(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            mode: Mode::All,
            listen: SocketAddr::from(([0, 0, 0, 0], 6443)),
            mount_timeout: None,
            max_volumes_per_node: DEFAULT_MAX_VOLUMES_PER_NODE,
        }
    }
}

impl DriverConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    pub fn share_dir(&self) -> PathBuf {
        self.state_dir.join("shares")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    pub fn mount_timeout(&self) -> Option<Duration> {
        self.mount_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
