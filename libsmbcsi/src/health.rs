//! Volume health probing for `ListVolumes`.

use std::path::Path;

use crate::mounter::Mounter;
use crate::types::VolumeCondition;

pub const REASON_PATH_MISSING: &str = "path does not exist";
pub const REASON_OVERCOMMITTED: &str = "volume capacity surpassed filesystem capacity";
pub const REASON_NO_SPACE: &str = "no more available space";

/// Check that `volume_path` is reachable and that its filesystem can back
/// `claimed_capacity_bytes`.
pub fn probe(mounter: &dyn Mounter, volume_path: &Path, claimed_capacity_bytes: u64) -> VolumeCondition {
    if volume_path.as_os_str().is_empty() || !mounter.path_exists(volume_path) {
        return abnormal(REASON_PATH_MISSING);
    }

    let info = match mounter.filesystem_info(volume_path) {
        Ok(info) => info,
        Err(e) => return abnormal(&format!("failed to get capacity info: {e}")),
    };
    if info.capacity_bytes() < claimed_capacity_bytes {
        return abnormal(REASON_OVERCOMMITTED);
    }
    if info.available_bytes() == 0 {
        return abnormal(REASON_NO_SPACE);
    }

    VolumeCondition::default()
}

fn abnormal(message: &str) -> VolumeCondition {
    VolumeCondition {
        abnormal: true,
        message: message.to_owned(),
    }
}
