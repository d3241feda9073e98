use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::{PluginCapability, PluginInfo};

pub struct SmbIdentity {
    driver_name: String,
    state_dir: PathBuf,
    controller_enabled: bool,
}

impl SmbIdentity {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            driver_name: config.driver_name.clone(),
            state_dir: config.state_dir.clone(),
            controller_enabled: config.mode.runs_controller(),
        }
    }
}

#[async_trait]
impl CsiIdentity for SmbIdentity {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Healthy while the state directory is reachable.
        let exists = tokio::fs::metadata(&self.state_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(exists)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        if self.controller_enabled {
            Ok(vec![PluginCapability::ControllerService])
        } else {
            Ok(Vec::new())
        }
    }
}
