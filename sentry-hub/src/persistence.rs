use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::escalation::DEFAULT_COOLDOWN_SECS;

/// Operator settings that survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub last_device_id: Option<String>,
}

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            cooldown_seconds: DEFAULT_COOLDOWN_SECS,
            last_device_id: None,
        }
    }
}

/// Load settings from disk. Returns `None` if the file is missing or corrupt.
pub async fn load_settings(path: &Path) -> Option<HubSettings> {
    if !path.exists() {
        info!("No {} found, using defaults", path.display());
        return None;
    }

    match fs::read_to_string(path).await {
        Ok(data) => match serde_json::from_str::<HubSettings>(&data) {
            Ok(settings) => {
                info!(
                    "Loaded settings (cooldown {}s, last device {:?})",
                    settings.cooldown_seconds, settings.last_device_id
                );
                Some(settings)
            }
            Err(e) => {
                warn!("Failed to parse {}: {e}, using defaults", path.display());
                None
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {e}, using defaults", path.display());
            None
        }
    }
}

pub async fn save_settings(path: &Path, settings: &HubSettings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).await?;
    Ok(())
}
