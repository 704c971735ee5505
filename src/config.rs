use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::WipeError;

const SYSTEM_CONFIG_PATH: &str = "/etc/wiped/config.toml";
const LOCAL_CONFIG_PATH: &str = "wiped.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub backup_directory: PathBuf,
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Write `decryption_key.txt` next to the containers. When off, the key is
    /// only handed back through the job record.
    pub persist_key_artifact: bool,
    pub wipe: WipeSettings,
}

/// Tunables for the overwrite engines and the region scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WipeSettings {
    pub chunk_size: u64,
    pub overwrite_passes: u32,
    pub quick_passes: u32,
    pub file_passes: u32,
    pub device_region_size: u64,
    pub removable_region_size: u64,
    pub device_workers: usize,
    pub removable_workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from("backups"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 8744)),
            simulation: false,
            verbose: false,
            json_logs: false,
            persist_key_artifact: true,
            wipe: WipeSettings::default(),
        }
    }
}

impl Default for WipeSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            overwrite_passes: 3,
            quick_passes: 1,
            file_passes: 3,
            device_region_size: 1024 * 1024,
            removable_region_size: 512 * 1024,
            device_workers: 16,
            removable_workers: 8,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config files, `WIPED_*` env vars and
    /// finally any CLI overrides.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(LOCAL_CONFIG_PATH))
            .merge(Env::prefixed("WIPED_").split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment.extract().context("Failed to load configuration")?;
        config.wipe.validate()?;
        Ok(config)
    }
}

impl WipeSettings {
    pub fn validate(&self) -> std::result::Result<(), WipeError> {
        for (name, value) in [
            ("chunk_size", self.chunk_size),
            ("device_region_size", self.device_region_size),
            ("removable_region_size", self.removable_region_size),
        ] {
            if value == 0 || value % 16 != 0 {
                return Err(WipeError::InvalidConfig(format!(
                    "{} must be a non-zero multiple of 16, got {}",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("overwrite_passes", self.overwrite_passes),
            ("quick_passes", self.quick_passes),
            ("file_passes", self.file_passes),
        ] {
            if value == 0 {
                return Err(WipeError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }

        if self.device_workers == 0 || self.removable_workers == 0 {
            return Err(WipeError::InvalidConfig(
                "worker caps must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Freeze the settings for one job. Quick jobs get `quick_passes`.
    pub fn profile(&self, quick: bool) -> WipeProfile {
        WipeProfile {
            chunk_size: self.chunk_size as usize,
            passes: if quick {
                self.quick_passes
            } else {
                self.overwrite_passes
            },
            file_passes: self.file_passes,
            device_region_size: NonZeroU64::new(self.device_region_size)
                .unwrap_or(NonZeroU64::MIN),
            removable_region_size: NonZeroU64::new(self.removable_region_size)
                .unwrap_or(NonZeroU64::MIN),
            device_workers: self.device_workers.max(1),
            removable_workers: self.removable_workers.max(1),
        }
    }
}

/// Immutable per-job snapshot of [`WipeSettings`].
///
/// Jobs never read the shared config after start, so a quick wipe running
/// next to a full wipe cannot change the other's pass count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WipeProfile {
    pub chunk_size: usize,
    pub passes: u32,
    pub file_passes: u32,
    pub device_region_size: NonZeroU64,
    pub removable_region_size: NonZeroU64,
    pub device_workers: usize,
    pub removable_workers: usize,
}

impl Default for WipeProfile {
    fn default() -> Self {
        WipeSettings::default().profile(false)
    }
}
