#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{TempDir, tempdir};
use wiped::adapters::{SimulatedResolver, Simulator};
use wiped::config::AppConfig;
use wiped::context::AppContext;
use wiped::core::{BusType, Device, WipeService};

pub const DEVICE: &str = "TESTSTICK";

/// A simulated USB stick mounted at a temp directory.
pub struct Fixture {
    pub temp: TempDir,
    pub mount: PathBuf,
    pub backups: PathBuf,
    pub ctx: AppContext,
    pub sim: Simulator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let temp = tempdir().unwrap();
        let mount = temp.path().join("media").join(DEVICE);
        fs::create_dir_all(&mount).unwrap();
        let backups = temp.path().join("backups");

        let (resolver, sim) = SimulatedResolver::new();
        sim.add_device(DEVICE, 8, Some(mount.clone()));

        let mut config = AppConfig {
            backup_directory: backups.clone(),
            simulation: true,
            ..Default::default()
        };
        tweak(&mut config);

        Self {
            ctx: AppContext::new(config, Arc::new(resolver)),
            temp,
            mount,
            backups,
            sim,
        }
    }

    pub fn service(&self) -> WipeService {
        WipeService::new(self.ctx.clone())
    }

    pub fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.mount.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    /// Register an unmounted device backed by an image file.
    pub fn add_image(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.temp.path().join(format!("{}.img", name));
        fs::write(&path, content).unwrap();
        self.sim.insert(Device {
            index: 0,
            name: name.to_string(),
            model: "Image".to_string(),
            serial: String::new(),
            path: path.clone(),
            size: content.len() as u64,
            bus: BusType::Usb,
            removable: true,
            mount_roots: Vec::new(),
        });
        path
    }
}

/// Deterministic, non-repeating-ish test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn count_files(root: &Path) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}
