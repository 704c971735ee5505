use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use anyhow::anyhow;

use crate::core::device::{BusType, Device, DeviceResolver};

#[derive(Default)]
struct SimState {
    devices: Vec<Device>,
    system_roots: Vec<PathBuf>,
    next_index: u32,
}

/// In-memory device table. Mount roots can point at real directories, so
/// the engines run unchanged against temp dirs.
#[derive(Clone, Default)]
pub struct SimulatedResolver {
    state: Arc<RwLock<SimState>>,
}

/// Handle for adding and removing simulated devices while the resolver is
/// in use.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<RwLock<SimState>>,
}

impl SimulatedResolver {
    pub fn new() -> (Self, Simulator) {
        let resolver = Self::default();
        let simulator = Simulator {
            state: Arc::clone(&resolver.state),
        };
        (resolver, simulator)
    }
}

impl Simulator {
    /// Add a USB device of `size_gb` GiB. Its raw node is a path under the
    /// temp dir unless the caller inserts a full [`Device`].
    pub fn add_device(&self, name: &str, size_gb: u64, mount: Option<PathBuf>) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        let index = state.next_index;
        state.next_index += 1;
        state.devices.push(Device {
            index,
            name: name.to_string(),
            model: format!("Simulated {}", name),
            serial: format!("SIM{:04}", index),
            path: std::env::temp_dir().join(format!("wiped_sim_{}", name)),
            size: size_gb * 1024 * 1024 * 1024,
            bus: BusType::Usb,
            removable: true,
            mount_roots: mount.into_iter().collect(),
        });
    }

    pub fn insert(&self, mut device: Device) {
        if let Ok(mut state) = self.state.write() {
            device.index = state.next_index;
            state.next_index += 1;
            state.devices.push(device);
        }
    }

    pub fn remove_device(&self, name: &str) {
        if let Ok(mut state) = self.state.write() {
            state.devices.retain(|d| d.name != name);
        }
    }

    /// Treat everything under `root` as the system volume.
    pub fn protect(&self, root: impl Into<PathBuf>) {
        if let Ok(mut state) = self.state.write() {
            state.system_roots.push(root.into());
        }
    }
}

impl DeviceResolver for SimulatedResolver {
    fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow!("simulated device table poisoned"))?;
        Ok(state.devices.clone())
    }

    fn is_system_volume(&self, path: &Path) -> bool {
        match self.state.read() {
            Ok(state) => state.system_roots.iter().any(|r| path.starts_with(r)),
            // Unknown means protected.
            Err(_) => true,
        }
    }
}
