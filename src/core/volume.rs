//! Walking mounted volumes and guarding the system volume.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::device::{Device, DeviceResolver};
use crate::core::run_blocking;
use crate::error::{Result, WipeError};

/// Directories the OS keeps on removable media. Never descended into.
const SKIPPED_DIRS: &[&str] = &[
    "system volume information",
    "$recycle.bin",
    "$recycler",
    "lost+found",
    ".trashes",
    ".spotlight-v100",
    ".fseventsd",
];

static DRIVE_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z]):\\$").expect("static regex"));
static VOLUME_GUID_ROOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\\\\\?\\Volume\{([0-9A-Fa-f-]+)\}\\$").expect("static regex")
});

/// A regular file found on a volume.
#[derive(Debug, Clone)]
pub struct VolumeFile {
    pub path: PathBuf,
    /// Path relative to the mount root.
    pub relative: PathBuf,
    pub size: u64,
}

fn is_skipped_dir(name: &str) -> bool {
    let lower = name.to_lowercase();
    SKIPPED_DIRS.iter().any(|d| *d == lower)
}

/// Every regular file under `root`, skipping OS metadata directories and
/// not following symlinks. Unreadable entries are logged and skipped.
pub fn scan_files(root: &Path) -> Vec<VolumeFile> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() > 0
                && e.file_type().is_dir()
                && is_skipped_dir(&e.file_name().to_string_lossy()))
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Skipping file without metadata");
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        files.push(VolumeFile {
            relative: relative.to_path_buf(),
            path: entry.path().to_path_buf(),
            size,
        });
    }
    files
}

/// Refuse the whole operation if any root is the system volume. Runs before
/// anything is written.
pub fn guard_roots(resolver: &dyn DeviceResolver, roots: &[PathBuf]) -> Result<()> {
    if let Some(root) = roots.iter().find(|r| resolver.is_system_volume(r)) {
        return Err(WipeError::SystemVolumeRefused(root.clone()));
    }
    Ok(())
}

/// Resolve `label` to a device without blocking the runtime.
pub async fn resolve_device(resolver: &Arc<dyn DeviceResolver>, label: &str) -> Result<Device> {
    let resolver = Arc::clone(resolver);
    let query = label.to_string();
    let found = run_blocking(move || {
        resolver
            .resolve(&query)
            .map_err(|e| WipeError::Resolver(format!("{:#}", e)))
    })
    .await?;
    found.ok_or_else(|| WipeError::DeviceNotFound(label.to_string()))
}

/// Mount roots of `device` that can be walked. Refuses the system volume
/// first, so an unreadable system root still aborts.
pub fn accessible_roots(resolver: &dyn DeviceResolver, device: &Device) -> Result<Vec<PathBuf>> {
    guard_roots(resolver, &device.mount_roots)?;
    Ok(device
        .mount_roots
        .iter()
        .filter(|r| r.is_dir())
        .cloned()
        .collect())
}

/// Absolute, symlink-free form of `path` even when its tail does not exist
/// yet: the deepest existing ancestor is canonicalized and the rest appended.
pub fn canonical_lenient(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(base) => {
                return Ok(tail.iter().rev().fold(base, |acc, part| acc.join(part)));
            }
            Err(e) => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(e);
                };
                tail.push(name.to_os_string());
                existing = parent;
            }
        }
    }
}

/// Refuse a backup whose destination sits on one of the roots it walks.
/// Otherwise the set directory and its key would be swept into the backup.
pub fn guard_backup_root(backup_root: &Path, roots: &[PathBuf]) -> Result<()> {
    let target = canonical_lenient(backup_root)?;
    for root in roots {
        let root_real = root.canonicalize()?;
        if target.starts_with(&root_real) {
            return Err(WipeError::BackupInsideDevice(target, root.clone()));
        }
    }
    Ok(())
}

/// Stable identifier for a mount root, used as the top directory of its
/// files inside a backup set.
///
/// `E:\` -> `E`, `\\?\Volume{GUID}\` -> `VOL_GUID`, anything else
/// `MNT_` plus 8 hex digits of a BLAKE3 digest of the path.
pub fn mount_id(root: &Path) -> String {
    let text = root.to_string_lossy();
    if let Some(caps) = DRIVE_ROOT.captures(&text) {
        return caps[1].to_uppercase();
    }
    if let Some(caps) = VOLUME_GUID_ROOT.captures(&text) {
        return format!("VOL_{}", &caps[1]);
    }
    let digest = blake3::hash(text.as_bytes());
    format!("MNT_{}", &digest.to_hex()[..8].to_uppercase())
}
