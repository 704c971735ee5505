//! On-disk layout of backup sets.
//!
//! ```text
//! <backup_root>/<slug>_<YYYYMMDD-HHMMSS>/
//!     decryption_key.txt
//!     <mount-id>/<relative path>.enc
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use super::codec::CONTAINER_SUFFIX;
use crate::error::Result;

pub const KEY_ARTIFACT_NAME: &str = "decryption_key.txt";

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Filesystem-safe form of a device label: whitespace runs become `_`,
/// anything else outside `[A-Za-z0-9_.-]` becomes `-`.
pub fn slugify(label: &str) -> String {
    let spaced = WHITESPACE.replace_all(label.trim(), "_");
    let slug = UNSAFE_CHARS.replace_all(&spaced, "-").into_owned();
    if slug.is_empty() {
        "device".to_string()
    } else {
        slug
    }
}

pub fn set_dir_name(label: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", slugify(label), at.format("%Y%m%d-%H%M%S"))
}

/// Create a fresh set directory under `backup_root`. Two backups of the same
/// label within one second get a numeric suffix.
pub fn create_set(backup_root: &Path, label: &str) -> Result<PathBuf> {
    fs::create_dir_all(backup_root)?;
    let base = set_dir_name(label, Local::now());

    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{}-{}", base, attempt)
        };
        let dir = backup_root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write the hex key as a single line, readable by the owner only.
pub fn write_key_artifact(set_dir: &Path, key_hex: &str) -> Result<PathBuf> {
    let path = set_dir.join(KEY_ARTIFACT_NAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    writeln!(file, "{}", key_hex)?;
    file.sync_all()?;
    Ok(path)
}

/// `<set>/<mount-id>/<relative>.enc`
pub fn container_path(set_dir: &Path, mount_id: &str, relative: &Path) -> PathBuf {
    let mut path = set_dir.join(mount_id).join(relative).into_os_string();
    path.push(CONTAINER_SUFFIX);
    PathBuf::from(path)
}

/// Invert [`container_path`]: drop the mount-id segment and the suffix.
///
/// `None` for anything that is not a container or whose path would escape
/// the restore root.
pub fn original_relative(set_dir: &Path, container: &Path) -> Option<PathBuf> {
    let inside = container.strip_prefix(set_dir).ok()?;
    let mut components = inside.components();

    match components.next()? {
        Component::Normal(_) => {}
        _ => return None,
    }

    let rest = components.as_path();
    if rest.as_os_str().is_empty()
        || !rest.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }

    let name = rest.file_name()?.to_str()?;
    let stem = name.strip_suffix(CONTAINER_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(rest.with_file_name(stem))
}

/// Every container file under a set, in walk order.
pub fn list_containers(set_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(set_dir)
        .min_depth(2)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(CONTAINER_SUFFIX))
        .map(|e| e.into_path())
        .collect()
}

/// Most recently modified set for `label`, if any.
pub fn find_latest_set(backup_root: &Path, label: &str) -> Option<PathBuf> {
    let pattern = Regex::new(&format!(
        r"^{}_\d{{8}}-\d{{6}}(-\d+)?$",
        regex::escape(&slugify(label))
    ))
    .ok()?;

    let entries = match fs::read_dir(backup_root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %backup_root.display(), error = %e, "Backup directory not readable");
            return None;
        }
    };

    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| pattern.is_match(&e.file_name().to_string_lossy()))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}
