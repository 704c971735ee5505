use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::device::{BusType, Device, DeviceResolver};

const MOUNTS_PATH: &str = "/proc/self/mounts";

/// Sector size the kernel reports `size` in.
const SYSFS_SECTOR: u64 = 512;

/// Block devices from udev, mount roots from the kernel mount table.
pub struct LinuxResolver;

impl DeviceResolver for LinuxResolver {
    fn list_devices(&self) -> Result<Vec<Device>> {
        let mounts = read_mounts().unwrap_or_else(|e| {
            debug!(error = %e, "Mount table unavailable");
            Vec::new()
        });

        let mut enumerator = udev::Enumerator::new().context("udev enumerator")?;
        enumerator.match_subsystem("block")?;
        enumerator.match_property("DEVTYPE", "disk")?;

        let mut devices = Vec::new();
        for (index, dev) in enumerator.scan_devices()?.enumerate() {
            let Some(node) = dev.devnode().map(Path::to_path_buf) else {
                continue;
            };
            let name = dev.sysname().to_string_lossy().into_owned();
            if name.starts_with("loop") || name.starts_with("ram") {
                continue;
            }

            let text = |key: &str| {
                dev.property_value(key)
                    .map(|v| v.to_string_lossy().replace('_', " "))
                    .unwrap_or_default()
            };
            let sectors: u64 = dev
                .attribute_value("size")
                .and_then(|v| v.to_str())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            let removable = dev
                .attribute_value("removable")
                .map(|v| v == "1")
                .unwrap_or(false);

            let mount_roots = mounts
                .iter()
                .filter(|(source, _)| belongs_to(source, &node))
                .map(|(_, target)| target.clone())
                .collect();

            devices.push(Device {
                index: index as u32,
                name,
                model: text("ID_MODEL"),
                serial: text("ID_SERIAL_SHORT"),
                path: node,
                size: sectors * SYSFS_SECTOR,
                bus: BusType::parse(&text("ID_BUS")),
                removable,
                mount_roots,
            });
        }

        Ok(devices)
    }

    /// Same filesystem as `/`. Unreadable paths count as protected.
    fn is_system_volume(&self, path: &Path) -> bool {
        match (fs::metadata("/"), fs::metadata(path)) {
            (Ok(root), Ok(target)) => root.dev() == target.dev(),
            _ => true,
        }
    }
}

/// `(source device, mount point)` pairs for every mount backed by `/dev`.
fn read_mounts() -> Result<Vec<(PathBuf, PathBuf)>> {
    let table = fs::read_to_string(MOUNTS_PATH).context("reading mount table")?;
    Ok(parse_mounts(&table))
}

fn parse_mounts(table: &str) -> Vec<(PathBuf, PathBuf)> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape(fields.next()?);
            let target = unescape(fields.next()?);
            if !source.starts_with("/dev/") {
                return None;
            }
            let source = fs::canonicalize(&source).unwrap_or_else(|_| PathBuf::from(&source));
            Some((source, PathBuf::from(target)))
        })
        .collect()
}

/// The mount table escapes space, tab, newline and backslash as `\ooo`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                out.push(digits.iter().fold(0u8, |acc, d| acc.wrapping_mul(8) + (d - b'0')));
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `/dev/sdb1` and `/dev/nvme0n1p2` belong to `/dev/sdb` and `/dev/nvme0n1`.
fn belongs_to(source: &Path, disk: &Path) -> bool {
    if source == disk {
        return true;
    }
    let (Some(src), Some(disk)) = (source.to_str(), disk.to_str()) else {
        return false;
    };
    let Some(rest) = src.strip_prefix(disk) else {
        return false;
    };
    let rest = rest.strip_prefix('p').unwrap_or(rest);
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_map_to_disks() {
        assert!(belongs_to(Path::new("/dev/sdb1"), Path::new("/dev/sdb")));
        assert!(belongs_to(Path::new("/dev/nvme0n1p2"), Path::new("/dev/nvme0n1")));
        assert!(belongs_to(Path::new("/dev/sdb"), Path::new("/dev/sdb")));
        assert!(!belongs_to(Path::new("/dev/sdba1"), Path::new("/dev/sdb")));
        assert!(!belongs_to(Path::new("/dev/sdc1"), Path::new("/dev/sdb")));
    }

    #[test]
    fn mount_table_escapes() {
        assert_eq!(unescape("/media/me/MY\\040STICK"), "/media/me/MY STICK");
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(unescape("trail\\04"), "trail\\04");
    }

    #[test]
    fn only_device_backed_mounts_are_kept() {
        let table = "proc /proc proc rw 0 0\n/dev/sdz1 /media/x\\040y vfat rw 0 0\n";
        let mounts = parse_mounts(table);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].1, PathBuf::from("/media/x y"));
    }

    #[test]
    fn root_is_system_volume() {
        assert!(LinuxResolver.is_system_volume(Path::new("/")));
    }
}
