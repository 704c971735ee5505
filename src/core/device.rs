//! Device facts and the label-matching heuristics used to find them.
//!
//! OS enumeration lives behind [`DeviceResolver`]; everything else here is
//! pure and works on plain [`Device`] snapshots.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Minimum slack for size matching, so tiny labels still match something.
const SIZE_MATCH_FLOOR: u64 = 1024 * 1024;

/// Allowed relative deviation between a label's size and a device's size.
const SIZE_MATCH_TOLERANCE: f64 = 0.15;

static TRAILING_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(.*?\)\s*$").expect("static regex"));
static TRAILING_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)\s*$").expect("static regex"));
static SIZE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([0-9]+(?:\.[0-9]+)?)\s*([KMGTP]?i?B)").expect("static regex")
});

/// Bus a device hangs off. Only the USB/fixed split drives decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    Usb,
    Sata,
    Nvme,
    Scsi,
    Virtual,
    Unknown,
}

impl BusType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "usb" => Self::Usb,
            "ata" | "sata" => Self::Sata,
            "nvme" => Self::Nvme,
            "scsi" | "sas" => Self::Scsi,
            "virtual" | "virtio" | "file backed virtual" => Self::Virtual,
            _ => Self::Unknown,
        }
    }
}

/// Snapshot of one block device. Fetched per operation, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub model: String,
    pub serial: String,
    /// Raw device node, e.g. `/dev/sdb`.
    pub path: PathBuf,
    pub size: u64,
    pub bus: BusType,
    pub removable: bool,
    pub mount_roots: Vec<PathBuf>,
}

impl Device {
    /// USB or flagged removable by the kernel.
    pub fn is_removable(&self) -> bool {
        self.removable || self.bus == BusType::Usb
    }
}

/// Source of device facts. Implemented per platform in `crate::adapters`.
pub trait DeviceResolver: Send + Sync {
    /// List all block devices currently attached.
    fn list_devices(&self) -> anyhow::Result<Vec<Device>>;

    /// Whether `path` lives on the volume hosting the operating system.
    fn is_system_volume(&self, path: &Path) -> bool;

    /// Find the device a human label refers to.
    fn resolve(&self, label: &str) -> anyhow::Result<Option<Device>> {
        let devices = self.list_devices()?;
        Ok(match_by_size_or_name(label, &devices).cloned())
    }
}

/// How strongly a device matched a label. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchScore {
    /// Size parsed from the label is within tolerance.
    Size,
    /// Label with its size suffix removed is a substring of name/model/serial.
    NormalizedSubstring,
    /// The full label is a substring of name/model/serial.
    ExactSubstring,
    /// The label is the device node path itself.
    DevicePath,
}

/// Score a single device against a label, or `None` when it does not match.
pub fn score_device(label: &str, device: &Device) -> Option<MatchScore> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }

    if Path::new(trimmed) == device.path {
        return Some(MatchScore::DevicePath);
    }

    let fields = [
        device.name.to_lowercase(),
        device.model.to_lowercase(),
        device.serial.to_lowercase(),
    ];
    let contains = |needle: &str| {
        !needle.is_empty() && fields.iter().any(|f| !f.is_empty() && f.contains(needle))
    };

    if contains(&trimmed.to_lowercase()) {
        return Some(MatchScore::ExactSubstring);
    }
    if contains(&sanitize_label(trimmed).to_lowercase()) {
        return Some(MatchScore::NormalizedSubstring);
    }

    let target = parse_size_from_label(trimmed);
    if target > 0 && device.size > 0 && device.size.abs_diff(target) <= size_tolerance(target) {
        return Some(MatchScore::Size);
    }

    None
}

/// Pick the best device for a label: exact substring beats normalized
/// substring beats size. Among size matches the closest size wins; other
/// ties go to the first device listed.
pub fn match_by_size_or_name<'a>(label: &str, devices: &'a [Device]) -> Option<&'a Device> {
    let target = parse_size_from_label(label);

    devices
        .iter()
        .filter_map(|d| score_device(label, d).map(|s| (s, d)))
        .min_by(|(sa, da), (sb, db)| {
            sb.cmp(sa).then_with(|| {
                if *sa == MatchScore::Size {
                    da.size.abs_diff(target).cmp(&db.size.abs_diff(target))
                } else {
                    std::cmp::Ordering::Equal
                }
            })
        })
        .map(|(_, d)| d)
}

fn size_tolerance(target: u64) -> u64 {
    ((target as f64 * SIZE_MATCH_TOLERANCE) as u64).max(SIZE_MATCH_FLOOR)
}

/// Strip a trailing size annotation: `"hp v220w (14.9GB)"` -> `"hp v220w"`.
pub fn sanitize_label(label: &str) -> String {
    TRAILING_PAREN.replace(label, "").trim().to_string()
}

/// Parse a trailing `(14.9 GB)` style size into bytes, or 0 if absent.
///
/// `KB/MB/GB/TB/PB` are decimal, `KiB/MiB/...` binary.
pub fn parse_size_from_label(label: &str) -> u64 {
    let Some(inner) = TRAILING_SIZE.captures(label).and_then(|c| c.get(1)) else {
        return 0;
    };
    let Some(caps) = SIZE_VALUE.captures(inner.as_str().trim()) else {
        return 0;
    };

    let value: f64 = match caps[1].parse() {
        Ok(v) => v,
        Err(_) => return 0,
    };
    let multiplier: u64 = match caps[2].to_uppercase().as_str() {
        "B" => 1,
        "KB" => 1000,
        "MB" => 1000u64.pow(2),
        "GB" => 1000u64.pow(3),
        "TB" => 1000u64.pow(4),
        "PB" => 1000u64.pow(5),
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        "PIB" => 1 << 50,
        _ => return 0,
    };

    (value * multiplier as f64) as u64
}

/// Format a byte count with binary steps: `1536` -> `"1.5 KB"`.
pub fn human_readable_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} PB", size * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: u32, name: &str, size: u64, bus: BusType) -> Device {
        Device {
            index,
            name: name.to_string(),
            model: String::new(),
            serial: String::new(),
            path: PathBuf::from(format!("/dev/sd{}", (b'a' + index as u8) as char)),
            size,
            bus,
            removable: false,
            mount_roots: Vec::new(),
        }
    }

    #[test]
    fn sanitize_strips_trailing_size() {
        assert_eq!(sanitize_label("hp v220w (14.9GB)"), "hp v220w");
        assert_eq!(sanitize_label("plain"), "plain");
    }

    #[test]
    fn parses_decimal_and_binary_units() {
        assert_eq!(parse_size_from_label("TESTUSB (8GB)"), 8_000_000_000);
        assert_eq!(parse_size_from_label("stick (16 GiB)"), 16 * (1 << 30));
        assert_eq!(parse_size_from_label("x (14.9 GB)"), 14_900_000_000);
        assert_eq!(parse_size_from_label("no size here"), 0);
        assert_eq!(parse_size_from_label("bad (lots)"), 0);
    }

    #[test]
    fn exact_substring_beats_size() {
        let devices = vec![
            device(0, "Generic Flash", 8 * (1 << 30), BusType::Usb),
            device(1, "Kingston DataTraveler", 32 * (1 << 30), BusType::Usb),
        ];
        let found = match_by_size_or_name("kingston (8GB)", &devices).unwrap();
        assert_eq!(found.index, 1);
    }

    #[test]
    fn size_fallback_picks_closest() {
        let devices = vec![
            device(0, "Disk A", 8_900_000_000, BusType::Usb),
            device(1, "Disk B", 8_100_000_000, BusType::Usb),
        ];
        let found = match_by_size_or_name("TESTUSB (8GB)", &devices).unwrap();
        assert_eq!(found.index, 1);
    }

    #[test]
    fn size_outside_tolerance_does_not_match() {
        let devices = vec![device(0, "Big Disk", 64 * (1 << 30), BusType::Sata)];
        assert!(match_by_size_or_name("TESTUSB (8GB)", &devices).is_none());
    }

    #[test]
    fn device_path_label_matches() {
        let devices = vec![device(0, "Disk", 1, BusType::Sata), device(1, "Disk", 1, BusType::Usb)];
        let found = match_by_size_or_name("/dev/sdb", &devices).unwrap();
        assert_eq!(found.index, 1);
    }

    #[test]
    fn empty_label_matches_nothing() {
        let devices = vec![device(0, "Disk", 1, BusType::Sata)];
        assert!(match_by_size_or_name("  ", &devices).is_none());
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_readable_size(512), "512.0 B");
        assert_eq!(human_readable_size(1536), "1.5 KB");
        assert_eq!(human_readable_size(8 * (1 << 30)), "8.0 GB");
    }

    #[test]
    fn bus_type_parsing() {
        assert_eq!(BusType::parse("USB"), BusType::Usb);
        assert_eq!(BusType::parse("ata"), BusType::Sata);
        assert_eq!(BusType::parse("weird"), BusType::Unknown);
    }
}
