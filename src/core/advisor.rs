//! Wipe-method recommendation for a device label.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::core::device::{BusType, Device, DeviceResolver};
use crate::core::volume::resolve_device;

/// Label fragments that mark removable flash media.
const REMOVABLE_HINTS: &[&str] = &[
    "usb",
    "pen drive",
    "pendrive",
    "flash",
    "stick",
    "removable",
    "thumb",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WipeMethod {
    #[serde(rename = "boom-wipe")]
    BoomWipe,
    #[serde(rename = "dod")]
    Dod,
}

impl fmt::Display for WipeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WipeMethod::BoomWipe => write!(f, "boom-wipe"),
            WipeMethod::Dod => write!(f, "dod"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Removable,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WipeAdvice {
    pub method: WipeMethod,
    pub device_type: DeviceClass,
    pub reason: String,
}

fn label_hint(label: &str) -> Option<&'static str> {
    let lower = label.to_lowercase();
    REMOVABLE_HINTS.iter().copied().find(|h| lower.contains(h))
}

/// Decide from the label alone, falling back to the resolved device's bus.
pub fn advise(label: &str, device: Option<&Device>) -> WipeAdvice {
    let removable = if let Some(hint) = label_hint(label) {
        Some(format!("label mentions '{}'", hint))
    } else {
        device.filter(|d| d.is_removable()).map(|d| {
            if d.bus == BusType::Usb {
                "device is on the USB bus".to_string()
            } else {
                "device is flagged removable".to_string()
            }
        })
    };

    match removable {
        Some(why) => WipeAdvice {
            method: WipeMethod::BoomWipe,
            device_type: DeviceClass::Removable,
            reason: format!("Recommended boom-wipe for removable storage: {}", why),
        },
        None => WipeAdvice {
            method: WipeMethod::Dod,
            device_type: DeviceClass::Fixed,
            reason: "Recommended dod for fixed storage".to_string(),
        },
    }
}

/// Like [`advise`], resolving the device only when the label is not enough.
/// Resolution failures fall through to the fixed-storage default.
pub async fn recommend(resolver: &Arc<dyn DeviceResolver>, label: &str) -> WipeAdvice {
    if label_hint(label).is_some() {
        return advise(label, None);
    }
    match resolve_device(resolver, label).await {
        Ok(device) => advise(label, Some(&device)),
        Err(e) => {
            debug!(device = %label, error = %e, "Advisory without device facts");
            advise(label, None)
        }
    }
}
