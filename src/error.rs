//! Error taxonomy for wipe, backup and restore operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, WipeError>;

/// Errors raised by the wipe engines.
///
/// Some variants abort a whole job (system volume, bad key, nothing to do),
/// others only fail one unit (a file or a region) and are folded into the
/// job's failure counters. See [`WipeError::is_unit_level`].
#[derive(Error, Debug)]
pub enum WipeError {
    /// The device resolved, but none of its volumes can be walked.
    #[error("No accessible volumes found for device '{0}'")]
    NoAccessibleVolume(String),

    /// A resolved root is the operating system volume.
    #[error("Refusing to operate on system volume: {}", .0.display())]
    SystemVolumeRefused(PathBuf),

    /// Key is not 32 bytes of hex.
    #[error("Invalid decryption key: {0}")]
    InvalidKey(String),

    /// No backup set exists for the device label.
    #[error("No backup found for '{0}'")]
    NoBackupFound(String),

    /// Opening a raw device for exclusive writing was denied.
    #[error("Access denied opening raw device {}. Run the daemon with administrator privileges.", .0.display())]
    AccessDenied(PathBuf),

    /// A container's authentication tag did not verify.
    #[error("Authentication failed for {}", .0.display())]
    AuthenticationFailed(PathBuf),

    /// Container header is truncated or carries an unknown format tag.
    #[error("Unsupported backup format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// No device matched the label.
    #[error("No mounted or raw device found for '{0}'")]
    DeviceNotFound(String),

    /// The platform resolver itself failed (udev, mount table).
    #[error("Device enumeration failed: {0}")]
    Resolver(String),

    /// Device matched but reports no usable size.
    #[error("Unable to determine size of device '{0}'")]
    UnknownDeviceSize(String),

    /// The backup directory lives on the device being backed up.
    #[error("Backup directory {} is inside volume {} of the device being backed up", .0.display(), .1.display())]
    BackupInsideDevice(PathBuf, PathBuf),

    /// Another job is still running against the same device.
    #[error("Device {} already has a job running", .0.display())]
    DeviceBusy(PathBuf),

    /// A walk finished without a single unit succeeding.
    #[error("{0}")]
    NothingProcessed(String),

    /// The job's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WipeError {
    /// Per-unit failures are counted and logged; everything else ends the job.
    pub fn is_unit_level(&self) -> bool {
        matches!(
            self,
            WipeError::AuthenticationFailed(_) | WipeError::UnsupportedFormat(_) | WipeError::Io(_)
        )
    }
}
