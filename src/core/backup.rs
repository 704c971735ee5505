//! Encrypt-and-relocate backups and their restore.
//!
//! A backup moves every file on a device into an authenticated container
//! under a fresh backup set, deleting each source only once its container is
//! durable. Restore decrypts the newest set for a label onto the device's
//! first writable volume.

pub mod codec;
pub mod layout;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::core::device::DeviceResolver;
use crate::core::overwriter::{KEY_LEN, generate_key};
use crate::core::registry::{JobHandle, JobStatus};
use crate::core::run_blocking;
use crate::core::volume::{
    accessible_roots, guard_backup_root, mount_id, resolve_device, scan_files,
};
use crate::error::{Result, WipeError};

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub encrypted: u64,
    pub deleted: u64,
    pub failed: u64,
    pub set_dir: PathBuf,
    /// `None` when the key went out through the job record instead.
    pub key_artifact: Option<PathBuf>,
}

impl BackupSummary {
    pub fn message(&self) -> String {
        let mut msg = format!(
            "Encrypted {} files, deleted {} originals into {}",
            self.encrypted,
            self.deleted,
            self.set_dir.display()
        );
        if self.failed > 0 {
            msg.push_str(&format!(", {} failed", self.failed));
        }
        match &self.key_artifact {
            Some(path) => msg.push_str(&format!(". Key saved to {}", path.display())),
            None => msg.push_str(". Key returned with the job record"),
        }
        msg
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub restored: u64,
    pub failed: u64,
    pub set_dir: PathBuf,
    pub target_root: PathBuf,
}

impl RestoreSummary {
    pub fn message(&self) -> String {
        let mut msg = format!(
            "Restored {} files from {} to {}",
            self.restored,
            self.set_dir.display(),
            self.target_root.display()
        );
        if self.failed > 0 {
            msg.push_str(&format!(", {} failed", self.failed));
        }
        msg
    }
}

/// Decode a 64-digit hex key. Anything that is not exactly 32 bytes is
/// rejected.
pub fn parse_key_hex(key_hex: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(
        hex::decode(key_hex.trim()).map_err(|e| WipeError::InvalidKey(e.to_string()))?,
    );
    if bytes.len() != KEY_LEN {
        return Err(WipeError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

pub struct BackupEngine {
    resolver: Arc<dyn DeviceResolver>,
    backup_root: PathBuf,
    chunk_size: usize,
    persist_key: bool,
}

impl BackupEngine {
    pub fn new(
        resolver: Arc<dyn DeviceResolver>,
        backup_root: impl Into<PathBuf>,
        chunk_size: usize,
        persist_key: bool,
    ) -> Self {
        Self {
            resolver,
            backup_root: backup_root.into(),
            chunk_size,
            persist_key,
        }
    }

    /// Move every file on `label` into a new backup set.
    pub async fn encrypt_backup_and_wipe(
        &self,
        label: &str,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<BackupSummary> {
        let device = resolve_device(&self.resolver, label).await?;
        let roots = accessible_roots(self.resolver.as_ref(), &device)?;
        if roots.is_empty() {
            return Err(WipeError::NoAccessibleVolume(label.to_string()));
        }
        guard_backup_root(&self.backup_root, &roots)?;

        let key = Arc::new(generate_key());
        let key_hex = Zeroizing::new(hex::encode(&key[..]));

        let set_dir = layout::create_set(&self.backup_root, label)?;
        let key_artifact = if self.persist_key {
            Some(layout::write_key_artifact(&set_dir, &key_hex)?)
        } else {
            job.set_key_hex(key_hex.to_string()).await;
            None
        };
        drop(key_hex);

        let files = run_blocking(move || {
            Ok(roots
                .iter()
                .flat_map(|root| {
                    let id = mount_id(root);
                    scan_files(root).into_iter().map(move |f| (id.clone(), f))
                })
                .collect::<Vec<_>>())
        })
        .await?;

        info!(
            device = %label,
            files = files.len(),
            set = %set_dir.display(),
            "Starting encrypted backup"
        );
        job.begin(JobStatus::Wiping, files.len() as u64).await;

        let mut summary = BackupSummary {
            encrypted: 0,
            deleted: 0,
            failed: 0,
            set_dir,
            key_artifact,
        };

        for (id, file) in files {
            if cancel.is_cancelled() {
                return Err(WipeError::Cancelled);
            }

            let src = file.path.clone();
            let dst = layout::container_path(&summary.set_dir, &id, &file.relative);
            let key = Arc::clone(&key);
            let chunk_size = self.chunk_size;

            let result = run_blocking(move || {
                if let Err(e) = codec::encrypt_file(&src, &dst, &key, chunk_size) {
                    let _ = fs::remove_file(&dst);
                    return Err(e);
                }
                Ok(match fs::remove_file(&src) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(path = %src.display(), error = %e, "Encrypted but could not delete original");
                        false
                    }
                })
            })
            .await;

            match result {
                Ok(deleted) => {
                    summary.encrypted += 1;
                    if deleted {
                        summary.deleted += 1;
                    }
                    debug!(path = %file.path.display(), bytes = file.size, "File encrypted");
                    job.record_success().await;
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to encrypt file");
                    summary.failed += 1;
                    job.record_failure(None).await;
                }
            }
        }

        if summary.encrypted == 0 {
            let _ = fs::remove_dir_all(&summary.set_dir);
            return Err(WipeError::NothingProcessed(format!(
                "No files were encrypted on '{}'",
                label
            )));
        }

        info!(
            device = %label,
            encrypted = summary.encrypted,
            deleted = summary.deleted,
            failed = summary.failed,
            "Encrypted backup finished"
        );
        Ok(summary)
    }

    /// Restore the newest backup set for `label` with `key_hex`.
    pub async fn decrypt_and_restore(
        &self,
        label: &str,
        key_hex: &str,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<RestoreSummary> {
        let root = self.backup_root.clone();
        let query = label.to_string();
        let set_dir = run_blocking(move || Ok(layout::find_latest_set(&root, &query)))
            .await?
            .ok_or_else(|| WipeError::NoBackupFound(label.to_string()))?;

        let key = Arc::new(parse_key_hex(key_hex)?);

        let device = resolve_device(&self.resolver, label).await?;
        let target_root = device
            .mount_roots
            .iter()
            .find(|r| !self.resolver.is_system_volume(r) && r.is_dir())
            .cloned()
            .ok_or_else(|| WipeError::NoAccessibleVolume(label.to_string()))?;

        let scan_dir = set_dir.clone();
        let containers = run_blocking(move || Ok(layout::list_containers(&scan_dir))).await?;

        info!(
            device = %label,
            set = %set_dir.display(),
            containers = containers.len(),
            target = %target_root.display(),
            "Starting restore"
        );
        job.begin(JobStatus::Restoring, containers.len() as u64).await;

        let mut summary = RestoreSummary {
            restored: 0,
            failed: 0,
            set_dir,
            target_root,
        };

        for container in containers {
            if cancel.is_cancelled() {
                return Err(WipeError::Cancelled);
            }

            let Some(relative) = layout::original_relative(&summary.set_dir, &container) else {
                warn!(path = %container.display(), "Container path cannot be mapped back");
                summary.failed += 1;
                job.record_failure(None).await;
                continue;
            };

            let dst = summary.target_root.join(&relative);
            let src = container.clone();
            let key = Arc::clone(&key);
            let chunk_size = self.chunk_size;

            match run_blocking(move || codec::decrypt_file(&src, &dst, &key, chunk_size)).await {
                Ok(bytes) => {
                    debug!(path = %relative.display(), bytes, "File restored");
                    summary.restored += 1;
                    job.record_success().await;
                }
                Err(e) => {
                    warn!(path = %container.display(), error = %e, "Failed to restore file");
                    summary.failed += 1;
                    job.record_failure(None).await;
                }
            }
        }

        if summary.restored == 0 {
            return Err(WipeError::NothingProcessed(format!(
                "No files were restored from {}",
                summary.set_dir.display()
            )));
        }

        info!(
            device = %label,
            restored = summary.restored,
            failed = summary.failed,
            "Restore finished"
        );
        Ok(summary)
    }
}
