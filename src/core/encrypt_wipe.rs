//! Cryptographic erasure in place.
//!
//! Every file on the device is overwritten with its own AES-CTR ciphertext
//! under a single key that only ever lives in memory. Once the key is
//! dropped the data is unrecoverable. A device with no walkable volume is
//! overwritten raw instead.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::device::DeviceResolver;
use crate::core::overwriter::{StreamCipherOverwriter, generate_key};
use crate::core::registry::{JobHandle, JobStatus};
use crate::core::run_blocking;
use crate::core::volume::{accessible_roots, resolve_device, scan_files};
use crate::error::{Result, WipeError};

#[derive(Debug, Clone, Default)]
pub struct EncryptWipeSummary {
    pub processed: u64,
    pub failed: u64,
    pub bytes: u64,
    /// Set when the raw device was overwritten instead of its files.
    pub raw_device: Option<PathBuf>,
}

impl EncryptWipeSummary {
    pub fn message(&self) -> String {
        match &self.raw_device {
            Some(path) => format!("Raw device {} encrypted in place ({} bytes)", path.display(), self.bytes),
            None if self.failed > 0 => format!(
                "Encrypted {} files in place, {} failed",
                self.processed, self.failed
            ),
            None => format!("Encrypted {} files in place", self.processed),
        }
    }
}

pub struct EncryptWipeEngine {
    resolver: Arc<dyn DeviceResolver>,
    overwriter: StreamCipherOverwriter,
}

impl EncryptWipeEngine {
    pub fn new(resolver: Arc<dyn DeviceResolver>, chunk_size: usize) -> Self {
        Self {
            resolver,
            overwriter: StreamCipherOverwriter::new(chunk_size),
        }
    }

    pub async fn encrypt_and_wipe(
        &self,
        label: &str,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<EncryptWipeSummary> {
        let device = resolve_device(&self.resolver, label).await?;
        let roots = accessible_roots(self.resolver.as_ref(), &device)?;
        let key = Arc::new(generate_key());

        if roots.is_empty() {
            if device.size == 0 {
                return Err(WipeError::UnknownDeviceSize(label.to_string()));
            }
            info!(device = %label, path = %device.path.display(), bytes = device.size, "No mounted volume, encrypting raw device");
            job.begin(JobStatus::Wiping, 1).await;

            let overwriter = self.overwriter.clone();
            let path = device.path.clone();
            let size = device.size;
            let token = cancel.clone();
            let bytes =
                run_blocking(move || overwriter.overwrite_device(&path, size, &key, &token)).await?;
            job.record_success().await;

            return Ok(EncryptWipeSummary {
                processed: 1,
                failed: 0,
                bytes,
                raw_device: Some(device.path),
            });
        }

        let files = run_blocking(move || {
            Ok(roots.iter().flat_map(|r| scan_files(r)).collect::<Vec<_>>())
        })
        .await?;
        info!(device = %label, files = files.len(), "Encrypting files in place");
        job.begin(JobStatus::Wiping, files.len() as u64).await;

        let mut summary = EncryptWipeSummary::default();
        for file in &files {
            if cancel.is_cancelled() {
                return Err(WipeError::Cancelled);
            }

            let overwriter = self.overwriter.clone();
            let path = file.path.clone();
            let key = Arc::clone(&key);
            let token = cancel.clone();
            match run_blocking(move || overwriter.overwrite_file(&path, &key, &token)).await {
                Ok(report) => {
                    summary.processed += 1;
                    summary.bytes += report.bytes_processed;
                    job.record_success().await;
                }
                Err(WipeError::Cancelled) => return Err(WipeError::Cancelled),
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to encrypt file in place");
                    summary.failed += 1;
                    job.record_failure(None).await;
                }
            }
        }

        if summary.processed == 0 && summary.failed > 0 {
            return Err(WipeError::NothingProcessed(format!(
                "No files could be encrypted on '{}'",
                label
            )));
        }

        info!(
            device = %label,
            processed = summary.processed,
            failed = summary.failed,
            bytes = summary.bytes,
            "In-place encryption finished"
        );
        Ok(summary)
    }
}
