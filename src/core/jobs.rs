//! Job execution: turns a request into a registry record and a background
//! task running the matching engine.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use zeroize::Zeroizing;

use crate::config::WipeProfile;
use crate::context::AppContext;
use crate::core::backup::BackupEngine;
use crate::core::bomb::{DeviceBomb, FileBomb};
use crate::core::encrypt_wipe::EncryptWipeEngine;
use crate::core::overwriter::open_device_exclusive;
use crate::core::registry::{DeviceLease, JobHandle, JobKind, JobStatus, WipeJob};
use crate::core::run_blocking;
use crate::core::scheduler::{RegionBombScheduler, partition};
use crate::core::volume::{accessible_roots, guard_roots, resolve_device, scan_files};
use crate::error::{Result, WipeError};

/// Something a caller asked the daemon to do to a device.
pub enum JobRequest {
    /// Destroy every file on the device's volumes.
    BoomWipe { device: String },
    /// Overwrite the raw device region by region. `quick` uses the quick
    /// pass count.
    PendriveWipe { device: String, quick: bool },
    EncryptWipe { device: String },
    EncryptBackup { device: String },
    Restore {
        device: String,
        key_hex: Zeroizing<String>,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::BoomWipe { .. } => JobKind::BoomWipe,
            JobRequest::PendriveWipe { quick: false, .. } => JobKind::PendriveWipe,
            JobRequest::PendriveWipe { quick: true, .. } => JobKind::QuickWipe,
            JobRequest::EncryptWipe { .. } => JobKind::EncryptWipe,
            JobRequest::EncryptBackup { .. } => JobKind::EncryptBackup,
            JobRequest::Restore { .. } => JobKind::Restore,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            JobRequest::BoomWipe { device }
            | JobRequest::PendriveWipe { device, .. }
            | JobRequest::EncryptWipe { device }
            | JobRequest::EncryptBackup { device }
            | JobRequest::Restore { device, .. } => device,
        }
    }
}

/// Starts and runs jobs against the shared context.
#[derive(Clone)]
pub struct WipeService {
    ctx: AppContext,
}

impl WipeService {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Register the job and run it in the background. Returns the job id
    /// immediately. A device that already has a running job is refused and
    /// the new job fails straight away.
    pub async fn start(&self, request: JobRequest) -> String {
        let handle = self.ctx.registry.create(request.kind(), request.device()).await;
        let job_id = handle.id().to_string();
        let span = info_span!("job", job_id = %job_id, kind = ?request.kind(), device = %request.device());

        let lease = match self.lease(request.device()).instrument(span.clone()).await {
            Ok(lease) => lease,
            Err(e) => {
                span.in_scope(|| warn!(error = %e, "Job refused"));
                handle.fail(e.to_string()).await;
                return job_id;
            }
        };

        let service = self.clone();
        tokio::spawn(
            async move {
                service.execute(request, handle).await;
                drop(lease);
            }
            .instrument(span),
        );

        job_id
    }

    /// Register and run the job on the current task, returning its final
    /// record (including a pending backup key).
    pub async fn run(&self, request: JobRequest) -> Option<WipeJob> {
        let handle = self.ctx.registry.create(request.kind(), request.device()).await;
        let job_id = handle.id().to_string();
        match self.lease(request.device()).await {
            Ok(_lease) => self.execute(request, handle).await,
            Err(e) => handle.fail(e.to_string()).await,
        }
        self.ctx.registry.take(&job_id).await
    }

    /// Claim the device behind `label` for one job. Labels that do not
    /// resolve are keyed by the label itself and fail later in the engine.
    async fn lease(&self, label: &str) -> Result<DeviceLease> {
        let key = match resolve_device(&self.ctx.resolver, label).await {
            Ok(device) => device.path,
            Err(_) => PathBuf::from(label),
        };
        self.ctx
            .registry
            .lease_device(key.clone())
            .ok_or(WipeError::DeviceBusy(key))
    }

    async fn execute(&self, request: JobRequest, handle: JobHandle) {
        let quick = matches!(request, JobRequest::PendriveWipe { quick: true, .. });
        let profile = self.ctx.config.wipe.profile(quick);
        let cancel = self.ctx.shutdown.child_token();

        info!("Job started");
        let result = match &request {
            JobRequest::BoomWipe { device } => self.boom_wipe(device, &profile, &handle, &cancel).await,
            JobRequest::PendriveWipe { device, .. } => {
                self.device_wipe(device, &profile, &handle, &cancel).await
            }
            JobRequest::EncryptWipe { device } => {
                EncryptWipeEngine::new(Arc::clone(&self.ctx.resolver), profile.chunk_size)
                    .encrypt_and_wipe(device, &handle, &cancel)
                    .await
                    .map(|s| s.message())
            }
            JobRequest::EncryptBackup { device } => self
                .backup_engine(&profile)
                .encrypt_backup_and_wipe(device, &handle, &cancel)
                .await
                .map(|s| s.message()),
            JobRequest::Restore { device, key_hex } => self
                .backup_engine(&profile)
                .decrypt_and_restore(device, key_hex, &handle, &cancel)
                .await
                .map(|s| s.message()),
        };

        match result {
            Ok(message) => {
                info!(%message, "Job completed");
                handle.complete(message).await;
            }
            Err(e) => {
                error!(error = %e, "Job failed");
                handle.fail(e.to_string()).await;
            }
        }
    }

    fn backup_engine(&self, profile: &WipeProfile) -> BackupEngine {
        BackupEngine::new(
            Arc::clone(&self.ctx.resolver),
            self.ctx.config.backup_directory.clone(),
            profile.chunk_size,
            self.ctx.config.persist_key_artifact,
        )
    }

    /// File-mode bomb: each file on the device is one region.
    async fn boom_wipe(
        &self,
        label: &str,
        profile: &WipeProfile,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let device = resolve_device(&self.ctx.resolver, label).await?;
        let roots = accessible_roots(self.ctx.resolver.as_ref(), &device)?;
        if roots.is_empty() {
            return Err(WipeError::NoAccessibleVolume(label.to_string()));
        }

        let files = run_blocking(move || {
            Ok(roots.iter().flat_map(|r| scan_files(r)).collect::<Vec<_>>())
        })
        .await?;

        let bomb = FileBomb::new(files, profile.file_passes, profile.chunk_size);
        let regions = bomb.regions();
        let cap = if device.is_removable() {
            profile.removable_workers
        } else {
            profile.device_workers
        };

        let report = RegionBombScheduler::new(cap)
            .run(Arc::new(bomb), regions, job, JobStatus::Wiping, cancel)
            .await?;

        Ok(format!(
            "Destroyed {}/{} files on '{}'",
            report.completed, report.total, label
        ))
    }

    /// Device-mode bomb over the raw byte range.
    async fn device_wipe(
        &self,
        label: &str,
        profile: &WipeProfile,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let device = resolve_device(&self.ctx.resolver, label).await?;
        guard_roots(self.ctx.resolver.as_ref(), &device.mount_roots)?;
        if device.size == 0 {
            return Err(WipeError::UnknownDeviceSize(label.to_string()));
        }

        let (region_size, cap) = if device.is_removable() {
            (profile.removable_region_size, profile.removable_workers)
        } else {
            (profile.device_region_size, profile.device_workers)
        };

        let path = device.path.clone();
        let handle = run_blocking(move || open_device_exclusive(&path)).await?;
        let bomb = DeviceBomb::new(handle, profile.passes, profile.chunk_size);

        let report = RegionBombScheduler::new(cap)
            .run(
                Arc::new(bomb),
                partition(device.size, region_size),
                job,
                JobStatus::PlacingBombs,
                cancel,
            )
            .await?;

        Ok(format!(
            "Overwrote {}/{} regions of {} with {} passes",
            report.completed,
            report.total,
            device.path.display(),
            profile.passes
        ))
    }
}
