//! In-memory registry of wipe jobs.
//!
//! One record per job, created when the job starts and kept for the life of
//! the process. Readers (status queries) go through [`JobRegistry`]; the only
//! way to mutate a record is the [`JobHandle`] returned when the job is
//! created, which the task running that job owns.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use zeroize::Zeroize;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Initializing,
    PlacingBombs,
    Wiping,
    Restoring,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BoomWipe,
    PendriveWipe,
    QuickWipe,
    EncryptWipe,
    EncryptBackup,
    Restore,
}

impl JobKind {
    fn id_prefix(&self) -> &'static str {
        match self {
            JobKind::BoomWipe => "wipe",
            JobKind::PendriveWipe => "pendrive_wipe",
            JobKind::QuickWipe => "quick_wipe",
            JobKind::EncryptWipe => "encrypt_wipe",
            JobKind::EncryptBackup => "backup",
            JobKind::Restore => "restore",
        }
    }
}

/// State of one job as seen by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct WipeJob {
    pub id: String,
    pub kind: JobKind,
    pub device: String,
    pub status: JobStatus,
    /// Whole percent, `0..=100`, never decreases.
    pub progress: u8,
    /// Units (regions, files) finished successfully.
    pub completed: u64,
    /// Units that raised an error.
    pub failed: u64,
    pub total: u64,
    /// Sequence ids of regions that failed (bomb modes only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_regions: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Backup key handed out of band when it is not persisted to disk.
    /// Delivered once through [`JobRegistry::take`], then wiped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_hex: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WipeJob {
    fn new(id: String, kind: JobKind, device: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            device: device.to_string(),
            status: JobStatus::Initializing,
            progress: 0,
            completed: 0,
            failed: 0,
            total: 0,
            failed_regions: Vec::new(),
            message: None,
            error: None,
            key_hex: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal outcome, or `None` while the job is still running.
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.status {
            JobStatus::Completed if self.failed == 0 => Some(JobOutcome::Succeeded),
            JobStatus::Completed => Some(JobOutcome::SucceededWithLosses {
                failed: self.failed,
            }),
            JobStatus::Failed => Some(JobOutcome::Failed {
                reason: self.error.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// What a caller learns once a job is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    SucceededWithLosses { failed: u64 },
    Failed { reason: String },
}

/// Shared, read-mostly store of every job started by this process.
///
/// Owned by `AppContext` and cloned into whatever exposes status.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<String, WipeJob>>>,
    sequence: Arc<AtomicU64>,
    busy: Arc<Mutex<HashSet<PathBuf>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `initializing` and hand back its writer.
    pub async fn create(&self, kind: JobKind, device: &str) -> JobHandle {
        let id = self.next_id(kind);
        let job = WipeJob::new(id.clone(), kind, device);
        self.inner.write().await.insert(id.clone(), job);

        JobHandle {
            id,
            registry: self.clone(),
        }
    }

    /// `<prefix>_<unix seconds>_<pid>_<sequence>`; unique within the process.
    fn next_id(&self, kind: JobKind) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}_{}_{}_{}",
            kind.id_prefix(),
            Utc::now().timestamp(),
            std::process::id(),
            seq
        )
    }

    /// Status of one job. Never carries the backup key; see [`Self::take`].
    pub async fn get(&self, job_id: &str) -> Option<WipeJob> {
        self.inner.read().await.get(job_id).map(redacted)
    }

    /// Status of one job, handing over a pending backup key. The stored copy
    /// is wiped, so the key is delivered at most once.
    pub async fn take(&self, job_id: &str) -> Option<WipeJob> {
        let mut map = self.inner.write().await;
        let job = map.get_mut(job_id)?;
        let snapshot = job.clone();
        if let Some(mut key) = job.key_hex.take() {
            key.zeroize();
        }
        Some(snapshot)
    }

    /// All jobs, oldest first, without backup keys.
    pub async fn list(&self) -> Vec<WipeJob> {
        let map = self.inner.read().await;
        let mut jobs: Vec<WipeJob> = map.values().map(redacted).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Jobs not yet in a terminal state.
    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|j| !j.status.is_terminal()).count()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Reserve `device` for one job. `None` while another lease on the same
    /// device is alive; dropping the lease releases it.
    pub fn lease_device(&self, device: PathBuf) -> Option<DeviceLease> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(device.clone()) {
            return None;
        }
        Some(DeviceLease {
            device,
            busy: Arc::clone(&self.busy),
        })
    }

    async fn mutate(&self, job_id: &str, f: impl FnOnce(&mut WipeJob)) {
        let mut map = self.inner.write().await;
        if let Some(job) = map.get_mut(job_id) {
            f(job);
            job.updated_at = Utc::now();
        }
    }
}

fn redacted(job: &WipeJob) -> WipeJob {
    WipeJob {
        key_hex: None,
        ..job.clone()
    }
}

/// Exclusive claim on a device for the life of one job.
#[derive(Debug)]
pub struct DeviceLease {
    device: PathBuf,
    busy: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DeviceLease {
    pub fn device(&self) -> &PathBuf {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.device);
    }
}

/// Exclusive writer for one job record. Not `Clone`.
pub struct JobHandle {
    id: String,
    registry: JobRegistry,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn snapshot(&self) -> Option<WipeJob> {
        self.registry.get(&self.id).await
    }

    /// Enter a working state once the unit count is known.
    pub async fn begin(&self, status: JobStatus, total: u64) {
        self.registry
            .mutate(&self.id, |job| {
                job.status = status;
                job.total = total;
            })
            .await;
    }

    pub async fn record_success(&self) {
        self.registry
            .mutate(&self.id, |job| {
                job.completed += 1;
                refresh_progress(job);
            })
            .await;
    }

    /// Count a failed unit. `region` is the sequence id in bomb modes.
    pub async fn record_failure(&self, region: Option<u64>) {
        self.registry
            .mutate(&self.id, |job| {
                job.failed += 1;
                if let Some(seq) = region {
                    job.failed_regions.push(seq);
                }
            })
            .await;
    }

    pub async fn set_key_hex(&self, key_hex: String) {
        self.registry
            .mutate(&self.id, |job| job.key_hex = Some(key_hex))
            .await;
    }

    pub async fn complete(self, message: impl Into<String>) {
        let message = message.into();
        self.registry
            .mutate(&self.id, |job| {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.failed_regions.sort_unstable();
                job.message = Some(message);
            })
            .await;
    }

    pub async fn fail(self, error: impl Into<String>) {
        let error = error.into();
        self.registry
            .mutate(&self.id, |job| {
                job.status = JobStatus::Failed;
                job.failed_regions.sort_unstable();
                job.error = Some(error);
            })
            .await;
    }
}

/// `completed / total` in whole percent, clamped so progress never drops and
/// only `complete()` reports 100.
fn refresh_progress(job: &mut WipeJob) {
    if job.total == 0 {
        return;
    }
    let pct = (job.completed.saturating_mul(100) / job.total).min(100) as u8;
    job.progress = job.progress.max(pct);
}
