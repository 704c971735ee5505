//! Bounded-parallel region scheduler.
//!
//! A target (device byte range or file list) is cut into [`Region`]s, and
//! each region is handed to a [`RegionWorker`] on the blocking pool. At most
//! `min(cap, regions)` run at once. A failing region is logged and counted;
//! it never stops the others.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::registry::{JobHandle, JobStatus};
use crate::error::{Result, WipeError};

/// Contiguous slice of a target. For file targets `offset` is the file's
/// index and `length` its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub length: u64,
    pub sequence_id: u64,
}

/// Cut `[0, total_size)` into disjoint regions of `region_size` bytes. The
/// last one is truncated to end exactly at `total_size`.
pub fn partition(total_size: u64, region_size: NonZeroU64) -> Vec<Region> {
    let size = region_size.get();
    let count = total_size.div_ceil(size);

    (0..count)
        .map(|i| {
            let offset = i * size;
            Region {
                offset,
                length: size.min(total_size - offset),
                sequence_id: i,
            }
        })
        .collect()
}

/// Destroys one region. Called on the blocking pool.
pub trait RegionWorker: Send + Sync + 'static {
    fn detonate(&self, region: &Region, cancel: &CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BombReport {
    pub total: u64,
    pub completed: u64,
    pub failed_regions: Vec<u64>,
}

pub struct RegionBombScheduler {
    worker_cap: usize,
}

impl RegionBombScheduler {
    pub fn new(worker_cap: usize) -> Self {
        Self {
            worker_cap: worker_cap.max(1),
        }
    }

    /// Run every region through `worker`, recording each outcome on `job`.
    ///
    /// Returns once every dispatched region has finished. On cancellation no
    /// new regions start, in-flight ones are awaited, and the result is
    /// [`WipeError::Cancelled`].
    pub async fn run<W: RegionWorker>(
        &self,
        worker: Arc<W>,
        regions: Vec<Region>,
        job: &JobHandle,
        status: JobStatus,
        cancel: &CancellationToken,
    ) -> Result<BombReport> {
        let total = regions.len() as u64;
        let mut report = BombReport {
            total,
            completed: 0,
            failed_regions: Vec::new(),
        };
        // Nothing to destroy: leave the job as is for the caller to complete.
        if regions.is_empty() {
            return Ok(report);
        }
        job.begin(status, total).await;

        let pool = self.worker_cap.min(regions.len());
        info!(job_id = job.id(), regions = total, workers = pool, "Placing bombs");

        let mut pending = regions.into_iter();
        let mut running: JoinSet<(u64, Result<()>)> = JoinSet::new();
        let mut in_flight: HashMap<Id, u64> = HashMap::new();
        let mut interrupted = false;

        loop {
            while running.len() < pool && !cancel.is_cancelled() {
                let Some(region) = pending.next() else {
                    break;
                };
                let worker = Arc::clone(&worker);
                let token = cancel.clone();
                let handle = running.spawn_blocking(move || {
                    (region.sequence_id, worker.detonate(&region, &token))
                });
                in_flight.insert(handle.id(), region.sequence_id);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };

            match joined {
                Ok((id, (seq, Ok(())))) => {
                    in_flight.remove(&id);
                    debug!(region = seq, "Region destroyed");
                    report.completed += 1;
                    job.record_success().await;
                }
                Ok((id, (seq, Err(WipeError::Cancelled)))) => {
                    in_flight.remove(&id);
                    interrupted = true;
                    debug!(region = seq, "Region interrupted");
                }
                Ok((id, (seq, Err(e)))) => {
                    in_flight.remove(&id);
                    warn!(region = seq, error = %e, "Region failed");
                    report.failed_regions.push(seq);
                    job.record_failure(Some(seq)).await;
                }
                Err(join_err) => {
                    let seq = in_flight.remove(&join_err.id());
                    warn!(region = ?seq, error = %join_err, "Region worker panicked");
                    if let Some(seq) = seq {
                        report.failed_regions.push(seq);
                    }
                    job.record_failure(seq).await;
                }
            }
        }

        // A token fired after the last region finished changes nothing.
        if interrupted || !pending.as_slice().is_empty() {
            return Err(WipeError::Cancelled);
        }

        report.failed_regions.sort_unstable();
        info!(
            job_id = job.id(),
            completed = report.completed,
            failed = report.failed_regions.len(),
            "All regions attempted"
        );
        Ok(report)
    }
}
