mod common;

use std::fs;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{DEVICE, Fixture, count_files, payload};
use tokio_util::sync::CancellationToken;
use wiped::core::scheduler::{Region, RegionBombScheduler, RegionWorker, partition};
use wiped::core::{JobKind, JobOutcome, JobRegistry, JobRequest, JobStatus};
use wiped::error::{Result, WipeError};

const MIB: u64 = 1024 * 1024;

struct FlakyWorker {
    bad_region: u64,
    delay: Duration,
}

impl RegionWorker for FlakyWorker {
    fn detonate(&self, region: &Region, _cancel: &CancellationToken) -> Result<()> {
        std::thread::sleep(self.delay);
        if region.sequence_id == self.bad_region {
            return Err(WipeError::Io(std::io::Error::other("write fault")));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_region_still_completes_job() {
    let registry = JobRegistry::new();
    let job = registry.create(JobKind::PendriveWipe, "10MiB target").await;
    let id = job.id().to_string();

    let regions = partition(10 * MIB, NonZeroU64::new(MIB).unwrap());
    assert_eq!(regions.len(), 10);

    let worker = Arc::new(FlakyWorker {
        bad_region: 7,
        delay: Duration::from_millis(1),
    });
    let report = RegionBombScheduler::new(4)
        .run(worker, regions, &job, JobStatus::PlacingBombs, &CancellationToken::new())
        .await
        .unwrap();
    job.complete("done").await;

    assert_eq!(report.completed, 9);
    assert_eq!(report.failed_regions, vec![7]);

    let record = registry.get(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.completed, 9);
    assert_eq!(record.total, 10);
    assert_eq!(record.failed_regions, vec![7]);
    assert_eq!(record.progress, 100);
    assert_eq!(record.outcome(), Some(JobOutcome::SucceededWithLosses { failed: 1 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_never_goes_backwards() {
    let registry = JobRegistry::new();
    let job = registry.create(JobKind::BoomWipe, "many regions").await;
    let id = job.id().to_string();

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let registry = registry.clone();
        let id = id.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut samples = Vec::new();
            while !done.load(Ordering::SeqCst) {
                if let Some(j) = registry.get(&id).await {
                    samples.push(j.progress);
                }
                tokio::time::sleep(Duration::from_micros(200)).await;
            }
            samples
        })
    };

    let worker = Arc::new(FlakyWorker {
        bad_region: 13,
        delay: Duration::from_millis(2),
    });
    RegionBombScheduler::new(8)
        .run(
            worker,
            partition(64 * MIB, NonZeroU64::new(MIB).unwrap()),
            &job,
            JobStatus::PlacingBombs,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    job.complete("done").await;
    done.store(true, Ordering::SeqCst);

    let samples = watcher.await.unwrap();
    assert!(samples.windows(2).all(|w| w[0] <= w[1]), "{samples:?}");
    assert_eq!(registry.get(&id).await.unwrap().progress, 100);
}

#[tokio::test]
async fn test_pendrive_wipe_overwrites_whole_image() {
    let fx = Fixture::new();
    let original = payload(3 * MIB as usize + 100);
    let image = fx.add_image("RAWIMAGE", &original);

    let job = fx
        .service()
        .run(JobRequest::PendriveWipe {
            device: "RAWIMAGE".to_string(),
            quick: false,
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.kind, JobKind::PendriveWipe);
    // 512 KiB regions on removable media.
    assert_eq!(job.total, 7);
    assert_eq!(job.completed, 7);

    let after = fs::read(&image).unwrap();
    assert_eq!(after.len(), original.len());
    assert_ne!(after, original);
}

#[tokio::test]
async fn test_quick_wipe_is_a_single_zero_pass() {
    let fx = Fixture::new();
    let image = fx.add_image("RAWIMAGE", &payload(MIB as usize));

    let job = fx
        .service()
        .run(JobRequest::PendriveWipe {
            device: "RAWIMAGE".to_string(),
            quick: true,
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.kind, JobKind::QuickWipe);
    assert!(fs::read(&image).unwrap().iter().all(|&b| b == 0));
    // The shared settings are untouched by the quick job.
    assert_eq!(fx.ctx.config.wipe.overwrite_passes, 3);
}

#[tokio::test]
async fn test_boom_wipe_destroys_files_but_not_os_metadata() {
    let fx = Fixture::new();
    for i in 0..5 {
        fx.write(&format!("photos/img_{i}.jpg"), &payload(10_000 + i));
    }
    fx.write("System Volume Information/IndexerVolumeGuid", b"guid");

    let job = fx
        .service()
        .run(JobRequest::BoomWipe {
            device: DEVICE.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.total, 5);
    assert_eq!(job.completed, 5);
    assert_eq!(count_files(&fx.mount.join("photos")), 0);
    assert!(fx.mount.join("System Volume Information/IndexerVolumeGuid").exists());
}

#[tokio::test]
async fn test_empty_volume_completes_immediately() {
    let fx = Fixture::new();
    let job = fx
        .service()
        .run(JobRequest::BoomWipe {
            device: DEVICE.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total, 0);
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn test_zero_size_device_fails() {
    let fx = Fixture::new();
    fx.add_image("EMPTYIMAGE", &[]);
    let job = fx
        .service()
        .run(JobRequest::PendriveWipe {
            device: "EMPTYIMAGE".to_string(),
            quick: false,
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("Unable to determine size"));
}

#[tokio::test]
async fn test_unknown_device_fails() {
    let fx = Fixture::new();
    let job = fx
        .service()
        .run(JobRequest::BoomWipe {
            device: "nothing like it".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("No mounted or raw device found"));
}

#[tokio::test]
async fn test_shutdown_cancels_running_job() {
    let fx = Fixture::new();
    fx.add_image("RAWIMAGE", &payload(4 * MIB as usize));
    fx.ctx.shutdown.cancel();

    let job = fx
        .service()
        .run(JobRequest::PendriveWipe {
            device: "RAWIMAGE".to_string(),
            quick: false,
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled"));
}

async fn wait_for_terminal(fx: &Fixture, id: &str) -> wiped::core::WipeJob {
    for _ in 0..2000 {
        let job = fx.ctx.registry.get(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_job_on_same_device_is_refused() {
    let fx = Fixture::new();
    for i in 0..200 {
        fx.write(&format!("docs/{i:03}.txt"), &payload(65_536 + i));
    }
    let service = fx.service();

    let first = service
        .start(JobRequest::EncryptWipe {
            device: DEVICE.to_string(),
        })
        .await;
    // Same device through a different label.
    let second = service
        .start(JobRequest::BoomWipe {
            device: "SIM0000".to_string(),
        })
        .await;

    let refused = wait_for_terminal(&fx, &second).await;
    assert_eq!(refused.status, JobStatus::Failed);
    assert!(refused.error.unwrap().contains("already has a job running"));
    assert_eq!(refused.completed, 0);

    let done = wait_for_terminal(&fx, &first).await;
    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error);
    assert_eq!(done.completed, 200);
    assert_eq!(done.failed, 0);
    assert_eq!(count_files(&fx.mount), 200);

    // The lease is released right after the first job's task returns.
    let mut third = None;
    for _ in 0..200 {
        let job = service
            .run(JobRequest::BoomWipe {
                device: DEVICE.to_string(),
            })
            .await
            .unwrap();
        if job.status == JobStatus::Completed {
            third = Some(job);
            break;
        }
        assert!(job.error.unwrap().contains("already has a job running"));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(third.is_some(), "device was never released");
    assert_eq!(count_files(&fx.mount), 0);
}
