mod common;

use std::fs;

use std::sync::Arc;

use common::{DEVICE, Fixture, count_files, payload};
use wiped::config::AppConfig;
use wiped::context::AppContext;
use wiped::core::backup::layout;
use wiped::core::{JobOutcome, JobRequest, JobStatus, WipeService};
use zeroize::Zeroizing;

const SIZES: [(&str, usize); 3] = [("empty.bin", 0), ("one.bin", 1), ("docs/big.bin", 1_048_577)];

fn populate(fx: &Fixture) {
    for (name, size) in SIZES {
        fx.write(name, &payload(size));
    }
}

fn restore(key: &str) -> JobRequest {
    JobRequest::Restore {
        device: DEVICE.to_string(),
        key_hex: Zeroizing::new(key.to_string()),
    }
}

fn backup() -> JobRequest {
    JobRequest::EncryptBackup {
        device: DEVICE.to_string(),
    }
}

#[tokio::test]
async fn test_backup_then_restore_round_trip() {
    let fx = Fixture::new();
    populate(&fx);
    let service = fx.service();

    let job = service.run(backup()).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.outcome(), Some(JobOutcome::Succeeded));
    assert_eq!(job.completed, 3);
    assert_eq!(job.progress, 100);
    assert_eq!(count_files(&fx.mount), 0);

    let set = layout::find_latest_set(&fx.backups, DEVICE).unwrap();
    assert_eq!(layout::list_containers(&set).len(), 3);
    let key = fs::read_to_string(set.join(layout::KEY_ARTIFACT_NAME)).unwrap();
    assert_eq!(key.trim().len(), 64);
    assert!(job.key_hex.is_none());

    // A malformed key is rejected before anything is written.
    let job = service.run(restore("abcd")).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("Invalid decryption key"));
    assert_eq!(count_files(&fx.mount), 0);

    let job = service.run(restore(key.trim())).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.completed, 3);
    assert_eq!(job.failed, 0);

    for (name, size) in SIZES {
        assert_eq!(fs::read(fx.mount.join(name)).unwrap(), payload(size), "{name}");
    }
}

#[tokio::test]
async fn test_corrupted_container_is_counted_and_not_restored() {
    let fx = Fixture::new();
    populate(&fx);
    let service = fx.service();
    service.run(backup()).await.unwrap();

    let set = layout::find_latest_set(&fx.backups, DEVICE).unwrap();
    let key = fs::read_to_string(set.join(layout::KEY_ARTIFACT_NAME)).unwrap();
    let victim = layout::list_containers(&set)
        .into_iter()
        .find(|p| p.to_string_lossy().ends_with("big.bin.enc"))
        .unwrap();
    let mut bytes = fs::read(&victim).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x80;
    fs::write(&victim, bytes).unwrap();

    let job = service.run(restore(key.trim())).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed, 2);
    assert_eq!(job.failed, 1);
    assert_eq!(job.outcome(), Some(JobOutcome::SucceededWithLosses { failed: 1 }));

    assert!(!fx.mount.join("docs/big.bin").exists());
    assert_eq!(count_files(&fx.mount.join("docs")), 0);
    assert_eq!(fs::read(fx.mount.join("one.bin")).unwrap(), payload(1));
}

#[tokio::test]
async fn test_wrong_key_restores_nothing() {
    let fx = Fixture::new();
    populate(&fx);
    let service = fx.service();
    service.run(backup()).await.unwrap();

    let job = service.run(restore(&"00".repeat(32))).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("No files were restored"));
    assert_eq!(count_files(&fx.mount), 0);
}

#[tokio::test]
async fn test_key_can_stay_off_disk() {
    let fx = Fixture::with_config(|c| c.persist_key_artifact = false);
    fx.write("notes.txt", b"meet at noon");
    let service = fx.service();

    let job = service.run(backup()).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let key = job.key_hex.expect("key delivered with the job");
    // Handed over once; later status reads no longer carry it.
    assert!(fx.ctx.registry.get(&job.id).await.unwrap().key_hex.is_none());
    assert!(fx.ctx.registry.take(&job.id).await.unwrap().key_hex.is_none());

    let set = layout::find_latest_set(&fx.backups, DEVICE).unwrap();
    assert!(!set.join(layout::KEY_ARTIFACT_NAME).exists());

    let job = service.run(restore(&key)).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(fs::read(fx.mount.join("notes.txt")).unwrap(), b"meet at noon");
}

#[tokio::test]
async fn test_system_volume_is_refused_before_any_write() {
    let fx = Fixture::new();
    fx.write("keep.txt", b"system file");
    fx.sim.protect(fx.mount.parent().unwrap());

    let job = fx.service().run(backup()).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("system volume"));
    assert!(!fx.backups.exists());
    assert_eq!(fs::read(fx.mount.join("keep.txt")).unwrap(), b"system file");
}

#[tokio::test]
async fn test_restore_without_backup() {
    let fx = Fixture::new();
    let job = fx.service().run(restore(&"ab".repeat(32))).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("No backup found for 'TESTSTICK'"));
}

#[tokio::test]
async fn test_empty_device_backup_fails_and_leaves_no_set() {
    let fx = Fixture::new();
    let job = fx.service().run(backup()).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(layout::find_latest_set(&fx.backups, DEVICE).is_none());
}

#[tokio::test]
async fn test_unmounted_device_has_no_accessible_volume() {
    let fx = Fixture::new();
    fx.add_image("RAWIMAGE", &[0u8; 64]);
    let job = fx
        .service()
        .run(JobRequest::EncryptBackup {
            device: "RAWIMAGE".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("No accessible volumes"));
}

#[tokio::test]
async fn test_backup_directory_on_the_device_is_refused() {
    let fx = Fixture::new();
    fx.write("notes.txt", b"meet at noon");
    let backups = fx.mount.join("backups");

    let config = AppConfig {
        backup_directory: backups.clone(),
        simulation: true,
        ..Default::default()
    };
    let service = WipeService::new(AppContext::new(config, Arc::clone(&fx.ctx.resolver)));

    let job = service.run(backup()).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("is inside volume"));
    assert!(!backups.exists());
    assert_eq!(fs::read(fx.mount.join("notes.txt")).unwrap(), b"meet at noon");
}
