mod common;

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use common::{DEVICE, Fixture, count_files, payload};
use wiped::core::{JobKind, JobRequest, JobStatus};

fn encrypt_wipe(device: &str) -> JobRequest {
    JobRequest::EncryptWipe {
        device: device.to_string(),
    }
}

fn sizes_and_names(fx: &Fixture) -> (BTreeSet<u64>, BTreeSet<String>) {
    let mut sizes = BTreeSet::new();
    let mut names = BTreeSet::new();
    for entry in walkdir::WalkDir::new(&fx.mount).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            sizes.insert(entry.metadata().unwrap().len());
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    (sizes, names)
}

#[tokio::test]
async fn test_files_are_encrypted_in_place() {
    let fx = Fixture::new();
    fx.write("a.txt", &payload(10));
    fx.write("nested/b.bin", &payload(70_000));
    fx.write("nested/deeper/c.bin", &payload(1));
    let (before_sizes, before_names) = sizes_and_names(&fx);

    let job = fx.service().run(encrypt_wipe(DEVICE)).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.kind, JobKind::EncryptWipe);
    assert_eq!(job.completed, 3);
    assert_eq!(job.progress, 100);

    let (after_sizes, after_names) = sizes_and_names(&fx);
    assert_eq!(count_files(&fx.mount), 3);
    assert_eq!(after_sizes, before_sizes);
    assert!(after_names.is_disjoint(&before_names));

    for entry in walkdir::WalkDir::new(fx.mount.join("nested")).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.metadata().unwrap().len() == 70_000 {
            assert_ne!(fs::read(entry.path()).unwrap(), payload(70_000));
        }
    }
}

#[tokio::test]
async fn test_unmounted_device_is_encrypted_raw() {
    let fx = Fixture::new();
    let original = payload(200_000);
    let image = fx.add_image("RAWIMAGE", &original);

    let job = fx.service().run(encrypt_wipe("RAWIMAGE")).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert!(job.message.unwrap().contains("Raw device"));

    let after = fs::read(&image).unwrap();
    assert_eq!(after.len(), original.len());
    assert_ne!(after, original);
}

#[tokio::test]
async fn test_empty_volume_succeeds_with_nothing_to_do() {
    let fx = Fixture::new();
    let job = fx.service().run(encrypt_wipe(DEVICE)).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total, 0);
}

#[tokio::test]
async fn test_system_volume_is_never_encrypted() {
    let fx = Fixture::new();
    fx.write("boot.cfg", b"do not touch");
    fx.sim.protect(&fx.mount);

    let job = fx.service().run(encrypt_wipe(DEVICE)).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("system volume"));
    assert_eq!(fs::read(fx.mount.join("boot.cfg")).unwrap(), b"do not touch");
}

#[tokio::test]
async fn test_locked_raw_device_reports_access_denied() {
    if nix::unistd::Uid::effective().is_root() {
        return;
    }
    let fx = Fixture::new();
    let image = fx.add_image("RAWIMAGE", &payload(8192));
    fs::set_permissions(&image, fs::Permissions::from_mode(0o000)).unwrap();

    let job = fx.service().run(encrypt_wipe("RAWIMAGE")).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.starts_with("Access denied opening raw device"), "{error}");
    assert!(error.contains(&image.display().to_string()));

    fs::set_permissions(&image, fs::Permissions::from_mode(0o600)).unwrap();
    assert_eq!(fs::read(&image).unwrap(), payload(8192));
}
