pub mod advisor;
pub mod backup;
pub mod bomb;
pub mod device;
pub mod encrypt_wipe;
pub mod jobs;
pub mod overwriter;
pub mod registry;
pub mod scheduler;
pub mod volume;

pub use device::{BusType, Device, DeviceResolver};
pub use jobs::{JobRequest, WipeService};
pub use registry::{
    DeviceLease, JobHandle, JobKind, JobOutcome, JobRegistry, JobStatus, WipeJob,
};

use crate::error::{Result, WipeError};

/// Run blocking file or device work off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WipeError::Io(std::io::Error::other(e)))?
}
