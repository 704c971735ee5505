//! Region workers for the bomb scheduler.
//!
//! [`DeviceBomb`] overwrites byte ranges of one raw device with a fixed pass
//! sequence. [`FileBomb`] treats each file as a region: random passes, then
//! truncate and unlink.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::scheduler::{Region, RegionWorker};
use crate::core::volume::VolumeFile;
use crate::error::{Result, WipeError};

/// What one pass writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPattern {
    Zeros,
    Ones,
    Random,
}

impl PassPattern {
    /// Pass `n` of a multi-pass overwrite: zeros, ones, random, repeating.
    pub fn for_pass(n: u32) -> Self {
        match n % 3 {
            0 => PassPattern::Zeros,
            1 => PassPattern::Ones,
            _ => PassPattern::Random,
        }
    }

    fn fill(&self, buf: &mut [u8]) {
        match self {
            PassPattern::Zeros => buf.fill(0x00),
            PassPattern::Ones => buf.fill(0xFF),
            PassPattern::Random => rand::thread_rng().fill_bytes(buf),
        }
    }
}

/// Write `pattern` over `[offset, offset + length)` of `target`.
fn overwrite_range(
    target: &File,
    offset: u64,
    length: u64,
    pattern: PassPattern,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buffer = vec![0u8; (chunk_size as u64).min(length).max(1) as usize];
    pattern.fill(&mut buffer);

    let end = offset + length;
    let mut pos = offset;
    while pos < end {
        if cancel.is_cancelled() {
            return Err(WipeError::Cancelled);
        }
        let n = (end - pos).min(buffer.len() as u64) as usize;
        if pattern == PassPattern::Random {
            pattern.fill(&mut buffer[..n]);
        }
        target.write_all_at(&buffer[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

/// Multi-pass overwrite of device regions through one shared handle.
///
/// The handle is opened once per job (exclusively, see
/// [`open_device_exclusive`](crate::core::overwriter::open_device_exclusive))
/// and every worker writes its own disjoint range with positioned writes.
pub struct DeviceBomb {
    device: Arc<File>,
    passes: u32,
    chunk_size: usize,
}

impl DeviceBomb {
    pub fn new(device: File, passes: u32, chunk_size: usize) -> Self {
        Self {
            device: Arc::new(device),
            passes: passes.max(1),
            chunk_size,
        }
    }
}

impl RegionWorker for DeviceBomb {
    fn detonate(&self, region: &Region, cancel: &CancellationToken) -> Result<()> {
        for pass in 0..self.passes {
            let pattern = PassPattern::for_pass(pass);
            overwrite_range(
                &self.device,
                region.offset,
                region.length,
                pattern,
                self.chunk_size,
                cancel,
            )?;
            self.device.sync_data()?;
        }
        Ok(())
    }
}

/// Destroys whole files: `passes` random overwrites, each synced, then
/// truncation and unlink. `Region::offset` indexes into `files`.
pub struct FileBomb {
    files: Vec<VolumeFile>,
    passes: u32,
    chunk_size: usize,
}

impl FileBomb {
    pub fn new(files: Vec<VolumeFile>, passes: u32, chunk_size: usize) -> Self {
        Self {
            files,
            passes: passes.max(1),
            chunk_size,
        }
    }

    /// One region per file, in list order.
    pub fn regions(&self) -> Vec<Region> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| Region {
                offset: i as u64,
                length: f.size,
                sequence_id: i as u64,
            })
            .collect()
    }

    fn destroy(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        let size = file.metadata()?.len();

        for _ in 0..self.passes {
            overwrite_range(&file, 0, size, PassPattern::Random, self.chunk_size, cancel)?;
            file.sync_all()?;
        }
        file.set_len(0)?;
        file.sync_all()?;
        drop(file);

        fs::remove_file(path)?;
        debug!(path = %path.display(), bytes = size, "File destroyed");
        Ok(())
    }
}

impl RegionWorker for FileBomb {
    fn detonate(&self, region: &Region, cancel: &CancellationToken) -> Result<()> {
        let file = self.files.get(region.offset as usize).ok_or_else(|| {
            WipeError::Io(std::io::Error::other(format!(
                "no file for region {}",
                region.sequence_id
            )))
        })?;
        self.destroy(&file.path, cancel)
    }
}
