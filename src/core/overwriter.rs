//! In-place, length-preserving encryption of files and raw devices.
//!
//! Each target gets a fresh random nonce and an AES-256-CTR keystream. The
//! target is processed in chunks: read at offset O, encrypt, write back at O,
//! advance. CTR output is exactly as long as its input, so the target never
//! grows or shrinks and no scratch space is needed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use filetime::FileTime;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Result, WipeError};
use crate::logging::LogThrottle;

type Aes256Ctr = Ctr128BE<Aes256>;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;

/// Default chunk size for the read-encrypt-write loop.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Non-critical steps run after a file has been overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CosmeticStep {
    /// Rename to an opaque random name.
    Rename,
    /// Reset access and modification times to now.
    Timestamps,
}

/// Result of a cosmetic step. Failures are logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: CosmeticStep,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct OverwriteReport {
    pub bytes_processed: u64,
    /// Where the data now lives (after the rename, if it happened).
    pub final_path: PathBuf,
    pub cosmetic: Vec<StepOutcome>,
}

/// Chunked AES-256-CTR overwriter.
#[derive(Debug, Clone)]
pub struct StreamCipherOverwriter {
    chunk_size: usize,
}

impl Default for StreamCipherOverwriter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl StreamCipherOverwriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Encrypt a file in place, then rename it and reset its timestamps.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn overwrite_file(
        &self,
        path: &Path,
        key: &[u8; KEY_LEN],
        cancel: &CancellationToken,
    ) -> Result<OverwriteReport> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let total_size = file.metadata()?.len();

        let bytes = self.encrypt_in_place(&mut file, total_size, key, path, cancel)?;
        file.sync_all()?;
        drop(file);

        let mut cosmetic = Vec::with_capacity(2);
        let (final_path, rename) = randomize_name(path);
        cosmetic.push(rename);
        cosmetic.push(reset_timestamps(&final_path));

        Ok(OverwriteReport {
            bytes_processed: bytes,
            final_path,
            cosmetic,
        })
    }

    /// Overwrite the first `total_size` bytes of a raw device.
    ///
    /// The device is opened exclusively with synchronous writes, so every
    /// chunk reaches the device before the next one is read.
    pub fn overwrite_device(
        &self,
        path: &Path,
        total_size: u64,
        key: &[u8; KEY_LEN],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut device = open_device_exclusive(path)?;
        let bytes = self.encrypt_in_place(&mut device, total_size, key, path, cancel)?;
        device.sync_all()?;
        Ok(bytes)
    }

    fn encrypt_in_place(
        &self,
        target: &mut File,
        total_size: u64,
        key: &[u8; KEY_LEN],
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let mut cipher = Aes256Ctr::new(key.into(), &nonce.into());

        let mut buffer = vec![0u8; self.chunk_size];
        let throttle = LogThrottle::new(Duration::from_secs(2));
        let mut offset: u64 = 0;

        while offset < total_size {
            if cancel.is_cancelled() {
                return Err(WipeError::Cancelled);
            }

            let want = (total_size - offset).min(self.chunk_size as u64) as usize;
            target.seek(SeekFrom::Start(offset))?;
            let got = read_full(target, &mut buffer[..want])?;
            if got == 0 {
                break;
            }

            cipher.apply_keystream(&mut buffer[..got]);
            target.seek(SeekFrom::Start(offset))?;
            target.write_all(&buffer[..got])?;
            offset += got as u64;

            if throttle.should_log() {
                debug!(path = %path.display(), offset, total_size, "Overwrite progress");
            }
        }

        Ok(offset)
    }
}

/// Open a device for exclusive, write-through access.
///
/// Block devices get `O_EXCL`, which the kernel rejects while any partition
/// is mounted or another writer holds the device.
pub fn open_device_exclusive(path: &Path) -> Result<File> {
    let is_block = fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    let mut flags = libc::O_DSYNC;
    if is_block {
        flags |= libc::O_EXCL;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(flags)
        .open(path)
        .map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                WipeError::AccessDenied(path.to_path_buf())
            } else {
                WipeError::Io(e)
            }
        })
}

/// Read until `buf` is full or EOF. Returns the byte count.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn randomize_name(path: &Path) -> (PathBuf, StepOutcome) {
    let new_path = path.with_file_name(Uuid::new_v4().simple().to_string());
    match fs::rename(path, &new_path) {
        Ok(()) => (
            new_path,
            StepOutcome {
                step: CosmeticStep::Rename,
                error: None,
            },
        ),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not randomize file name");
            (
                path.to_path_buf(),
                StepOutcome {
                    step: CosmeticStep::Rename,
                    error: Some(e.to_string()),
                },
            )
        }
    }
}

fn reset_timestamps(path: &Path) -> StepOutcome {
    let now = FileTime::now();
    let error = filetime::set_file_times(path, now, now).err().map(|e| {
        warn!(path = %path.display(), error = %e, "Could not reset timestamps");
        e.to_string()
    });
    StepOutcome {
        step: CosmeticStep::Timestamps,
        error,
    }
}

/// Fresh 256-bit key from the OS RNG, wiped when dropped.
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

/// Apply the CTR keystream for `(key, nonce)` to `data`. Used to undo an
/// overwrite when the nonce is known.
pub fn apply_keystream(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}
