//! Per-file encrypted container.
//!
//! Layout: `"GCM1" || nonce(12) || tag(16) || ciphertext`. The ciphertext is
//! standard AES-256-GCM with empty associated data, computed incrementally so
//! files of any size stream through a fixed-size buffer.
//!
//! The tag only exists once the last ciphertext byte has been produced, so
//! the writer reserves 16 zero bytes and patches them at the end. The reader
//! decrypts into a temp file next to the destination and renames it into
//! place only after the tag verifies.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use ghash::GHash;
use ghash::universal_hash::UniversalHash;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tempfile::Builder;

use crate::core::overwriter::{KEY_LEN, read_full};
use crate::error::{Result, WipeError};

pub const FORMAT_TAG: &[u8; 4] = b"GCM1";
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = FORMAT_TAG.len() + NONCE_LEN + TAG_LEN;
pub const CONTAINER_SUFFIX: &str = ".enc";

const BLOCK: usize = 16;

/// Incremental AES-256-GCM over a byte stream.
struct GcmStream {
    keystream: Ctr32BE<Aes256>,
    ghash: GHash,
    tag_mask: [u8; BLOCK],
    pending: [u8; BLOCK],
    pending_len: usize,
    ciphertext_len: u64,
}

impl GcmStream {
    fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        let aes = Aes256::new(key.into());

        let mut h = ghash::Block::default();
        aes.encrypt_block(&mut h);
        let ghash = <GHash as KeyInit>::new(&h);

        // J0 = nonce || 1 masks the tag; payload counters start at J0 + 1.
        let mut j0 = [0u8; BLOCK];
        j0[..NONCE_LEN].copy_from_slice(nonce);
        j0[BLOCK - 1] = 1;
        let mut mask = ghash::Block::from(j0);
        aes.encrypt_block(&mut mask);

        let mut counter = j0;
        counter[BLOCK - 1] = 2;
        let keystream = Ctr32BE::<Aes256>::new(key.into(), &counter.into());

        Self {
            keystream,
            ghash,
            tag_mask: mask.into(),
            pending: [0u8; BLOCK],
            pending_len: 0,
            ciphertext_len: 0,
        }
    }

    fn encrypt(&mut self, buf: &mut [u8]) {
        self.keystream.apply_keystream(buf);
        self.absorb(buf);
    }

    fn decrypt(&mut self, buf: &mut [u8]) {
        self.absorb(buf);
        self.keystream.apply_keystream(buf);
    }

    /// Feed ciphertext to GHASH in whole blocks, carrying any remainder.
    fn absorb(&mut self, mut data: &[u8]) {
        self.ciphertext_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK {
                return;
            }
            self.ghash.update_padded(&self.pending);
            self.pending_len = 0;
        }

        let whole = data.len() - data.len() % BLOCK;
        if whole > 0 {
            self.ghash.update_padded(&data[..whole]);
        }
        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finalize(mut self) -> [u8; TAG_LEN] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }

        let mut lengths = [0u8; BLOCK];
        // No associated data: first half stays zero.
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let mut tag: [u8; TAG_LEN] = self.ghash.finalize().into();
        for (t, m) in tag.iter_mut().zip(self.tag_mask.iter()) {
            *t ^= m;
        }
        tag
    }
}

/// Encrypt `src` into a new container at `dst`. Returns plaintext bytes.
///
/// The destination is synced before returning, so callers may delete the
/// source as soon as this succeeds.
pub fn encrypt_file(src: &Path, dst: &Path, key: &[u8; KEY_LEN], chunk_size: usize) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    output.write_all(FORMAT_TAG)?;
    output.write_all(&nonce)?;
    output.write_all(&[0u8; TAG_LEN])?;

    let mut gcm = GcmStream::new(key, &nonce);
    let mut buffer = vec![0u8; chunk_size.max(BLOCK)];
    let mut total: u64 = 0;
    loop {
        let n = read_full(&mut input, &mut buffer)?;
        if n == 0 {
            break;
        }
        gcm.encrypt(&mut buffer[..n]);
        output.write_all(&buffer[..n])?;
        total += n as u64;
    }

    let tag = gcm.finalize();
    output.seek(SeekFrom::Start((FORMAT_TAG.len() + NONCE_LEN) as u64))?;
    output.write_all(&tag)?;
    output.sync_all()?;

    Ok(total)
}

/// Decrypt the container at `src` to `dst`. Returns plaintext bytes.
///
/// Plaintext goes to a temp file in `dst`'s directory and is renamed over
/// `dst` only when the tag matches. On any error nothing appears at `dst`.
pub fn decrypt_file(src: &Path, dst: &Path, key: &[u8; KEY_LEN], chunk_size: usize) -> Result<u64> {
    let mut input = File::open(src)?;

    let mut header = [0u8; HEADER_LEN];
    if read_full(&mut input, &mut header)? < HEADER_LEN || &header[..4] != FORMAT_TAG {
        return Err(WipeError::UnsupportedFormat(src.to_path_buf()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&header[4..4 + NONCE_LEN]);
    let expected_tag = &header[4 + NONCE_LEN..];

    let dir = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    // Dropped (and deleted) on every early return below.
    let mut tmp = Builder::new().prefix(".tmpdec-").tempfile_in(dir)?;

    let mut gcm = GcmStream::new(key, &nonce);
    let mut buffer = vec![0u8; chunk_size.max(BLOCK)];
    let mut total: u64 = 0;
    loop {
        let n = read_full(&mut input, &mut buffer)?;
        if n == 0 {
            break;
        }
        gcm.decrypt(&mut buffer[..n]);
        tmp.as_file_mut().write_all(&buffer[..n])?;
        total += n as u64;
    }

    let tag = gcm.finalize();
    if tag[..].ct_eq(expected_tag).unwrap_u8() != 1 {
        return Err(WipeError::AuthenticationFailed(src.to_path_buf()));
    }

    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| WipeError::Io(e.error))?;
    Ok(total)
}
