//! Content hashes sent with `CreateFile`.

use crate::error::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest as _, Md5};
use sha1::Sha1;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Files at least this large are offered to the pre-hash check first.
pub const PRE_HASH_THRESHOLD: u64 = 500 * 1024;

/// Bytes of the file head covered by the pre-hash.
pub const PRE_HASH_SIZE: usize = 1024;

pub const CONTENT_HASH_NAME: &str = "sha1";
pub const PROOF_VERSION: &str = "v1";

const READ_BUFFER: usize = 64 * 1024;

/// SHA-1 hex of the whole file.
pub async fn sha1_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 hex of the first [`PRE_HASH_SIZE`] bytes.
pub async fn pre_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut head = Vec::with_capacity(PRE_HASH_SIZE);
    (&mut file)
        .take(PRE_HASH_SIZE as u64)
        .read_to_end(&mut head)
        .await?;
    Ok(hex::encode(Sha1::digest(&head)))
}

/// Offset of the proof window for `access_token` in a file of `len` bytes.
fn proof_offset(access_token: &str, len: u64) -> u64 {
    let digest = hex::encode(Md5::digest(access_token.as_bytes()));
    let value = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    if len == 0 {
        0
    } else {
        value % len
    }
}

/// Proof that the uploader holds the bytes it claims to: up to 8 bytes at a
/// token-derived offset, base64 encoded.
pub async fn proof_code(access_token: &str, path: &Path, len: u64) -> Result<String> {
    if len == 0 {
        return Ok(String::new());
    }

    let start = proof_offset(access_token, len);
    let count = (len - start).min(8) as usize;

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut window = vec![0u8; count];
    file.read_exact(&mut window).await?;

    Ok(STANDARD.encode(window))
}
