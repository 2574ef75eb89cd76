//! Metadata encryption key loading and generation.
//!
//! Keys are 32 raw bytes on disk, zeroized in memory on drop and written with
//! 0600 permissions on Unix.

use anyhow::{bail, Context, Result};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305};
use rand_core::{OsRng, RngCore};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::cipherio::StreamCipher;

pub const KEY_LEN: usize = 32;

pub struct KeyManager {
    key_bytes: [u8; KEY_LEN],
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl KeyManager {
    pub fn from_bytes(key_bytes: [u8; KEY_LEN]) -> Self {
        Self { key_bytes }
    }

    /// Load the key at `path`, generating a fresh one if the file is missing.
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if fs::try_exists(path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?
        {
            info!(path = %path.display(), "loading metadata key");
            let mut data = fs::read(path)
                .await
                .with_context(|| format!("reading key from {}", path.display()))?;
            if data.len() != KEY_LEN {
                warn!(path = %path.display(), found_bytes = data.len(), "invalid key size");
                let found = data.len();
                data.zeroize();
                bail!(
                    "expected {}-byte key at {} but found {} bytes",
                    KEY_LEN,
                    path.display(),
                    found
                );
            }
            let mut key_bytes = [0u8; KEY_LEN];
            key_bytes.copy_from_slice(&data);
            data.zeroize();
            return Ok(Self { key_bytes });
        }

        info!(path = %path.display(), "generating new metadata key");
        let mut key_bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        write_key_file(path, key_bytes).await?;

        Ok(Self { key_bytes })
    }

    pub fn stream_cipher(&self) -> StreamCipher {
        StreamCipher::new(XChaCha20Poly1305::new(&Key::from(self.key_bytes)))
    }
}

#[cfg(unix)]
async fn write_key_file(path: &Path, key_bytes: [u8; KEY_LEN]) -> Result<()> {
    let path_buf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::fs::OpenOptions;
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut key_bytes = key_bytes;
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path_buf)
            .with_context(|| format!("creating key file {}", path_buf.display()))?;
        let written = f.write_all(&key_bytes);
        key_bytes.zeroize();
        written?;
        Ok::<(), anyhow::Error>(())
    })
    .await??;
    Ok(())
}

#[cfg(not(unix))]
async fn write_key_file(path: &Path, key_bytes: [u8; KEY_LEN]) -> Result<()> {
    fs::write(path, &key_bytes)
        .await
        .with_context(|| format!("creating key file {}", path.display()))?;
    Ok(())
}
