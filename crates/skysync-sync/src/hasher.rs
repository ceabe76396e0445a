//! Content fingerprinting
//!
//! The fingerprint matches the remote's content hash bit for bit: the input
//! is split into 4 MiB blocks, each block is hashed with SHA-256, the block
//! digests are concatenated and the concatenation is hashed again. The result
//! is hex-encoded.
//!
//! [`LocalHasher`] memoizes fingerprints in the hash cache keyed by local
//! path and modification time, so unchanged files are never read twice.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use skysync_core::domain::{ContentHash, HashCacheEntry, LocalFingerprint};
use skysync_core::ports::IHashCache;

use crate::filesystem;

/// Block size of the remote content hash
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

const READ_BUFFER: usize = 64 * 1024;

/// Streaming content hasher
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_filled: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_filled).min(data.len());
            self.block.update(&data[..take]);
            self.block_filled += take;
            data = &data[take..];

            if self.block_filled == BLOCK_SIZE {
                let digest = std::mem::take(&mut self.block).finalize();
                self.overall.update(digest);
                self.block_filled = 0;
            }
        }
    }

    pub fn finalize(mut self) -> ContentHash {
        if self.block_filled > 0 {
            let digest = self.block.finalize();
            self.overall.update(digest);
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&self.overall.finalize());
        ContentHash::from_digest(&digest)
    }
}

/// Fingerprints everything readable from `reader`
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hasher.finalize())
}

/// Fingerprints a file, blocking the calling thread
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    hash_reader(File::open(path)?)
}

/// Fingerprints a file on the blocking thread pool
pub async fn hash_file_async(path: &Path) -> io::Result<ContentHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(io::Error::other)?
}

/// Computes local fingerprints, reusing cached hashes of unchanged files
#[derive(Clone)]
pub struct LocalHasher {
    cache: Arc<dyn IHashCache>,
}

impl LocalHasher {
    pub fn new(cache: Arc<dyn IHashCache>) -> Self {
        Self { cache }
    }

    /// Current fingerprint of a local path
    ///
    /// Folders and missing paths yield their sentinels; a missing path also
    /// drops its cache entry.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or the cache cannot be accessed.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn get_local_hash(&self, path: &Path) -> anyhow::Result<LocalFingerprint> {
        let Some(meta) = filesystem::stat(path).await? else {
            self.cache.remove(path).await?;
            return Ok(LocalFingerprint::Absent);
        };
        if meta.is_dir() {
            return Ok(LocalFingerprint::Folder);
        }

        let mtime_ns = filesystem::mtime_ns(&meta);
        if let Some(cached) = self.cache.get(path).await? {
            if cached.mtime_ns == mtime_ns {
                return Ok(LocalFingerprint::File(cached.content_hash));
            }
        }

        let content_hash = match hash_file_async(path).await {
            Ok(hash) => hash,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.cache.remove(path).await?;
                return Ok(LocalFingerprint::Absent);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to hash {}", path.display()))
            }
        };
        debug!(hash = %content_hash, "Hashed local file");

        self.cache
            .put(&HashCacheEntry {
                local_path: PathBuf::from(path),
                mtime_ns,
                content_hash: content_hash.clone(),
            })
            .await?;
        Ok(LocalFingerprint::File(content_hash))
    }

    /// Records the fingerprint of a file whose content is known, such as a
    /// completed download
    pub async fn remember(&self, path: &Path, content_hash: &ContentHash) -> anyhow::Result<()> {
        let Some(meta) = filesystem::stat(path).await? else {
            return Ok(());
        };
        self.cache
            .put(&HashCacheEntry {
                local_path: PathBuf::from(path),
                mtime_ns: filesystem::mtime_ns(&meta),
                content_hash: content_hash.clone(),
            })
            .await
    }

    /// Forgets the cached fingerprint of a path
    pub async fn forget(&self, path: &Path) -> anyhow::Result<()> {
        self.cache.remove(path).await
    }
}
