use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::body::BodyStream;

use super::journal::JOURNAL_FILE;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const TEMP_PREFIX: &str = "tmp_";

/// Byte-addressable storage of response bodies, one opaque blob per
/// secondary key. Concurrent reads are fine; writes publish atomically,
/// so the most recent writer of a key wins.
#[async_trait]
pub(crate) trait BlobStore: Send + Sync {
    async fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>>;

    /// Streaming read. `None` when no blob exists for the key.
    async fn reader(&self, key: &str) -> Result<Option<BodyStream>>;

    async fn contains(&self, key: &str) -> bool;

    async fn remove(&self, key: &str);

    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-flight blob write. Nothing is visible under the key until `finish`.
#[async_trait]
pub(crate) trait BlobWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Publishes the blob and returns its final length.
    async fn finish(self: Box<Self>) -> Result<u64>;

    /// Abandons the write, deleting any partial data.
    async fn discard(self: Box<Self>);
}

/// Blob storage rooted at the cache directory. Keys are validated to the
/// 32-hex-char form, which keeps every path inside the root.
pub(crate) struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub async fn open(root: &Path) -> Result<Self> {
        async_fs::create_dir_all(root)
            .await
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;
        let store = Self {
            root: root.to_path_buf(),
        };
        store.remove_temp_files().await;
        Ok(store)
    }

    pub fn is_valid_key(key: &str) -> bool {
        key.len() == 32
            && key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if !Self::is_valid_key(key) {
            bail!("invalid blob key {key:?}");
        }
        Ok(self.root.join(key))
    }

    async fn remove_temp_files(&self) {
        let Ok(mut entries) = async_fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                let _ = async_fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Deletes files that are neither the journal nor a valid blob key.
    /// Run at startup; crash leftovers and stray files end up here.
    pub async fn prune_unknown_files(&self) -> Result<()> {
        let mut entries = async_fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list cache dir {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == JOURNAL_FILE || Self::is_valid_key(&name) {
                continue;
            }
            let _ = async_fs::remove_file(entry.path()).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for DiskStore {
    async fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>> {
        let final_path = self.blob_path(key)?;
        let temp_path = self
            .root
            .join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()));
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options
            .open(&temp_path)
            .await
            .with_context(|| format!("failed to create blob temp {}", temp_path.display()))?;
        Ok(Box::new(DiskWriter {
            file: Some(file),
            temp_path,
            final_path,
            written: 0,
            finished: false,
        }))
    }

    async fn reader(&self, key: &str) -> Result<Option<BodyStream>> {
        let path = self.blob_path(key)?;
        let file = match async_fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open blob {}", path.display()));
            }
        };
        let stream = stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = BytesMut::zeroed(READ_CHUNK_SIZE);
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf.freeze()), Some(file)))
                }
                Err(err) => Some((Err(err), None)),
            }
        });
        Ok(Some(BodyStream::from_stream(stream)))
    }

    async fn contains(&self, key: &str) -> bool {
        match self.blob_path(key) {
            Ok(path) => async_fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn remove(&self, key: &str) {
        if let Ok(path) = self.blob_path(key) {
            let _ = async_fs::remove_file(path).await;
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = async_fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list cache dir {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if Self::is_valid_key(&name) {
                keys.push(name.into_owned());
            }
        }
        Ok(keys)
    }
}

struct DiskWriter {
    file: Option<async_fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    finished: bool,
}

#[async_trait]
impl BlobWriter for DiskWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .context("blob writer already finished")?;
        file.write_all(chunk).await?;
        self.written = self.written.saturating_add(chunk.len() as u64);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64> {
        let mut file = self.file.take().context("blob writer already finished")?;
        file.flush().await?;
        drop(file);
        async_fs::rename(&self.temp_path, &self.final_path)
            .await
            .with_context(|| format!("failed to publish blob {}", self.final_path.display()))?;
        self.finished = true;
        Ok(self.written)
    }

    async fn discard(mut self: Box<Self>) {
        self.file.take();
        let _ = async_fs::remove_file(&self.temp_path).await;
        self.finished = true;
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let temp_path = self.temp_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}

/// Process-scoped blob storage for caches that must not touch disk.
#[derive(Default)]
pub(crate) struct MemoryStore {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn writer(&self, key: &str) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: BytesMut::new(),
            blobs: self.blobs.clone(),
        }))
    }

    async fn reader(&self, key: &str) -> Result<Option<BodyStream>> {
        Ok(self
            .blobs
            .lock()
            .get(key)
            .cloned()
            .map(BodyStream::from_bytes))
    }

    async fn contains(&self, key: &str) -> bool {
        self.blobs.lock().contains_key(key)
    }

    async fn remove(&self, key: &str) {
        self.blobs.lock().remove(key);
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.blobs.lock().keys().cloned().collect())
    }
}

struct MemoryWriter {
    key: String,
    buf: BytesMut,
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let bytes = self.buf.freeze();
        let len = bytes.len() as u64;
        self.blobs.lock().insert(self.key, bytes);
        Ok(len)
    }

    async fn discard(self: Box<Self>) {}
}
