//! Payload staging: reading a backend stream into memory or a local cache file, reopening it for
//! the write side, and releasing it afterwards.

use std::path::PathBuf;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use sha2::Digest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, StorageError};
use crate::tree::{Blob, Payload};

/// Size of a single read from a backend stream.
pub const READ_CHUNK_SIZE: usize = 100 * 1024;

pub type ByteReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Stage payloads in `dir` instead of memory.
    pub to_disk: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            to_disk: false,
            dir: std::env::temp_dir().join("bcp-cache"),
        }
    }
}

/// Deterministic cache file name for a native object.
#[must_use]
pub fn cache_file_name(collection: &str, key: &str) -> String {
    let digest = sha2::Sha256::digest(format!("{collection}/{key}").as_bytes());
    hex::encode(digest)
}

/// Drains `reader` into the blob's payload and returns the number of bytes staged.
#[tracing::instrument(skip(blob, reader), fields(key = %blob.cloud_name))]
pub async fn fill(blob: &mut Blob, mut reader: ByteReader, cache: &CacheConfig) -> Result<u64> {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    if !cache.to_disk {
        let mut data = BytesMut::new();
        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|err| StorageError::transfer(&blob.cloud_name, err))?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&buffer[..read]);
        }
        let size = data.len() as u64;
        blob.set_payload(Payload::InMemory(data.freeze()));
        return Ok(size);
    }
    let path = cache
        .dir
        .join(cache_file_name(&blob.collection, &blob.cloud_name));
    let staged = stage_to_file(&path, &mut reader, &mut buffer).await;
    match staged {
        Ok(size) => {
            tracing::debug!("cached {} bytes at {:?}", size, &path);
            blob.set_payload(Payload::CachedAt { path, owned: true });
            Ok(size)
        }
        Err(err) => {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                tracing::debug!("no partial cache file to remove at {:?}: {}", &path, cleanup);
            }
            Err(StorageError::transfer(&blob.cloud_name, err))
        }
    }
}

async fn stage_to_file(
    path: &std::path::Path,
    reader: &mut ByteReader,
    buffer: &mut [u8],
) -> anyhow::Result<u64> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed creating cache directory {:?}", dir))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed creating cache file {:?}", path))?;
    let mut size = 0u64;
    loop {
        let read = reader.read(buffer).await.context("failed reading source")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .await
            .with_context(|| format!("failed writing cache file {:?}", path))?;
        size += read as u64;
    }
    file.flush().await?;
    Ok(size)
}

/// Opens the staged payload for reading.
pub async fn open_payload(blob: &Blob) -> Result<ByteReader> {
    match blob.payload() {
        Payload::InMemory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        Payload::CachedAt { path, .. } => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|err| StorageError::from_io(path.display().to_string(), err))?;
            Ok(Box::new(file))
        }
        Payload::Empty => Err(StorageError::transfer(
            &blob.cloud_name,
            anyhow::anyhow!("blob has no payload staged"),
        )),
    }
}

pub async fn payload_len(blob: &Blob) -> Result<u64> {
    match blob.payload() {
        Payload::InMemory(data) => Ok(data.len() as u64),
        Payload::CachedAt { path, .. } => tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.len())
            .map_err(|err| StorageError::from_io(path.display().to_string(), err)),
        Payload::Empty => Ok(0),
    }
}

/// Whole payload as one buffer. Cached payloads are read back from disk.
pub async fn payload_bytes(blob: &Blob) -> Result<Bytes> {
    match blob.payload() {
        Payload::InMemory(data) => Ok(data.clone()),
        Payload::CachedAt { path, .. } => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|err| StorageError::from_io(path.display().to_string(), err)),
        Payload::Empty => Ok(Bytes::new()),
    }
}

/// Reads up to `chunk_size` bytes, fewer only at end of stream.
pub async fn read_chunk(reader: &mut ByteReader, chunk_size: usize) -> std::io::Result<Bytes> {
    let mut chunk = Vec::with_capacity(chunk_size.min(8 * 1024 * 1024));
    reader.take(chunk_size as u64).read_to_end(&mut chunk).await?;
    Ok(Bytes::from(chunk))
}

/// Drops the payload, removing the cache file if this process created it.
pub async fn release(blob: &mut Blob) -> Result<()> {
    if let Payload::CachedAt { path, owned: true } = blob.take_payload() {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::transfer(path.display().to_string(), err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Origin;

    fn reader(data: &'static [u8]) -> ByteReader {
        Box::new(std::io::Cursor::new(data))
    }

    #[tokio::test]
    async fn fill_in_memory() -> anyhow::Result<()> {
        let mut blob = Blob::new(Origin::BlockBlob, "c", "dir/a.txt", '/');
        let size = fill(&mut blob, reader(b"hello"), &CacheConfig::default()).await?;
        assert_eq!(size, 5);
        assert_eq!(blob.data_in_memory().unwrap().as_ref(), b"hello");
        assert!(blob.data_cached_at().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn fill_to_disk_and_release() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = CacheConfig {
            to_disk: true,
            dir: dir.path().join("cache"),
        };
        let mut blob = Blob::new(Origin::BlockBlob, "c", "dir/a.txt", '/');
        fill(&mut blob, reader(b"payload"), &cache).await?;
        let path = blob.data_cached_at().unwrap().to_path_buf();
        assert_eq!(path, cache.dir.join(cache_file_name("c", "dir/a.txt")));
        assert!(!blob.in_memory());
        assert_eq!(payload_len(&blob).await?, 7);
        assert_eq!(tokio::fs::read(&path).await?, b"payload");
        release(&mut blob).await?;
        assert!(!path.exists());
        assert!(!blob.has_payload());
        Ok(())
    }

    #[tokio::test]
    async fn release_keeps_borrowed_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, b"x").await?;
        let mut blob = Blob::new(Origin::Filesystem, "/src", "source.bin", '/');
        blob.set_payload(Payload::CachedAt {
            path: path.clone(),
            owned: false,
        });
        release(&mut blob).await?;
        assert!(path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn chunks_split_on_size() -> anyhow::Result<()> {
        let data = vec![7u8; 350 * 1024];
        let mut reader: ByteReader = Box::new(std::io::Cursor::new(data));
        let mut sizes = Vec::new();
        loop {
            let chunk = read_chunk(&mut reader, 100 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![102_400, 102_400, 102_400, 51_200]);
        Ok(())
    }

    #[test]
    fn cache_names_differ_per_collection() {
        assert_ne!(cache_file_name("a", "k"), cache_file_name("b", "k"));
        assert_eq!(cache_file_name("a", "k").len(), 64);
    }
}
