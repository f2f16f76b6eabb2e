//! Block blob stores (Azure-style): flat keys inside named containers, uploads staged as blocks
//! and committed with one block list, server-side copy from a presigned URL.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use tracing::instrument;

use super::{Capabilities, Capability, Handler, Snapshot, send_page};
use crate::cache::{self, ByteReader, CacheConfig};
use crate::error::{Result, StorageError};
use crate::namespace::{self, Entry, Location};
use crate::tree::{Blob, ContainerId, Origin, Tree};

/// Block size used when splitting a payload for upload.
pub const DEFAULT_BLOCK_SIZE: usize = cache::READ_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BlobPage {
    pub items: Vec<BlobItem>,
    /// Continuation marker, `None` on the last page.
    pub next_marker: Option<String>,
}

/// Native operations of a block blob service. Implementations must be safe to share between
/// workers.
#[async_trait::async_trait]
pub trait BlockBlobClient: Send + Sync {
    /// Account endpoint, e.g. `https://account.blob.core.windows.net`.
    fn endpoint(&self) -> String;

    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Creates the container; succeeds if it already exists.
    async fn create_container(&self, container: &str) -> Result<()>;

    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        marker: Option<&str>,
        max_results: usize,
    ) -> Result<BlobPage>;

    /// Size of the blob, `None` when it does not exist.
    async fn blob_size(&self, container: &str, name: &str) -> Result<Option<u64>>;

    async fn get_blob(&self, container: &str, name: &str) -> Result<ByteReader>;

    async fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<()>;

    /// Commits the listed blocks, in order, as the blob's content.
    async fn put_block_list(
        &self,
        container: &str,
        name: &str,
        block_ids: &[String],
    ) -> Result<()>;

    async fn sas_url(
        &self,
        container: &str,
        name: &str,
        expiry: chrono::DateTime<chrono::Utc>,
    ) -> Result<String>;

    async fn copy_from_url(&self, container: &str, name: &str, source_url: &str) -> Result<()>;
}

pub struct BlockBlobHandler {
    client: Arc<dyn BlockBlobClient>,
    page_size: usize,
    block_size: usize,
}

/// Fresh block id: base64 of a random UUID, so every id has the same length.
#[must_use]
pub fn new_block_id() -> String {
    base64::engine::general_purpose::STANDARD.encode(uuid::Uuid::new_v4().to_string())
}

impl BlockBlobHandler {
    pub fn new(client: Arc<dyn BlockBlobClient>) -> Self {
        Self {
            client,
            page_size: super::DEFAULT_PAGE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    fn url(&self, container: &str, key: &str) -> String {
        format!("{}/{}/{}", self.client.endpoint(), container, key)
    }

    async fn upload_blocks(
        &self,
        container: &str,
        key: &str,
        mut reader: ByteReader,
    ) -> Result<u64> {
        let mut block_ids = Vec::new();
        let mut size = 0u64;
        loop {
            let chunk = cache::read_chunk(&mut reader, self.block_size)
                .await
                .map_err(|err| StorageError::transfer(key, err))?;
            if chunk.is_empty() {
                break;
            }
            let block_id = new_block_id();
            size += chunk.len() as u64;
            // a failed block leaves the blob uncommitted, staged blocks expire on the service
            self.client.put_block(container, key, &block_id, chunk).await?;
            block_ids.push(block_id);
        }
        tracing::debug!("committing {} blocks for {}/{}", block_ids.len(), container, key);
        self.client.put_block_list(container, key, &block_ids).await?;
        Ok(size)
    }
}

#[async_trait::async_trait]
impl Handler for BlockBlobHandler {
    fn origin(&self) -> Origin {
        Origin::BlockBlob
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFER
            .with(Capability::EnumerateRoot)
            .with(Capability::Presign)
            .with(Capability::ServerSideCopy)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.client.list_containers().await
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.client.create_container(name).await
    }

    #[instrument(skip(self))]
    async fn resolve_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let (collection, prefix) = namespace::split_container_path(path, self.delimiter())?;
        self.client.create_container(&collection).await?;
        let url = format!("{}/{}", self.client.endpoint(), collection);
        let mut tree = Tree::new(Origin::BlockBlob, &collection, &url);
        let root = tree.root();
        let target = namespace::ensure_dir(&mut tree, root, &prefix, self.delimiter());
        Ok((tree, target))
    }

    #[instrument(skip(self))]
    async fn resolve_blob(&self, path: &str) -> Result<Blob> {
        let (collection, key) = namespace::split_blob_path(path, self.delimiter())?;
        let size = self
            .client
            .blob_size(&collection, &key)
            .await?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(Blob::new(Origin::BlockBlob, &collection, &key, self.delimiter())
            .with_url(self.url(&collection, &key))
            .with_size(Some(size)))
    }

    #[instrument(skip(self, tree, out))]
    async fn list_children_streamed(
        &self,
        tree: Tree,
        target: ContainerId,
        out: async_channel::Sender<Snapshot>,
    ) -> Result<()> {
        let location = namespace::decompose(&tree, target, self.delimiter());
        let mut marker: Option<String> = None;
        loop {
            throttle::get_request_token().await;
            let page = self
                .client
                .list_blobs(
                    &location.collection,
                    &location.prefix,
                    marker.as_deref(),
                    self.page_size,
                )
                .await?;
            let (mut snapshot, snapshot_target) = tree.snapshot(target);
            for item in page.items {
                let entry = Entry {
                    url: self.url(&location.collection, &item.name),
                    key: item.name,
                    size: Some(item.size),
                };
                namespace::reconstruct(&mut snapshot, snapshot_target, entry, self.delimiter());
            }
            snapshot.mark_populated(snapshot_target);
            send_page(&out, snapshot, snapshot_target).await?;
            marker = page.next_marker;
            if marker.is_none() {
                return Ok(());
            }
        }
    }

    #[instrument(skip(self, blob, cache), fields(key = %blob.cloud_name))]
    async fn read(&self, blob: &mut Blob, cache: &CacheConfig) -> Result<u64> {
        let reader = self.client.get_blob(&blob.collection, &blob.cloud_name).await?;
        cache::fill(blob, reader, cache).await
    }

    #[instrument(skip(self, blob), fields(name = %blob.dest_name))]
    async fn write(&self, destination: &Location, blob: &Blob) -> Result<u64> {
        let key = destination.key(&blob.dest_name);
        let reader = cache::open_payload(blob).await?;
        self.upload_blocks(&destination.collection, &key, reader).await
    }

    async fn exists(&self, destination: &Location, name: &str) -> Result<bool> {
        let key = destination.key(name);
        Ok(self
            .client
            .blob_size(&destination.collection, &key)
            .await?
            .is_some())
    }

    async fn presign(&self, blob: &Blob, ttl: Duration) -> Result<String> {
        let ttl = chrono::TimeDelta::from_std(ttl)
            .map_err(|err| StorageError::transfer(&blob.cloud_name, err))?;
        self.client
            .sas_url(&blob.collection, &blob.cloud_name, chrono::Utc::now() + ttl)
            .await
    }

    async fn copy_from_url(
        &self,
        destination: &Location,
        name: &str,
        source_url: &str,
    ) -> Result<()> {
        let key = destination.key(name);
        self.client
            .copy_from_url(&destination.collection, &key, source_url)
            .await
    }
}
