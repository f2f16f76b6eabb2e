//! Hierarchical remote folder stores (Dropbox-style).
//!
//! The addressed folder is the collection; keys are paths relative to it. Large payloads go
//! through an upload session: start with the first chunk, append the following chunks at the
//! current byte offset, finish with the last chunk and the commit info.

use std::sync::Arc;

use bytes::Bytes;
use tracing::instrument;

use super::{Capabilities, Handler, Snapshot, send_page};
use crate::cache::{self, ByteReader, CacheConfig};
use crate::error::{Result, StorageError};
use crate::namespace::{self, Entry, Location};
use crate::tree::{Blob, ContainerId, Origin, Tree};

/// Payloads above this size are uploaded through a session, one chunk at a time.
pub const DEFAULT_SESSION_CHUNK_SIZE: usize = 150 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEntry {
    File { path: String, size: u64 },
    Folder { path: String },
}

impl FolderEntry {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            FolderEntry::File { path, .. } | FolderEntry::Folder { path } => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FolderPage {
    pub entries: Vec<FolderEntry>,
    /// Set while more entries remain.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Add,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub path: String,
    pub mode: WriteMode,
    pub client_modified: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCursor {
    pub session_id: String,
    pub offset: u64,
}

#[async_trait::async_trait]
pub trait FolderClient: Send + Sync {
    fn endpoint(&self) -> String;

    /// Lists `path` recursively, at most `limit` entries per page.
    async fn list_folder(&self, path: &str, limit: usize) -> Result<FolderPage>;

    async fn list_folder_continue(&self, cursor: &str) -> Result<FolderPage>;

    async fn metadata(&self, path: &str) -> Result<Option<FolderEntry>>;

    /// Creates the folder and any missing parents; succeeds if it already exists.
    async fn create_folder(&self, path: &str) -> Result<()>;

    async fn download(&self, path: &str) -> Result<ByteReader>;

    async fn upload(&self, commit: &CommitInfo, data: Bytes) -> Result<()>;

    /// Returns the new session id.
    async fn upload_session_start(&self, data: Bytes) -> Result<String>;

    async fn upload_session_append(&self, cursor: &UploadCursor, data: Bytes) -> Result<()>;

    async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        data: Bytes,
    ) -> Result<()>;
}

pub struct FolderHandler {
    client: Arc<dyn FolderClient>,
    page_size: usize,
    chunk_size: usize,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

impl FolderHandler {
    fn folder_tree(&self, collection: &str) -> (Tree, ContainerId) {
        let url = format!("{}{}", self.client.endpoint(), collection);
        let tree = Tree::new(Origin::RemoteFolder, collection, &url);
        let root = tree.root();
        (tree, root)
    }

    pub fn new(client: Arc<dyn FolderClient>) -> Self {
        Self {
            client,
            page_size: super::DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_SESSION_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn full_path(&self, collection: &str, key: &str) -> String {
        normalize(&namespace::join_path(collection, key, self.delimiter()))
    }

    async fn upload_session(&self, commit: &CommitInfo, mut reader: ByteReader) -> Result<u64> {
        let object = commit.path.as_str();
        let first = cache::read_chunk(&mut reader, self.chunk_size)
            .await
            .map_err(|err| StorageError::transfer(object, err))?;
        let session_id = self.client.upload_session_start(first.clone()).await?;
        let mut cursor = UploadCursor {
            session_id,
            offset: first.len() as u64,
        };
        let mut current = cache::read_chunk(&mut reader, self.chunk_size)
            .await
            .map_err(|err| StorageError::transfer(object, err))?;
        loop {
            let next = cache::read_chunk(&mut reader, self.chunk_size)
                .await
                .map_err(|err| StorageError::transfer(object, err))?;
            if next.is_empty() {
                let size = cursor.offset + current.len() as u64;
                self.client
                    .upload_session_finish(&cursor, commit, current)
                    .await?;
                return Ok(size);
            }
            let appended = current.len() as u64;
            self.client.upload_session_append(&cursor, current).await?;
            cursor.offset += appended;
            current = next;
        }
    }
}

#[async_trait::async_trait]
impl Handler for FolderHandler {
    fn origin(&self) -> Origin {
        Origin::RemoteFolder
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFER
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.client.create_folder(&normalize(name)).await
    }

    #[instrument(skip(self))]
    async fn resolve_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let collection = normalize(&namespace::split_directory_path(path, self.delimiter())?);
        if collection != "/" {
            self.client.create_folder(&collection).await?;
        }
        Ok(self.folder_tree(&collection))
    }

    #[instrument(skip(self))]
    async fn open_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let collection = normalize(&namespace::split_directory_path(path, self.delimiter())?);
        if collection != "/" {
            match self.client.metadata(&collection).await? {
                Some(FolderEntry::Folder { .. }) => {}
                Some(FolderEntry::File { .. }) => {
                    return Err(StorageError::invalid_path(path, "addresses a file"));
                }
                None => return Err(StorageError::NotFound(path.to_string())),
            }
        }
        Ok(self.folder_tree(&collection))
    }

    #[instrument(skip(self))]
    async fn resolve_blob(&self, path: &str) -> Result<Blob> {
        let (dir, name) = namespace::split_file_path(path, self.delimiter())?;
        let dir = normalize(&dir);
        let full = self.full_path(&dir, &name);
        match self.client.metadata(&full).await? {
            Some(FolderEntry::File { size, .. }) => {
                Ok(Blob::new(Origin::RemoteFolder, &dir, &name, self.delimiter())
                    .with_url(format!("{}{}", self.client.endpoint(), full))
                    .with_size(Some(size)))
            }
            Some(FolderEntry::Folder { .. }) => Err(StorageError::invalid_path(
                path,
                "addresses a folder, add a trailing delimiter",
            )),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    #[instrument(skip(self, tree, out))]
    async fn list_children_streamed(
        &self,
        tree: Tree,
        target: ContainerId,
        out: async_channel::Sender<Snapshot>,
    ) -> Result<()> {
        let location = namespace::decompose(&tree, target, self.delimiter());
        let listed = self.full_path(&location.collection, &location.prefix);
        let root_prefix = if location.collection == "/" {
            "/".to_string()
        } else {
            format!("{}/", location.collection)
        };
        throttle::get_request_token().await;
        let mut page = self.client.list_folder(&listed, self.page_size).await?;
        loop {
            let (mut snapshot, snapshot_target) = tree.snapshot(target);
            let snapshot_root = snapshot.root();
            for entry in &page.entries {
                let Some(relative) = entry.path().strip_prefix(root_prefix.as_str()) else {
                    continue;
                };
                if relative.is_empty() {
                    continue;
                }
                match entry {
                    FolderEntry::Folder { .. } => {
                        namespace::ensure_dir(&mut snapshot, snapshot_root, relative, '/');
                    }
                    FolderEntry::File { path, size } => {
                        let entry = Entry {
                            key: relative.to_string(),
                            url: format!("{}{}", self.client.endpoint(), path),
                            size: Some(*size),
                        };
                        namespace::reconstruct(&mut snapshot, snapshot_target, entry, '/');
                    }
                }
            }
            snapshot.mark_populated(snapshot_target);
            send_page(&out, snapshot, snapshot_target).await?;
            let Some(cursor) = page.cursor.take() else {
                return Ok(());
            };
            throttle::get_request_token().await;
            page = self.client.list_folder_continue(&cursor).await?;
        }
    }

    #[instrument(skip(self, blob, cache), fields(key = %blob.cloud_name))]
    async fn read(&self, blob: &mut Blob, cache: &CacheConfig) -> Result<u64> {
        let full = self.full_path(&blob.collection, &blob.cloud_name);
        let reader = self.client.download(&full).await?;
        cache::fill(blob, reader, cache).await
    }

    #[instrument(skip(self, blob), fields(name = %blob.dest_name))]
    async fn write(&self, destination: &Location, blob: &Blob) -> Result<u64> {
        let commit = CommitInfo {
            path: self.full_path(&destination.collection, &destination.key(&blob.dest_name)),
            mode: WriteMode::Overwrite,
            client_modified: chrono::Utc::now(),
        };
        let size = cache::payload_len(blob).await?;
        if size <= self.chunk_size as u64 {
            let data = cache::payload_bytes(blob).await?;
            self.client.upload(&commit, data).await?;
            return Ok(size);
        }
        let reader = cache::open_payload(blob).await?;
        self.upload_session(&commit, reader).await
    }

    async fn exists(&self, destination: &Location, name: &str) -> Result<bool> {
        let full = self.full_path(&destination.collection, &destination.key(name));
        Ok(matches!(
            self.client.metadata(&full).await?,
            Some(FolderEntry::File { .. })
        ))
    }
}
