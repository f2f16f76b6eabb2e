//! Local filesystem.
//!
//! The addressed directory is the collection and keys are `/`-separated paths relative to it.
//! Reading a local file does not copy it anywhere: the blob simply points at the file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::instrument;

use super::{Capabilities, Handler, Snapshot, send_page};
use crate::cache::{self, CacheConfig};
use crate::error::{Result, StorageError};
use crate::namespace::{self, Entry, Location};
use crate::tree::{Blob, ContainerId, Origin, Payload, Tree};

#[derive(Debug, Clone)]
pub struct FilesystemHandler {
    page_size: usize,
}

impl Default for FilesystemHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: super::DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn local_path(collection: &str, key: &str) -> PathBuf {
        let joined = namespace::join_path(collection, key, '/');
        if joined.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(joined)
        }
    }

    fn directory_tree(collection: &str) -> (Tree, ContainerId) {
        let url = Self::url(Path::new(collection));
        let tree = Tree::new(Origin::Filesystem, collection, &url);
        let root = tree.root();
        (tree, root)
    }

    fn url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    /// Sizes of the regular files in `dir` and the names of its subdirectories. Symlinks are
    /// followed for files only.
    async fn read_dir(dir: &Path) -> Result<(Vec<(String, u64)>, Vec<String>)> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|err| StorageError::from_io(dir.display().to_string(), err))?;
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(StorageError::from_io(dir.display().to_string(), err)),
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("skipping non utf-8 name in {:?}", dir);
                continue;
            };
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| StorageError::from_io(name.clone(), err))?;
            if file_type.is_dir() {
                dirs.push(name);
                continue;
            }
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!("skipping {:?}: {}", entry.path(), err);
                    continue;
                }
            };
            if metadata.is_file() {
                files.push((name, metadata.len()));
            } else {
                tracing::debug!("skipping {:?}, not a regular file", entry.path());
            }
        }
        files.sort();
        dirs.sort();
        Ok((files, dirs))
    }
}

#[async_trait::async_trait]
impl Handler for FilesystemHandler {
    fn origin(&self) -> Origin {
        Origin::Filesystem
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFER
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        tokio::fs::create_dir_all(name)
            .await
            .map_err(|err| StorageError::from_io(name, err))
    }

    #[instrument(skip(self))]
    async fn resolve_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let collection = namespace::split_directory_path(path, self.delimiter())?;
        self.create_collection(&collection).await?;
        Ok(Self::directory_tree(&collection))
    }

    #[instrument(skip(self))]
    async fn open_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let collection = namespace::split_directory_path(path, self.delimiter())?;
        let metadata = tokio::fs::metadata(&collection)
            .await
            .map_err(|err| StorageError::from_io(path, err))?;
        if !metadata.is_dir() {
            return Err(StorageError::invalid_path(path, "not a directory"));
        }
        Ok(Self::directory_tree(&collection))
    }

    #[instrument(skip(self))]
    async fn resolve_blob(&self, path: &str) -> Result<Blob> {
        let (dir, name) = namespace::split_file_path(path, self.delimiter())?;
        let local = Self::local_path(&dir, &name);
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|err| StorageError::from_io(path, err))?;
        if metadata.is_dir() {
            return Err(StorageError::invalid_path(
                path,
                "addresses a directory, add a trailing delimiter",
            ));
        }
        Ok(Blob::new(Origin::Filesystem, &dir, &name, self.delimiter())
            .with_url(Self::url(&local))
            .with_size(Some(metadata.len())))
    }

    /// One page per directory chunk, breadth-first.
    #[instrument(skip(self, tree, out))]
    async fn list_children_streamed(
        &self,
        tree: Tree,
        target: ContainerId,
        out: async_channel::Sender<Snapshot>,
    ) -> Result<()> {
        let location = namespace::decompose(&tree, target, self.delimiter());
        let mut pending = std::collections::VecDeque::from([location.prefix.clone()]);
        while let Some(relative_dir) = pending.pop_front() {
            throttle::get_request_token().await;
            let dir = Self::local_path(&location.collection, &relative_dir);
            let (files, dirs) = Self::read_dir(&dir).await?;
            let (mut snapshot, snapshot_target) = tree.snapshot(target);
            let snapshot_root = snapshot.root();
            for name in dirs {
                let key = format!("{relative_dir}{name}");
                namespace::ensure_dir(&mut snapshot, snapshot_root, &key, '/');
                pending.push_back(format!("{key}/"));
            }
            let mut files = files.into_iter().peekable();
            loop {
                for (name, size) in files.by_ref().take(self.page_size) {
                    let key = format!("{relative_dir}{name}");
                    let entry = Entry {
                        url: Self::url(&Self::local_path(&location.collection, &key)),
                        key,
                        size: Some(size),
                    };
                    namespace::reconstruct(&mut snapshot, snapshot_target, entry, '/');
                }
                snapshot.mark_populated(snapshot_target);
                send_page(&out, snapshot, snapshot_target).await?;
                if files.peek().is_none() {
                    break;
                }
                (snapshot, _) = tree.snapshot(target);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, blob, _cache), fields(key = %blob.cloud_name))]
    async fn read(&self, blob: &mut Blob, _cache: &CacheConfig) -> Result<u64> {
        let path = Self::local_path(&blob.collection, &blob.cloud_name);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| StorageError::from_io(path.display().to_string(), err))?;
        let previous = blob.set_payload(Payload::CachedAt { path, owned: false });
        if !matches!(previous, Payload::Empty) {
            tracing::debug!("replaced a staged payload for {}", blob.cloud_name);
        }
        Ok(metadata.len())
    }

    #[instrument(skip(self, blob), fields(name = %blob.dest_name))]
    async fn write(&self, destination: &Location, blob: &Blob) -> Result<u64> {
        let target = Self::local_path(&destination.collection, &destination.key(&blob.dest_name));
        let object = target.display().to_string();
        let written: anyhow::Result<u64> = async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("cannot create directory {parent:?}"))?;
            }
            match blob.payload() {
                Payload::CachedAt { path, .. } => tokio::fs::copy(path, &target)
                    .await
                    .with_context(|| format!("cannot copy {path:?} to {target:?}")),
                _ => {
                    let data = cache::payload_bytes(blob).await?;
                    tokio::fs::write(&target, &data)
                        .await
                        .with_context(|| format!("cannot write {target:?}"))?;
                    Ok(data.len() as u64)
                }
            }
        }
        .await;
        written.map_err(|err| StorageError::transfer(object, err))
    }

    async fn exists(&self, destination: &Location, name: &str) -> Result<bool> {
        let path = Self::local_path(&destination.collection, &destination.key(name));
        match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => Ok(!metadata.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::from_io(path.display().to_string(), err)),
        }
    }
}
