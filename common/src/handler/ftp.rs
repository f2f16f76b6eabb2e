//! FTP servers.
//!
//! A control connection runs one command at a time, so sessions are never shared: each worker
//! borrows one from a small pool and hands it back when done. Broken sessions are dropped
//! instead of returned.

use std::sync::Arc;

use tracing::instrument;

use super::{Capabilities, Handler, Snapshot, send_page};
use crate::cache::{self, ByteReader, CacheConfig};
use crate::error::{Result, StorageError};
use crate::namespace::{self, Entry, Location};
use crate::tree::{Blob, ContainerId, Origin, Tree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// One logged-in control connection.
#[async_trait::async_trait]
pub trait FtpSession: Send {
    /// Direct children of `dir`.
    async fn list(&mut self, dir: &str) -> Result<Vec<FtpEntry>>;

    /// `SIZE`; `None` when the file does not exist.
    async fn size(&mut self, path: &str) -> Result<Option<u64>>;

    async fn retr(&mut self, path: &str) -> Result<ByteReader>;

    async fn stor(&mut self, path: &str, data: ByteReader) -> Result<u64>;

    /// `MKD`; succeeds if the directory already exists. The parent must exist.
    async fn mkdir(&mut self, path: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait FtpConnector: Send + Sync {
    /// e.g. `ftp://host:21`
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn FtpSession>>;
}

struct SessionPool {
    connector: Arc<dyn FtpConnector>,
    idle_tx: async_channel::Sender<Box<dyn FtpSession>>,
    idle_rx: async_channel::Receiver<Box<dyn FtpSession>>,
    slots: Arc<tokio::sync::Semaphore>,
}

impl SessionPool {
    fn new(connector: Arc<dyn FtpConnector>, max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        let (idle_tx, idle_rx) = async_channel::bounded(max_sessions);
        Self {
            connector,
            idle_tx,
            idle_rx,
            slots: Arc::new(tokio::sync::Semaphore::new(max_sessions)),
        }
    }

    async fn borrow(&self) -> Result<PooledSession> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Cancelled)?;
        let session = match self.idle_rx.try_recv() {
            Ok(session) => session,
            Err(_) => {
                tracing::debug!("opening new ftp session to {}", self.connector.endpoint());
                self.connector.connect().await?
            }
        };
        Ok(PooledSession {
            session: Some(session),
            return_tx: self.idle_tx.clone(),
            _permit: permit,
        })
    }
}

/// Returns the session to the pool on drop unless it was discarded.
struct PooledSession {
    session: Option<Box<dyn FtpSession>>,
    return_tx: async_channel::Sender<Box<dyn FtpSession>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledSession {
    fn get(&mut self) -> Result<&mut (dyn FtpSession + 'static)> {
        self.session.as_deref_mut().ok_or(StorageError::Cancelled)
    }

    /// Passes `result` through, dropping the session if it failed with anything but a missing
    /// object.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Err(err) if err.kind() != crate::error::ErrorKind::NotFound => {
                tracing::debug!("discarding ftp session after error: {}", err);
                self.session = None;
            }
            _ => {}
        }
        result
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = self.return_tx.try_send(session);
        }
    }
}

pub struct FtpHandler {
    pool: SessionPool,
}

impl FtpHandler {
    /// `max_sessions` should match the worker count of the jobs using this handler.
    pub fn new(connector: Arc<dyn FtpConnector>, max_sessions: usize) -> Self {
        Self {
            pool: SessionPool::new(connector, max_sessions),
        }
    }

    fn endpoint(&self) -> String {
        self.pool.connector.endpoint()
    }

    fn directory_tree(&self, collection: &str) -> (Tree, ContainerId) {
        let url = format!("{}{}", self.endpoint(), collection);
        let tree = Tree::new(Origin::Ftp, collection, &url);
        let root = tree.root();
        (tree, root)
    }

    fn full_path(&self, collection: &str, key: &str) -> String {
        namespace::join_path(collection, key, self.delimiter())
    }

    /// Creates `dir` and every missing ancestor, one `MKD` per level.
    async fn make_dirs(&self, session: &mut PooledSession, dir: &str) -> Result<()> {
        let mut current = if dir.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };
        for segment in dir.split('/').filter(|segment| !segment.is_empty()) {
            current = self.full_path(&current, segment);
            let result = session.get()?.mkdir(&current).await;
            session.settle(result)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for FtpHandler {
    fn origin(&self) -> Origin {
        Origin::Ftp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFER
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        let mut session = self.pool.borrow().await?;
        self.make_dirs(&mut session, name).await
    }

    #[instrument(skip(self))]
    async fn resolve_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let collection = namespace::split_directory_path(path, self.delimiter())?;
        self.create_collection(&collection).await?;
        Ok(self.directory_tree(&collection))
    }

    #[instrument(skip(self))]
    async fn open_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        let collection = namespace::split_directory_path(path, self.delimiter())?;
        let mut session = self.pool.borrow().await?;
        // LIST fails on a missing directory
        let result = session.get()?.list(&collection).await;
        session.settle(result)?;
        Ok(self.directory_tree(&collection))
    }

    #[instrument(skip(self))]
    async fn resolve_blob(&self, path: &str) -> Result<Blob> {
        let (dir, name) = namespace::split_file_path(path, self.delimiter())?;
        let full = self.full_path(&dir, &name);
        let mut session = self.pool.borrow().await?;
        let result = session.get()?.size(&full).await;
        let size = session
            .settle(result)?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(Blob::new(Origin::Ftp, &dir, &name, self.delimiter())
            .with_url(format!("{}{}", self.endpoint(), full))
            .with_size(Some(size)))
    }

    /// Walks directories breadth-first; each directory listing is one page.
    #[instrument(skip(self, tree, out))]
    async fn list_children_streamed(
        &self,
        tree: Tree,
        target: ContainerId,
        out: async_channel::Sender<Snapshot>,
    ) -> Result<()> {
        let location = namespace::decompose(&tree, target, self.delimiter());
        let mut session = self.pool.borrow().await?;
        let mut pending = std::collections::VecDeque::from([location.prefix.clone()]);
        while let Some(relative_dir) = pending.pop_front() {
            throttle::get_request_token().await;
            let dir = self.full_path(&location.collection, relative_dir.trim_end_matches('/'));
            let result = session.get()?.list(&dir).await;
            let entries = session.settle(result)?;
            let (mut snapshot, snapshot_target) = tree.snapshot(target);
            let snapshot_root = snapshot.root();
            for entry in entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let key = format!("{}{}", relative_dir, entry.name);
                if entry.is_dir {
                    namespace::ensure_dir(&mut snapshot, snapshot_root, &key, '/');
                    pending.push_back(format!("{key}/"));
                } else {
                    let entry = Entry {
                        url: format!(
                            "{}{}",
                            self.endpoint(),
                            self.full_path(&location.collection, &key)
                        ),
                        key,
                        size: Some(entry.size),
                    };
                    namespace::reconstruct(&mut snapshot, snapshot_target, entry, '/');
                }
            }
            snapshot.mark_populated(snapshot_target);
            send_page(&out, snapshot, snapshot_target).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, blob, cache), fields(key = %blob.cloud_name))]
    async fn read(&self, blob: &mut Blob, cache: &CacheConfig) -> Result<u64> {
        let full = self.full_path(&blob.collection, &blob.cloud_name);
        let mut session = self.pool.borrow().await?;
        let result = session.get()?.retr(&full).await;
        let reader = session.settle(result)?;
        // the session stays borrowed until the data connection is drained
        let size = cache::fill(blob, reader, cache).await;
        drop(session);
        size
    }

    #[instrument(skip(self, blob), fields(name = %blob.dest_name))]
    async fn write(&self, destination: &Location, blob: &Blob) -> Result<u64> {
        let full = self.full_path(&destination.collection, &destination.key(&blob.dest_name));
        let reader = cache::open_payload(blob).await?;
        let mut session = self.pool.borrow().await?;
        if let Some((parent, _)) = full
            .rsplit_once('/')
            .filter(|(parent, _)| !parent.is_empty())
        {
            self.make_dirs(&mut session, parent).await?;
        }
        let result = session.get()?.stor(&full, reader).await;
        session.settle(result)
    }

    async fn exists(&self, destination: &Location, name: &str) -> Result<bool> {
        let full = self.full_path(&destination.collection, &destination.key(name));
        let mut session = self.pool.borrow().await?;
        let result = session.get()?.size(&full).await;
        Ok(session.settle(result)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::memory::MemoryFtpServer;
    use bytes::Bytes;

    #[tokio::test]
    async fn write_creates_missing_directories() -> anyhow::Result<()> {
        let server = Arc::new(MemoryFtpServer::new());
        let handler = FtpHandler::new(server.clone(), 2);
        let (tree, target) = handler.resolve_container("/pub/in/").await?;
        let location = namespace::decompose(&tree, target, '/');
        let mut blob = Blob::new(Origin::BlockBlob, "c", "x/y/z.txt", '/');
        blob.dest_name = "x/y/z.txt".to_string();
        blob.set_payload(crate::tree::Payload::InMemory(Bytes::from_static(b"ftp")));
        assert_eq!(handler.write(&location, &blob).await?, 3);
        assert_eq!(server.file("/pub/in/x/y/z.txt").unwrap().as_ref(), b"ftp");
        assert!(handler.exists(&location, "x/y/z.txt").await?);
        assert!(!handler.exists(&location, "x/nope.txt").await?);
        Ok(())
    }

    #[tokio::test]
    async fn listing_walks_directories() -> anyhow::Result<()> {
        let server = Arc::new(MemoryFtpServer::new());
        server.put_file("/pub/a.txt", Bytes::from_static(b"a"));
        server.put_file("/pub/dir1/b.txt", Bytes::from_static(b"b"));
        server.put_file("/pub/dir1/dir2/c.txt", Bytes::from_static(b"c"));
        let handler = FtpHandler::new(server.clone(), 1);
        let (mut tree, target) = handler.resolve_container("/pub/").await?;
        handler.list_children(&mut tree, target).await?;
        assert_eq!(tree.blob_count(), 3);
        let dir1 = tree.child(target, "dir1").unwrap();
        let dir2 = tree.child(dir1, "dir2").unwrap();
        let mut blob = tree[dir2].blobs()[0].clone();
        assert_eq!(blob.cloud_name, "dir1/dir2/c.txt");
        handler.read(&mut blob, &CacheConfig::default()).await?;
        assert_eq!(blob.data_in_memory().unwrap().as_ref(), b"c");
        // a single session was enough and it was reused
        assert_eq!(server.connections(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn nested_listing_from_server_root() -> anyhow::Result<()> {
        let server = Arc::new(MemoryFtpServer::new());
        server.put_file("/top/mid/leaf/x.bin", Bytes::from_static(b"xyz"));
        let handler = FtpHandler::new(server.clone(), 1);
        let (mut tree, root) = handler.resolve_container("/").await?;
        handler.list_children(&mut tree, root).await?;
        assert_eq!(tree.blob_count(), 1);
        let top = tree.child(root, "top").unwrap();
        let mid = tree.child(top, "mid").unwrap();
        let leaf = tree.child(mid, "leaf").unwrap();
        let blob = &tree[leaf].blobs()[0];
        assert_eq!(blob.cloud_name, "top/mid/leaf/x.bin");
        assert_eq!(blob.size, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn open_fails_on_missing_directory() -> anyhow::Result<()> {
        let server = Arc::new(MemoryFtpServer::new());
        server.put_file("/pub/a.txt", Bytes::from_static(b"a"));
        let handler = FtpHandler::new(server.clone(), 1);
        handler.open_container("/pub/").await?;
        assert_eq!(
            handler.open_container("/pbu/").await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
        assert_eq!(
            handler.resolve_blob("/pbu/a.txt").await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_workers_get_their_own_sessions() -> anyhow::Result<()> {
        let server = Arc::new(MemoryFtpServer::new());
        for idx in 0..8 {
            server.put_file(&format!("/pub/{idx}.txt"), Bytes::from(vec![idx as u8; 16]));
        }
        let handler = Arc::new(FtpHandler::new(server.clone(), 3));
        let mut join_set = tokio::task::JoinSet::new();
        for idx in 0..8 {
            let handler = handler.clone();
            join_set.spawn(async move {
                let mut blob = handler.resolve_blob(&format!("/pub/{idx}.txt")).await?;
                handler.read(&mut blob, &CacheConfig::default()).await
            });
        }
        while let Some(result) = join_set.join_next().await {
            assert_eq!(result??, 16);
        }
        assert!(server.connections() <= 3);
        Ok(())
    }
}
