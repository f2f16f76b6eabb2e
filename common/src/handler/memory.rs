//! In-process implementations of the native client traits.
//!
//! They keep everything in memory, record the calls made against them and can be told to fail,
//! which makes them the backbone of the handler and copy engine tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;

use super::blockblob::{BlobItem, BlobPage, BlockBlobClient};
use super::folder::{CommitInfo, FolderClient, FolderEntry, FolderPage, UploadCursor};
use super::ftp::{FtpConnector, FtpEntry, FtpSession};
use crate::cache::ByteReader;
use crate::error::{Result, StorageError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reader(data: Bytes) -> ByteReader {
    Box::new(std::io::Cursor::new(data))
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "",
    }
}

/// Calls recorded by [`MemoryBlockBlobClient`].
#[derive(Debug, Clone, Default)]
pub struct BlockBlobCalls {
    /// `(container/name, block id, length)`
    pub put_block: Vec<(String, String, usize)>,
    /// `(container/name, committed ids)`
    pub put_block_list: Vec<(String, Vec<String>)>,
    /// `(container/name, source url)`
    pub copy_from_url: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct BlockAccount {
    containers: BTreeMap<String, BTreeMap<String, Bytes>>,
    staged: HashMap<String, HashMap<String, Bytes>>,
    calls: BlockBlobCalls,
    /// Remaining successful `put_block` calls per `container/name`.
    failing: HashMap<String, usize>,
}

type SharedAccount = Arc<Mutex<BlockAccount>>;

static ACCOUNTS: std::sync::LazyLock<Mutex<HashMap<String, Weak<Mutex<BlockAccount>>>>> =
    std::sync::LazyLock::new(Default::default);

/// Block blob account living in process memory. Accounts are registered by name so a presigned
/// URL from one account can be copied into another.
#[derive(Debug)]
pub struct MemoryBlockBlobClient {
    account: String,
    state: SharedAccount,
}

impl MemoryBlockBlobClient {
    pub fn new(account: &str) -> Self {
        let state = SharedAccount::default();
        lock(&ACCOUNTS).insert(account.to_string(), Arc::downgrade(&state));
        Self {
            account: account.to_string(),
            state,
        }
    }

    pub fn insert(&self, container: &str, name: &str, data: Bytes) {
        lock(&self.state)
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), data);
    }

    #[must_use]
    pub fn get(&self, container: &str, name: &str) -> Option<Bytes> {
        lock(&self.state)
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(name).cloned())
    }

    #[must_use]
    pub fn names(&self, container: &str) -> Vec<String> {
        lock(&self.state)
            .containers
            .get(container)
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn calls(&self) -> BlockBlobCalls {
        lock(&self.state).calls.clone()
    }

    /// Lets `successes` blocks of `container/name` through, then fails every further one.
    pub fn fail_blocks_after(&self, container: &str, name: &str, successes: usize) {
        lock(&self.state)
            .failing
            .insert(format!("{container}/{name}"), successes);
    }

    fn account_state(&self, account: &str) -> Option<SharedAccount> {
        if account == self.account {
            return Some(self.state.clone());
        }
        lock(&ACCOUNTS).get(account).and_then(Weak::upgrade)
    }
}

#[async_trait::async_trait]
impl BlockBlobClient for MemoryBlockBlobClient {
    fn endpoint(&self) -> String {
        format!("memory://{}", self.account)
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state).containers.keys().cloned().collect())
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        lock(&self.state)
            .containers
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        marker: Option<&str>,
        max_results: usize,
    ) -> Result<BlobPage> {
        let state = lock(&self.state);
        let blobs = state
            .containers
            .get(container)
            .ok_or_else(|| StorageError::NotFound(container.to_string()))?;
        let mut matching = blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| marker.is_none_or(|marker| name.as_str() > marker));
        let items: Vec<BlobItem> = matching
            .by_ref()
            .take(max_results)
            .map(|(name, data)| BlobItem {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect();
        let next_marker = match matching.next() {
            Some(_) => items.last().map(|item| item.name.clone()),
            None => None,
        };
        Ok(BlobPage { items, next_marker })
    }

    async fn blob_size(&self, container: &str, name: &str) -> Result<Option<u64>> {
        Ok(self.get(container, name).map(|data| data.len() as u64))
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<ByteReader> {
        self.get(container, name)
            .map(reader)
            .ok_or_else(|| StorageError::NotFound(format!("{container}/{name}")))
    }

    async fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<()> {
        let key = format!("{container}/{name}");
        let mut state = lock(&self.state);
        if let Some(remaining) = state.failing.get_mut(&key) {
            if *remaining == 0 {
                return Err(StorageError::transfer(
                    key,
                    anyhow::anyhow!("injected block upload failure"),
                ));
            }
            *remaining -= 1;
        }
        state
            .calls
            .put_block
            .push((key.clone(), block_id.to_string(), data.len()));
        state
            .staged
            .entry(key)
            .or_default()
            .insert(block_id.to_string(), data);
        Ok(())
    }

    async fn put_block_list(
        &self,
        container: &str,
        name: &str,
        block_ids: &[String],
    ) -> Result<()> {
        let key = format!("{container}/{name}");
        let mut state = lock(&self.state);
        let staged = state.staged.remove(&key).unwrap_or_default();
        let mut content = Vec::new();
        for block_id in block_ids {
            let block = staged.get(block_id).ok_or_else(|| {
                StorageError::transfer(&key, anyhow::anyhow!("unknown block id {block_id}"))
            })?;
            content.extend_from_slice(block);
        }
        state
            .calls
            .put_block_list
            .push((key, block_ids.to_vec()));
        state
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), Bytes::from(content));
        Ok(())
    }

    async fn sas_url(
        &self,
        container: &str,
        name: &str,
        expiry: chrono::DateTime<chrono::Utc>,
    ) -> Result<String> {
        if self.get(container, name).is_none() {
            return Err(StorageError::NotFound(format!("{container}/{name}")));
        }
        Ok(format!(
            "{}/{}/{}?se={}&sig=memory",
            self.endpoint(),
            container,
            name,
            expiry.timestamp()
        ))
    }

    async fn copy_from_url(&self, container: &str, name: &str, source_url: &str) -> Result<()> {
        let malformed = || StorageError::invalid_path(source_url, "not a presigned memory url");
        let (path, query) = source_url
            .strip_prefix("memory://")
            .and_then(|rest| rest.split_once('?'))
            .ok_or_else(malformed)?;
        let expiry: i64 = query
            .split('&')
            .find_map(|param| param.strip_prefix("se="))
            .and_then(|value| value.parse().ok())
            .ok_or_else(malformed)?;
        if expiry < chrono::Utc::now().timestamp() {
            return Err(StorageError::AuthFailure(format!(
                "presigned url for {path} has expired"
            )));
        }
        let mut parts = path.splitn(3, '/');
        let (Some(account), Some(source_container), Some(source_name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let source = self
            .account_state(account)
            .ok_or_else(|| StorageError::NotFound(format!("account {account}")))?;
        let data = lock(&source)
            .containers
            .get(source_container)
            .and_then(|blobs| blobs.get(source_name).cloned())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let mut state = lock(&self.state);
        state
            .calls
            .copy_from_url
            .push((format!("{container}/{name}"), source_url.to_string()));
        state
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), data);
        Ok(())
    }
}

/// Calls recorded by [`MemoryFolderClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderCall {
    CreateFolder { path: String },
    Upload { path: String, len: usize },
    SessionStart { len: usize },
    SessionAppend { offset: u64, len: usize },
    SessionFinish { offset: u64, len: usize, path: String },
}

#[derive(Debug, Default)]
struct FolderState {
    files: BTreeMap<String, Bytes>,
    folders: BTreeSet<String>,
    sessions: HashMap<String, Vec<u8>>,
    calls: Vec<FolderCall>,
    next_session: usize,
}

impl FolderState {
    fn add_folders(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current = format!("{current}/{segment}");
            self.folders.insert(current.clone());
        }
    }

    fn store(&mut self, path: &str, data: Bytes) {
        let parent = parent_of(path).to_string();
        self.add_folders(&parent);
        self.files.insert(path.to_string(), data);
    }

    fn entries_under(&self, path: &str) -> Vec<FolderEntry> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let folders = self
            .folders
            .iter()
            .filter(|folder| folder.starts_with(&prefix))
            .map(|folder| FolderEntry::Folder {
                path: folder.clone(),
            });
        let files = self
            .files
            .iter()
            .filter(|(file, _)| file.starts_with(&prefix))
            .map(|(file, data)| FolderEntry::File {
                path: file.clone(),
                size: data.len() as u64,
            });
        folders.chain(files).collect()
    }
}

/// Remote folder service living in process memory. Paths are absolute, `/`-separated.
#[derive(Debug, Default)]
pub struct MemoryFolderClient {
    state: Mutex<FolderState>,
}

impl MemoryFolderClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, path: &str, data: Bytes) {
        lock(&self.state).store(path, data);
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<Bytes> {
        lock(&self.state).files.get(path).cloned()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<FolderCall> {
        lock(&self.state).calls.clone()
    }

    fn page(entries: Vec<FolderEntry>, start: usize, limit: usize, path: &str) -> FolderPage {
        let end = (start + limit).min(entries.len());
        let cursor = (end < entries.len()).then(|| format!("{end}:{limit}:{path}"));
        FolderPage {
            entries: entries[start..end].to_vec(),
            cursor,
        }
    }
}

const MEMORY_FOLDER_LIMIT: usize = 2000;

#[async_trait::async_trait]
impl FolderClient for MemoryFolderClient {
    fn endpoint(&self) -> String {
        "memory-folder://".to_string()
    }

    async fn list_folder(&self, path: &str, limit: usize) -> Result<FolderPage> {
        let state = lock(&self.state);
        if path != "/" && !state.folders.contains(path) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        let entries = state.entries_under(path);
        let limit = limit.clamp(1, MEMORY_FOLDER_LIMIT);
        Ok(Self::page(entries, 0, limit, path))
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<FolderPage> {
        let invalid = || StorageError::invalid_path(cursor, "malformed cursor");
        let mut parts = cursor.splitn(3, ':');
        let (Some(start), Some(limit), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let start: usize = start.parse().map_err(|_| invalid())?;
        let limit: usize = limit.parse().map_err(|_| invalid())?;
        let entries = lock(&self.state).entries_under(path);
        Ok(Self::page(entries, start, limit, path))
    }

    async fn metadata(&self, path: &str) -> Result<Option<FolderEntry>> {
        let state = lock(&self.state);
        if let Some(data) = state.files.get(path) {
            return Ok(Some(FolderEntry::File {
                path: path.to_string(),
                size: data.len() as u64,
            }));
        }
        Ok(state.folders.contains(path).then(|| FolderEntry::Folder {
            path: path.to_string(),
        }))
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(FolderCall::CreateFolder {
            path: path.to_string(),
        });
        state.add_folders(path);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<ByteReader> {
        self.file(path)
            .map(reader)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn upload(&self, commit: &CommitInfo, data: Bytes) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(FolderCall::Upload {
            path: commit.path.clone(),
            len: data.len(),
        });
        state.store(&commit.path, data);
        Ok(())
    }

    async fn upload_session_start(&self, data: Bytes) -> Result<String> {
        let mut state = lock(&self.state);
        state.next_session += 1;
        let session_id = format!("session-{}", state.next_session);
        state.calls.push(FolderCall::SessionStart { len: data.len() });
        state.sessions.insert(session_id.clone(), data.to_vec());
        Ok(session_id)
    }

    async fn upload_session_append(&self, cursor: &UploadCursor, data: Bytes) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(FolderCall::SessionAppend {
            offset: cursor.offset,
            len: data.len(),
        });
        let buffer = state
            .sessions
            .get_mut(&cursor.session_id)
            .ok_or_else(|| StorageError::NotFound(cursor.session_id.clone()))?;
        if buffer.len() as u64 != cursor.offset {
            return Err(StorageError::transfer(
                &cursor.session_id,
                anyhow::anyhow!("incorrect offset {}, expected {}", cursor.offset, buffer.len()),
            ));
        }
        buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadCursor,
        commit: &CommitInfo,
        data: Bytes,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(FolderCall::SessionFinish {
            offset: cursor.offset,
            len: data.len(),
            path: commit.path.clone(),
        });
        let mut buffer = state
            .sessions
            .remove(&cursor.session_id)
            .ok_or_else(|| StorageError::NotFound(cursor.session_id.clone()))?;
        if buffer.len() as u64 != cursor.offset {
            return Err(StorageError::transfer(
                &cursor.session_id,
                anyhow::anyhow!("incorrect offset {}, expected {}", cursor.offset, buffer.len()),
            ));
        }
        buffer.extend_from_slice(&data);
        state.store(&commit.path, Bytes::from(buffer));
        Ok(())
    }
}

#[derive(Debug)]
struct FtpFs {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

/// FTP server living in process memory; every `connect` opens a new session.
#[derive(Debug)]
pub struct MemoryFtpServer {
    fs: Arc<Mutex<FtpFs>>,
    connections: AtomicUsize,
}

impl Default for MemoryFtpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFtpServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fs: Arc::new(Mutex::new(FtpFs {
                files: BTreeMap::new(),
                dirs: BTreeSet::from(["/".to_string()]),
            })),
            connections: AtomicUsize::new(0),
        }
    }

    /// Stores a file, creating its directories.
    pub fn put_file(&self, path: &str, data: Bytes) {
        let mut fs = lock(&self.fs);
        let mut current = String::new();
        for segment in parent_of(path).split('/').filter(|segment| !segment.is_empty()) {
            current = format!("{current}/{segment}");
            fs.dirs.insert(current.clone());
        }
        fs.files.insert(path.to_string(), data);
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<Bytes> {
        lock(&self.fs).files.get(path).cloned()
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FtpConnector for MemoryFtpServer {
    fn endpoint(&self) -> String {
        "ftp://memory".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn FtpSession>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFtpSession {
            fs: self.fs.clone(),
        }))
    }
}

struct MemoryFtpSession {
    fs: Arc<Mutex<FtpFs>>,
}

#[async_trait::async_trait]
impl FtpSession for MemoryFtpSession {
    async fn list(&mut self, dir: &str) -> Result<Vec<FtpEntry>> {
        let fs = lock(&self.fs);
        if !fs.dirs.contains(dir) {
            return Err(StorageError::NotFound(dir.to_string()));
        }
        let dirs = fs
            .dirs
            .iter()
            .filter(|path| path.as_str() != "/" && parent_of(path) == dir)
            .map(|path| FtpEntry {
                name: path.rsplit('/').next().unwrap_or_default().to_string(),
                is_dir: true,
                size: 0,
            });
        let files = fs
            .files
            .iter()
            .filter(|(path, _)| parent_of(path) == dir)
            .map(|(path, data)| FtpEntry {
                name: path.rsplit('/').next().unwrap_or_default().to_string(),
                is_dir: false,
                size: data.len() as u64,
            });
        Ok(dirs.chain(files).collect())
    }

    async fn size(&mut self, path: &str) -> Result<Option<u64>> {
        Ok(lock(&self.fs)
            .files
            .get(path)
            .map(|data| data.len() as u64))
    }

    async fn retr(&mut self, path: &str) -> Result<ByteReader> {
        lock(&self.fs)
            .files
            .get(path)
            .cloned()
            .map(reader)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn stor(&mut self, path: &str, mut data: ByteReader) -> Result<u64> {
        let parent = parent_of(path).to_string();
        if !parent.is_empty() && !lock(&self.fs).dirs.contains(&parent) {
            return Err(StorageError::transfer(
                path,
                anyhow::anyhow!("550 {parent}: no such directory"),
            ));
        }
        let mut buffer = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut data, &mut buffer)
            .await
            .map_err(|err| StorageError::transfer(path, err))?;
        let size = buffer.len() as u64;
        lock(&self.fs)
            .files
            .insert(path.to_string(), Bytes::from(buffer));
        Ok(size)
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let mut fs = lock(&self.fs);
        let parent = parent_of(path);
        if !parent.is_empty() && !fs.dirs.contains(parent) {
            return Err(StorageError::transfer(
                path,
                anyhow::anyhow!("550 {parent}: no such directory"),
            ));
        }
        fs.dirs.insert(path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_listing_pages() -> anyhow::Result<()> {
        let client = MemoryBlockBlobClient::new("memory-listing");
        for name in ["a", "b", "c"] {
            client.insert("c", name, Bytes::from_static(b"x"));
        }
        let first = client.list_blobs("c", "", None, 2).await?;
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_marker.as_deref(), Some("b"));
        let second = client.list_blobs("c", "", Some("b"), 2).await?;
        assert_eq!(second.items[0].name, "c");
        assert!(second.next_marker.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expired_presigned_url_is_rejected() -> anyhow::Result<()> {
        let client = MemoryBlockBlobClient::new("memory-expired");
        client.insert("c", "a", Bytes::from_static(b"x"));
        let url = client
            .sas_url("c", "a", chrono::Utc::now() - chrono::TimeDelta::seconds(5))
            .await?;
        let err = client.copy_from_url("d", "a", &url).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthFailure);
        Ok(())
    }

    #[tokio::test]
    async fn folder_cursor_pages() -> anyhow::Result<()> {
        let client = MemoryFolderClient::new();
        for idx in 0..5 {
            client.put_file(&format!("/f/{idx}"), Bytes::from_static(b"x"));
        }
        let mut page = client.list_folder("/f", 2).await?;
        let mut seen = page.entries.len();
        while let Some(cursor) = page.cursor.take() {
            page = client.list_folder_continue(&cursor).await?;
            seen += page.entries.len();
        }
        assert_eq!(seen, 5);
        Ok(())
    }

    #[tokio::test]
    async fn ftp_mkdir_needs_parent() -> anyhow::Result<()> {
        let server = MemoryFtpServer::new();
        let mut session = server.connect().await?;
        assert!(session.mkdir("/a/b").await.is_err());
        session.mkdir("/a").await?;
        session.mkdir("/a/b").await?;
        session.mkdir("/a/b").await?;
        assert_eq!(session.list("/a").await?.len(), 1);
        Ok(())
    }
}
