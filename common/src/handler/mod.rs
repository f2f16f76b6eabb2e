//! Backend handlers.
//!
//! Every backend is driven through the [`Handler`] trait. A handler reports which
//! [`Capability`]s it actually implements; calling anything else returns
//! [`StorageError::Unsupported`] and callers fall back to read+write.
//!
//! Paths handed to a handler are relative to the endpoint it was built for. A path ending in the
//! delimiter addresses a container, anything else addresses a blob.

use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::{Result, StorageError};
use crate::namespace::Location;
use crate::tree::{Blob, ContainerId, Origin, Tree};

pub mod blockblob;
pub mod filesystem;
pub mod folder;
pub mod ftp;
#[cfg(test)]
pub mod memory;
pub mod objectstore;

pub use blockblob::{BlockBlobClient, BlockBlobHandler};
pub use filesystem::FilesystemHandler;
pub use folder::{FolderClient, FolderHandler};
pub use ftp::{FtpConnector, FtpHandler, FtpSession};
pub use objectstore::{ObjectStoreHandler, StoreKind, StoreSpec};

/// Number of entries requested per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    EnumerateRoot,
    ResolveContainer,
    ResolveBlob,
    ListChildren,
    ListChildrenStreamed,
    Read,
    Write,
    Exists,
    CreateCollection,
    ServerSideCopy,
    Presign,
}

impl Capability {
    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Capability::EnumerateRoot => "enumerate-root",
            Capability::ResolveContainer => "resolve-container",
            Capability::ResolveBlob => "resolve-blob",
            Capability::ListChildren => "list-children",
            Capability::ListChildrenStreamed => "list-children-streamed",
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Exists => "exists",
            Capability::CreateCollection => "create-collection",
            Capability::ServerSideCopy => "server-side-copy",
            Capability::Presign => "presign",
        };
        f.write_str(name)
    }
}

/// Set of capabilities a handler implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    bits: u16,
}

impl Capabilities {
    /// Everything a read+write transfer needs.
    pub const TRANSFER: Capabilities = Capabilities::empty()
        .with(Capability::ResolveContainer)
        .with(Capability::ResolveBlob)
        .with(Capability::ListChildren)
        .with(Capability::ListChildrenStreamed)
        .with(Capability::Read)
        .with(Capability::Write)
        .with(Capability::Exists)
        .with(Capability::CreateCollection);

    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub const fn with(self, capability: Capability) -> Self {
        Self {
            bits: self.bits | capability.bit(),
        }
    }

    #[must_use]
    pub const fn supports(&self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }
}

/// One listing page: a copy of the chain down to the listed container, holding only that page's
/// entries.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tree: Tree,
    pub target: ContainerId,
}

#[must_use]
pub fn unsupported(backend: Origin, capability: Capability) -> StorageError {
    StorageError::Unsupported {
        backend,
        capability,
    }
}

/// Ships a filled page, mapping a dropped receiver to cancellation.
pub(crate) async fn send_page(
    out: &async_channel::Sender<Snapshot>,
    tree: Tree,
    target: ContainerId,
) -> Result<()> {
    out.send(Snapshot { tree, target })
        .await
        .map_err(|_| StorageError::Cancelled)
}

#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn origin(&self) -> Origin;

    fn capabilities(&self) -> Capabilities;

    fn delimiter(&self) -> char {
        '/'
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.capabilities().supports(capability) {
            Ok(())
        } else {
            Err(unsupported(self.origin(), capability))
        }
    }

    /// Names of the backend collections visible to this handler.
    async fn list_collections(&self) -> Result<Vec<String>> {
        Err(unsupported(self.origin(), Capability::EnumerateRoot))
    }

    /// Creates a backend collection; succeeds if it already exists.
    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Resolves a container path to its deepest node, creating the collection when missing.
    async fn resolve_container(&self, path: &str) -> Result<(Tree, ContainerId)>;

    /// Resolves a container that has to exist already, without creating anything. Used for the
    /// source side of a copy and for listings.
    async fn open_container(&self, path: &str) -> Result<(Tree, ContainerId)> {
        self.resolve_container(path).await
    }

    /// Resolves a blob path to metadata only.
    async fn resolve_blob(&self, path: &str) -> Result<Blob>;

    /// Enumerates everything under `target`, sending one [`Snapshot`] per page. `out` is closed
    /// when this returns, both on success and on error.
    async fn list_children_streamed(
        &self,
        tree: Tree,
        target: ContainerId,
        out: async_channel::Sender<Snapshot>,
    ) -> Result<()>;

    /// Fully populates `target` by merging every streamed page into `tree`.
    async fn list_children(&self, tree: &mut Tree, target: ContainerId) -> Result<()> {
        let (page_tree, page_target) = tree.snapshot(target);
        let (tx, rx) = async_channel::bounded(16);
        let producer = self.list_children_streamed(page_tree, page_target, tx);
        let consumer = async {
            while let Ok(page) = rx.recv().await {
                tree.merge(target, &page.tree, page.target);
            }
        };
        let (result, ()) = futures::join!(producer, consumer);
        tree.mark_populated(target);
        result
    }

    /// Stages the blob's bytes in memory or in the cache directory; returns the byte count.
    async fn read(&self, blob: &mut Blob, cache: &CacheConfig) -> Result<u64>;

    /// Writes the staged payload to `blob.dest_name` under `destination`; returns the byte count.
    async fn write(&self, destination: &Location, blob: &Blob) -> Result<u64>;

    async fn exists(&self, destination: &Location, name: &str) -> Result<bool>;

    /// Time-limited URL that lets another service fetch the blob without credentials.
    async fn presign(&self, blob: &Blob, ttl: Duration) -> Result<String> {
        let _ = (blob, ttl);
        Err(unsupported(self.origin(), Capability::Presign))
    }

    /// Asks the backend to fetch `source_url` into `name` under `destination` by itself.
    async fn copy_from_url(
        &self,
        destination: &Location,
        name: &str,
        source_url: &str,
    ) -> Result<()> {
        let _ = (destination, name, source_url);
        Err(unsupported(self.origin(), Capability::ServerSideCopy))
    }
}
