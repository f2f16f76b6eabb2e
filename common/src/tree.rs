//! Backend-agnostic container/blob tree.
//!
//! A [`Tree`] is an arena of [`Container`]s. Slot 0 is always the root: the real backend
//! collection (bucket, blob container, share or addressed directory). Every other node is a
//! virtual directory with a parent index pointing at a node created before it, so following
//! parents always terminates at the root and cycles cannot be formed.
//!
//! Blobs are owned by the container they sit in; that container is the blob's parent.

use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Backend kind a node or blob came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Origin {
    BlockBlob,
    ObjectStore,
    RemoteFolder,
    Ftp,
    Filesystem,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Origin::BlockBlob => "block-blob",
            Origin::ObjectStore => "object-store",
            Origin::RemoteFolder => "remote-folder",
            Origin::Ftp => "ftp",
            Origin::Filesystem => "filesystem",
        };
        f.write_str(name)
    }
}

/// Index of a container within the [`Tree`] that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(usize);

#[derive(Debug, Clone)]
pub struct Container {
    pub name: String,
    pub url: String,
    pub origin: Origin,
    /// Set once enumeration has been attempted for this node.
    pub populated: bool,
    parent: Option<ContainerId>,
    children: Vec<ContainerId>,
    blobs: Vec<Blob>,
}

impl Container {
    fn new(name: String, url: String, origin: Origin, parent: Option<ContainerId>) -> Self {
        Self {
            name,
            url,
            origin,
            populated: false,
            parent,
            children: Vec::new(),
            blobs: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn parent(&self) -> Option<ContainerId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[ContainerId] {
        &self.children
    }

    #[must_use]
    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }
}

/// Where a blob's bytes currently live. A blob never holds more than one payload.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    InMemory(Bytes),
    /// Local file holding the bytes. `owned` files are temporary and removed on release.
    CachedAt { path: PathBuf, owned: bool },
}

#[derive(Debug, Clone)]
pub struct Blob {
    /// Final path segment, no delimiters.
    pub name: String,
    /// Full backend-native key, untouched.
    pub cloud_name: String,
    /// Name relative to the destination container.
    pub dest_name: String,
    /// Name of the backend collection the key lives in.
    pub collection: String,
    pub url: String,
    pub origin: Origin,
    pub size: Option<u64>,
    payload: Payload,
}

impl Blob {
    #[must_use]
    pub fn new(origin: Origin, collection: &str, cloud_name: &str, delimiter: char) -> Self {
        let name = cloud_name
            .rsplit(delimiter)
            .next()
            .unwrap_or(cloud_name)
            .to_string();
        Self {
            dest_name: name.clone(),
            name,
            cloud_name: cloud_name.to_string(),
            collection: collection.to_string(),
            url: String::new(),
            origin,
            size: None,
            payload: Payload::Empty,
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn in_memory(&self) -> bool {
        matches!(self.payload, Payload::InMemory(_))
    }

    #[must_use]
    pub fn data_in_memory(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::InMemory(data) => Some(data),
            _ => None,
        }
    }

    #[must_use]
    pub fn data_cached_at(&self) -> Option<&Path> {
        match &self.payload {
            Payload::CachedAt { path, .. } => Some(path),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_payload(&self) -> bool {
        !matches!(self.payload, Payload::Empty)
    }

    /// Replaces the payload, returning the previous one so the caller can release it.
    pub fn set_payload(&mut self, payload: Payload) -> Payload {
        std::mem::replace(&mut self.payload, payload)
    }

    pub fn take_payload(&mut self) -> Payload {
        std::mem::take(&mut self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Container>,
}

impl Tree {
    #[must_use]
    pub fn new(origin: Origin, collection: &str, url: &str) -> Self {
        Self {
            nodes: vec![Container::new(
                collection.to_string(),
                url.to_string(),
                origin,
                None,
            )],
        }
    }

    #[must_use]
    pub fn root(&self) -> ContainerId {
        ContainerId(0)
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.nodes.iter().map(|node| node.blobs.len()).sum()
    }

    pub fn mark_populated(&mut self, id: ContainerId) {
        self.nodes[id.0].populated = true;
    }

    /// Case-sensitive lookup of a direct child by name.
    #[must_use]
    pub fn child(&self, parent: ContainerId, name: &str) -> Option<ContainerId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].name == name)
    }

    pub fn find_or_create_child(&mut self, parent: ContainerId, name: &str) -> ContainerId {
        if let Some(existing) = self.child(parent, name) {
            return existing;
        }
        let parent_node = &self.nodes[parent.0];
        let url = format!("{}/{}", parent_node.url.trim_end_matches('/'), name);
        let node = Container::new(name.to_string(), url, parent_node.origin, Some(parent));
        let id = ContainerId(self.nodes.len());
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn add_blob(&mut self, parent: ContainerId, blob: Blob) {
        self.nodes[parent.0].blobs.push(blob);
    }

    /// Yields `id` and then each of its ancestors up to and including the root.
    pub fn ancestors(&self, id: ContainerId) -> impl Iterator<Item = ContainerId> + '_ {
        std::iter::successors(Some(id), move |current| self.nodes[current.0].parent)
    }

    #[must_use]
    pub fn root_of(&self, id: ContainerId) -> ContainerId {
        self.ancestors(id).last().unwrap_or(id)
    }

    /// Names of the virtual directories between the root and `id`, root excluded.
    #[must_use]
    pub fn vdir_names(&self, id: ContainerId) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .ancestors(id)
            .filter(|current| !self.nodes[current.0].is_root())
            .map(|current| self.nodes[current.0].name.as_str())
            .collect();
        names.reverse();
        names
    }

    /// Copies the chain from the root down to `id`, without any children or blobs.
    ///
    /// Handlers fill one snapshot per listing page so pages can be shipped independently.
    #[must_use]
    pub fn snapshot(&self, id: ContainerId) -> (Tree, ContainerId) {
        let root = &self.nodes[0];
        let mut snapshot = Tree::new(root.origin, &root.name, &root.url);
        let mut current = snapshot.root();
        for name in self.vdir_names(id) {
            current = snapshot.find_or_create_child(current, name);
        }
        (snapshot, current)
    }

    /// Folds the subtree under `from` in `other` into `at`, reusing containers with equal names
    /// and skipping blobs whose native key is already present.
    pub fn merge(&mut self, at: ContainerId, other: &Tree, from: ContainerId) {
        let mut pending = vec![(at, from)];
        while let Some((into, source)) = pending.pop() {
            let source_node = &other.nodes[source.0];
            if source_node.populated {
                self.nodes[into.0].populated = true;
            }
            for blob in &source_node.blobs {
                let known = self.nodes[into.0]
                    .blobs
                    .iter()
                    .any(|existing| existing.cloud_name == blob.cloud_name);
                if !known {
                    self.nodes[into.0].blobs.push(blob.clone());
                }
            }
            for child in &source_node.children {
                let child_node = &other.nodes[child.0];
                let target = self.find_or_create_child(into, &child_node.name);
                pending.push((target, *child));
            }
        }
    }
}

impl std::ops::Index<ContainerId> for Tree {
    type Output = Container;

    fn index(&self, id: ContainerId) -> &Container {
        &self.nodes[id.0]
    }
}
