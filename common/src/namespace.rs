//! Mapping between backend-native keys and the container tree.
//!
//! Pure logic, no I/O. Flat stores encode hierarchy as delimiters inside a key; hierarchical
//! stores hand us paths relative to the addressed directory. Both are folded into the same
//! [`Tree`] shape here.

use crate::error::{Result, StorageError};
use crate::tree::{Blob, ContainerId, Tree};

/// Native address of a container: the backend collection plus the key prefix beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub collection: String,
    /// Delimiter-joined virtual directory names, with a trailing delimiter unless empty.
    pub prefix: String,
    pub delimiter: char,
}

impl Location {
    #[must_use]
    pub fn new(collection: &str, prefix: &str, delimiter: char) -> Self {
        Self {
            collection: collection.to_string(),
            prefix: prefix.to_string(),
            delimiter,
        }
    }

    /// Native key of `name` (which may itself contain delimiters) under this location.
    #[must_use]
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// One enumerated object as reported by a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub url: String,
    pub size: Option<u64>,
}

impl Entry {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: String::new(),
            size: None,
        }
    }
}

#[must_use]
pub fn decompose(tree: &Tree, id: ContainerId, delimiter: char) -> Location {
    let root = tree.root_of(id);
    let mut prefix = String::new();
    for name in tree.vdir_names(id) {
        prefix.push_str(name);
        prefix.push(delimiter);
    }
    Location {
        collection: tree[root].name.clone(),
        prefix,
        delimiter,
    }
}

/// Attaches `entry` beneath `base`, creating virtual directories as needed.
///
/// The part of the key already covered by `base`'s prefix is not re-created. Keys that are empty
/// or end with the delimiter are folder markers and produce no blob; `None` is returned for them.
/// Empty segments (`a//b`, `/x`) become virtual directories with an empty name so that
/// [`decompose`] gives back the exact key.
pub fn reconstruct(
    tree: &mut Tree,
    base: ContainerId,
    entry: Entry,
    delimiter: char,
) -> Option<ContainerId> {
    let location = decompose(tree, base, delimiter);
    let relative = entry
        .key
        .strip_prefix(location.prefix.as_str())
        .unwrap_or(&entry.key);
    if relative.is_empty() || relative.ends_with(delimiter) {
        return None;
    }
    let mut leaf = base;
    let mut segments: Vec<&str> = relative.split(delimiter).collect();
    segments.pop();
    for segment in segments {
        leaf = tree.find_or_create_child(leaf, segment);
        tree.mark_populated(leaf);
    }
    let origin = tree[leaf].origin;
    let blob = Blob::new(origin, &location.collection, &entry.key, delimiter)
        .with_url(entry.url)
        .with_size(entry.size);
    tree.add_blob(leaf, blob);
    Some(leaf)
}

/// Finds or creates the container for a relative directory path under `base`.
pub fn ensure_dir(
    tree: &mut Tree,
    base: ContainerId,
    relative: &str,
    delimiter: char,
) -> ContainerId {
    relative
        .split(delimiter)
        .filter(|segment| !segment.is_empty())
        .fold(base, |current, segment| {
            tree.find_or_create_child(current, segment)
        })
}

/// Splits a flat-store container path (`collection/vdir/.../`) into collection and prefix.
pub fn split_container_path(path: &str, delimiter: char) -> Result<(String, String)> {
    if !path.ends_with(delimiter) {
        return Err(StorageError::invalid_path(
            path,
            "a container path must end with the delimiter",
        ));
    }
    let trimmed = path.trim_start_matches(delimiter);
    let (collection, prefix) = trimmed
        .split_once(delimiter)
        .ok_or_else(|| StorageError::NotAddressable(path.to_string()))?;
    if collection.is_empty() {
        return Err(StorageError::NotAddressable(path.to_string()));
    }
    check_segments(path, prefix, delimiter)?;
    Ok((collection.to_string(), prefix.to_string()))
}

/// Splits a flat-store blob path (`collection/key`) into collection and native key.
pub fn split_blob_path(path: &str, delimiter: char) -> Result<(String, String)> {
    if path.is_empty() || path.ends_with(delimiter) {
        return Err(StorageError::invalid_path(
            path,
            "a blob path must not end with the delimiter",
        ));
    }
    let trimmed = path.trim_start_matches(delimiter);
    match trimmed.split_once(delimiter) {
        Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {
            check_segments(path, key, delimiter)?;
            Ok((collection.to_string(), key.to_string()))
        }
        _ => Err(StorageError::NotAddressable(path.to_string())),
    }
}

/// Directory path for hierarchical stores: the whole directory is the collection.
pub fn split_directory_path(path: &str, delimiter: char) -> Result<String> {
    if path.is_empty() {
        return Err(StorageError::NotAddressable(path.to_string()));
    }
    if !path.ends_with(delimiter) {
        return Err(StorageError::invalid_path(
            path,
            "a container path must end with the delimiter",
        ));
    }
    let trimmed = path.trim_end_matches(delimiter);
    if trimmed.is_empty() {
        return Ok(delimiter.to_string());
    }
    Ok(trimmed.to_string())
}

/// File path for hierarchical stores, split into parent directory and file name.
///
/// A bare file name yields an empty directory, meaning "relative to the handler's root".
pub fn split_file_path(path: &str, delimiter: char) -> Result<(String, String)> {
    if path.is_empty() || path.ends_with(delimiter) {
        return Err(StorageError::invalid_path(
            path,
            "a blob path must not end with the delimiter",
        ));
    }
    match path.rsplit_once(delimiter) {
        Some(("", name)) => Ok((delimiter.to_string(), name.to_string())),
        Some((dir, name)) => Ok((dir.to_string(), name.to_string())),
        None => Ok((String::new(), path.to_string())),
    }
}

/// Joins a hierarchical collection path and a key relative to it.
#[must_use]
pub fn join_path(collection: &str, key: &str, delimiter: char) -> String {
    let key = key.trim_start_matches(delimiter);
    if collection.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        collection.to_string()
    } else if collection.ends_with(delimiter) {
        format!("{collection}{key}")
    } else {
        format!("{collection}{delimiter}{key}")
    }
}

fn check_segments(path: &str, rest: &str, delimiter: char) -> Result<()> {
    let doubled: String = [delimiter, delimiter].iter().collect();
    if rest.starts_with(delimiter) || rest.contains(doubled.as_str()) {
        return Err(StorageError::invalid_path(path, "empty path segment"));
    }
    Ok(())
}
