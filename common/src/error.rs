//! Error kinds shared by the tree, the handlers and the copy engine.

use crate::handler::Capability;
use crate::tree::Origin;

/// Plain tag for a [`StorageError`], cheap to copy into summaries and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    NotAddressable,
    InvalidPath,
    NotFound,
    Unsupported,
    TransferFailure,
    AuthFailure,
    InvalidSettings,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotAddressable => "not-addressable",
            ErrorKind::InvalidPath => "invalid-path",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::TransferFailure => "transfer-failure",
            ErrorKind::AuthFailure => "auth-failure",
            ErrorKind::InvalidSettings => "invalid-settings",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("path {0:?} cannot be split into a collection and a prefix")]
    NotAddressable(String),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{0:?} not found")]
    NotFound(String),
    #[error("{backend} backend does not support {capability}")]
    Unsupported {
        backend: Origin,
        capability: Capability,
    },
    #[error("transfer of {object:?} failed: {source:#}")]
    TransferFailure {
        object: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("credentials rejected: {0}")]
    AuthFailure(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotAddressable(_) => ErrorKind::NotAddressable,
            StorageError::InvalidPath { .. } => ErrorKind::InvalidPath,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Unsupported { .. } => ErrorKind::Unsupported,
            StorageError::TransferFailure { .. } => ErrorKind::TransferFailure,
            StorageError::AuthFailure(_) => ErrorKind::AuthFailure,
            StorageError::InvalidSettings(_) => ErrorKind::InvalidSettings,
            StorageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn transfer(object: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        StorageError::TransferFailure {
            object: object.into(),
            source: source.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        StorageError::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Maps an I/O error on `object`, keeping "not found" distinguishable.
    pub fn from_io(object: impl Into<String>, error: std::io::Error) -> Self {
        let object = object.into();
        if error.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(object)
        } else {
            StorageError::transfer(object, error)
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
