use std::io;

use thiserror::Error;

use crate::dirent::DirentId;
use crate::identity::{GroupId, UserId};

/// Errors raised by the encrypted stream adapter.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Sealing a chunk failed
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Opening a chunk failed (includes authentication failures)
    #[error("decryption error: {0}")]
    Decryption(String),

    /// Container framing errors (version mismatch, truncation, trailing data)
    #[error("format error: {0}")]
    Format(String),

    /// The stream was already closed
    #[error("stream already closed")]
    Closed,

    #[error("stream I/O error")]
    Io(#[from] io::Error),
}

impl CipherError {
    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    pub fn decryption(msg: impl Into<String>) -> Self {
        Self::Decryption(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

/// Errors raised while reading or writing a metadata section.
///
/// `kind` names the record type of the section ("groups", "users", ...).
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("missing {kind} section header")]
    MissingHeader { kind: &'static str },

    #[error("malformed {kind} section header ({raw})")]
    MalformedHeader {
        kind: &'static str,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The stream ended before `expected` records were read.
    #[error("early end of {kind}: only read {read} of {expected} entries")]
    Truncated {
        kind: &'static str,
        read: usize,
        expected: usize,
    },

    #[error("bad scan on {kind} entry {index}")]
    Scan {
        kind: &'static str,
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("malformed {kind} record at index {index} ({raw})")]
    MalformedRecord {
        kind: &'static str,
        index: usize,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} section header")]
    EncodeHeader {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {kind} section header")]
    WriteHeader {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {kind} entry {index}")]
    Encode {
        kind: &'static str,
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {kind} entry {index}")]
    Write {
        kind: &'static str,
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to flush {kind} section")]
    Flush {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("I/O error reading {kind} section")]
    Io {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to close metadata stream")]
    Close(#[source] CipherError),
}

impl MetadataError {
    /// True when the section ended before all declared records were read.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::MissingHeader { .. })
    }
}

/// A denied operation. Terminal and user-facing, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionsError {
    #[error("user {user} cannot create a dirent in directory {parent} without write permission")]
    Create { user: UserId, parent: DirentId },

    #[error("user {user} cannot update dirent {target} without write permission")]
    Update { user: UserId, target: DirentId },

    #[error("user {user} has no read permission on dirent {target}")]
    Read { user: UserId, target: DirentId },
}

/// Errors from [`MetadataStore`](crate::store::MetadataStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Permission(#[from] PermissionsError),

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("unknown dirent {0}")]
    UnknownDirent(DirentId),

    #[error("dirent {0} is not a directory")]
    NotADirectory(DirentId),

    /// The largest id in the registry is already the maximum value.
    #[error("{kind} id space exhausted")]
    IdSpaceExhausted { kind: &'static str },

    #[error("{kind} section version cannot advance past {max}", max = i64::MAX)]
    VersionOverflow { kind: &'static str },

    #[error("metadata file I/O error")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn as_permission(&self) -> Option<&PermissionsError> {
        match self {
            Self::Permission(err) => Some(err),
            _ => None,
        }
    }
}
