//! Typed store failures.
//!
//! These are carried inside `anyhow` chains so call sites can attach
//! context freely while callers still dispatch on the failure kind by
//! downcasting.

use thiserror::Error;

/// Semantic failures of store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A queried path has no metadata in this store.
    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    /// A path cannot be added because one of its references is unknown.
    #[error("cannot add '{path}' to the binary cache because the reference '{reference}' is not valid")]
    MissingReference { path: String, reference: String },

    /// The backend has no blob under the requested key.
    #[error("file '{0}' does not exist in binary cache")]
    NoSuchBinaryCacheFile(String),

    /// Path metadata promised a blob that has since vanished.
    #[error("the NAR for '{0}' has disappeared from the binary cache")]
    SubstituteGone(String),

    /// The archive bytes do not match the hash the caller declared.
    #[error("refusing to copy corrupted path '{0}' to binary cache")]
    CorruptedPath(String),

    /// Ingested bytes do not start with the archive magic.
    #[error("NAR for '{0}' does not start with the archive magic")]
    BadArchiveMagic(String),

    /// The cache was created for a different store prefix.
    #[error("binary cache '{uri}' is for stores with prefix '{cache_dir}', not '{store_dir}'")]
    WrongStoreDir {
        uri: String,
        cache_dir: String,
        store_dir: String,
    },
}
