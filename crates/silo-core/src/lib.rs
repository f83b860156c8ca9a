//! Identity and plumbing for the silo artifact store.
//!
//! This crate holds the pieces the store layer is built on:
//! content hashes and their encodings, store-path derivation, the NAR
//! serialization, streaming sinks and sources with compression adapters,
//! a bounded worker pool with cooperative interruption, and ed25519
//! signing keys.

pub mod hash;
pub mod io;
pub mod nar;
pub mod pool;
pub mod signing;
pub mod store_path;

pub use hash::{Hash, HashAlgo};
pub use pool::{check_interrupt, Interrupted, ThreadPool};
pub use store_path::{FileIngestionMethod, StoreDir, StorePath};

/// Malformed textual or framed input (derivations, narinfo, NAR streams).
///
/// Carried inside `anyhow` chains so callers can recognize parse failures
/// by downcasting without depending on the message text.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FormatError(pub String);
