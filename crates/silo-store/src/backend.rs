//! The dumb blob transport the store delegates raw I/O to.
//!
//! Keys are UTF-8 relative paths with `/` separators; the backend is a
//! flat key-value space with no directory operations. Real transports
//! (filesystem, HTTP, object store) live outside this crate; the
//! in-memory implementation here backs the test suite.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::StoreError;

/// Single-shot completion for asynchronous fetches. Implementations must
/// invoke it exactly once, with either the bytes or the failure.
pub type FileCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// Raw blob operations the store is built on.
pub trait BlobBackend: Send + Sync {
    /// Fetch a key. Absence is reported as
    /// [`StoreError::NoSuchBinaryCacheFile`], not as an empty value.
    fn fetch(&self, key: &str) -> Result<Vec<u8>>;

    /// Asynchronous fetch; may complete on an arbitrary thread. The
    /// default implementation completes inline.
    fn fetch_async(&self, key: &str, callback: FileCallback) {
        callback(self.fetch(key));
    }

    /// Atomically create or replace a key. No partial visibility.
    fn upsert_file(&self, key: &str, contents: &[u8], mime_type: &str) -> Result<()>;

    /// Advisory existence probe; may race concurrent writers.
    fn file_exists(&self, key: &str) -> Result<bool>;
}

impl<T: BlobBackend + ?Sized> BlobBackend for std::sync::Arc<T> {
    fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        (**self).fetch(key)
    }

    fn fetch_async(&self, key: &str, callback: FileCallback) {
        (**self).fetch_async(key, callback);
    }

    fn upsert_file(&self, key: &str, contents: &[u8], mime_type: &str) -> Result<()> {
        (**self).upsert_file(key, contents, mime_type)
    }

    fn file_exists(&self, key: &str) -> Result<bool> {
        (**self).file_exists(key)
    }
}

/// Fetch a key, translating "no such file" into `None` at this boundary.
/// Transport failures still surface as errors.
pub fn get_file(backend: &dyn BlobBackend, key: &str) -> Result<Option<Vec<u8>>> {
    match backend.fetch(key) {
        Ok(data) => Ok(Some(data)),
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(StoreError::NoSuchBinaryCacheFile(_)) => Ok(None),
            _ => Err(err),
        },
    }
}

/// Reference backend holding blobs in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently present, in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.files
            .lock()
            .expect("backend lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Recorded mime type of a key, if present.
    #[must_use]
    pub fn mime_type(&self, key: &str) -> Option<String> {
        self.files
            .lock()
            .expect("backend lock")
            .get(key)
            .map(|(_, mime)| mime.clone())
    }

    /// Drop a key, simulating an artifact collected behind the store's
    /// back. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.files
            .lock()
            .expect("backend lock")
            .remove(key)
            .is_some()
    }
}

impl BlobBackend for MemoryBackend {
    fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .expect("backend lock")
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StoreError::NoSuchBinaryCacheFile(key.to_string()).into())
    }

    fn upsert_file(&self, key: &str, contents: &[u8], mime_type: &str) -> Result<()> {
        self.files
            .lock()
            .expect("backend lock")
            .insert(key.to_string(), (contents.to_vec(), mime_type.to_string()));
        Ok(())
    }

    fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.files.lock().expect("backend lock").contains_key(key))
    }
}
