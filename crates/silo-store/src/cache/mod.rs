//! The binary cache store.
//!
//! Layers the store contract over a dumb blob backend: metadata lives in
//! `<hashPart>.narinfo` keys, archives under `nar/<fileHash>.nar[.ext]`,
//! with advisory caching in front of every metadata read. Operations are
//! reentrant; shared state sits behind short-lived locks or atomics.

mod disk;
mod ingest;
mod path_info;

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tracing::debug;
use url::Url;

use silo_core::io::{CountingSink, DecompressionSink, Sink, VecSink};
use silo_core::signing::SecretKey;
use silo_core::store_path::{StoreDir, StorePath};
use silo_core::FormatError;

use crate::backend::{get_file, BlobBackend, FileCallback};
use crate::config::CacheConfig;
use crate::derivation::{parse_derivation, Derivation, DerivationResolver, DrvHashes};
use crate::error::StoreError;
use crate::narinfo::NarInfo;

use disk::{DiskCache, DiskCacheHit};
use path_info::PathInfoCache;

pub(crate) const CACHE_INFO_KEY: &str = "nix-cache-info";

pub(crate) const MIME_CACHE_INFO: &str = "text/x-nix-cache-info";
pub(crate) const MIME_NARINFO: &str = "text/x-nix-narinfo";
pub(crate) const MIME_NAR: &str = "application/x-nix-nar";
pub(crate) const MIME_JSON: &str = "application/json";

/// Operation counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub nar_info_read: AtomicU64,
    pub nar_info_write: AtomicU64,
    pub nar_write: AtomicU64,
    pub nar_write_averted: AtomicU64,
    pub nar_write_bytes: AtomicU64,
    pub nar_write_compressed_bytes: AtomicU64,
    pub nar_write_compression_ms: AtomicU64,
    pub nar_read: AtomicU64,
    pub nar_read_bytes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nar_info_read: u64,
    pub nar_info_write: u64,
    pub nar_write: u64,
    pub nar_write_averted: u64,
    pub nar_write_bytes: u64,
    pub nar_write_compressed_bytes: u64,
    pub nar_read: u64,
    pub nar_read_bytes: u64,
}

impl CacheStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nar_info_read: self.nar_info_read.load(Ordering::Relaxed),
            nar_info_write: self.nar_info_write.load(Ordering::Relaxed),
            nar_write: self.nar_write.load(Ordering::Relaxed),
            nar_write_averted: self.nar_write_averted.load(Ordering::Relaxed),
            nar_write_bytes: self.nar_write_bytes.load(Ordering::Relaxed),
            nar_write_compressed_bytes: self
                .nar_write_compressed_bytes
                .load(Ordering::Relaxed),
            nar_read: self.nar_read.load(Ordering::Relaxed),
            nar_read_bytes: self.nar_read_bytes.load(Ordering::Relaxed),
        }
    }
}

/// An append-only artifact store over a flat blob backend.
pub struct BinaryCacheStore<B: BlobBackend> {
    uri: Url,
    config: CacheConfig,
    backend: B,
    secret_key: Option<SecretKey>,
    path_info_cache: PathInfoCache,
    disk_cache: Option<(DiskCache, i64)>,
    drv_hashes: DrvHashes,
    stats: Arc<CacheStats>,
    /// Peer hints read back from the cache header at `init`.
    priority: AtomicU32,
    want_mass_query: AtomicBool,
}

impl<B: BlobBackend> BinaryCacheStore<B> {
    /// Wire a store up to a backend. Call [`Self::init`] before use.
    pub fn open(uri: &str, config: CacheConfig, backend: B) -> Result<Self> {
        let uri = Url::parse(uri).with_context(|| format!("invalid cache URI '{uri}'"))?;
        let secret_key = match &config.secret_key_file {
            Some(path) => Some(SecretKey::load(path)?),
            None => None,
        };
        let disk_cache = match &config.disk_cache_dir {
            Some(dir) => {
                let cache = DiskCache::open(dir)?;
                let id = cache.cache_id(uri.as_str())?;
                Some((cache, id))
            }
            None => None,
        };
        let priority = AtomicU32::new(config.priority);
        let want_mass_query = AtomicBool::new(config.want_mass_query);
        Ok(Self {
            uri,
            config,
            backend,
            secret_key,
            path_info_cache: PathInfoCache::new(),
            disk_cache,
            drv_hashes: DrvHashes::new(),
            stats: Arc::new(CacheStats::default()),
            priority,
            want_mass_query,
        })
    }

    /// Read the cache header, writing one into an empty cache. Fails when
    /// the cache belongs to a different store prefix.
    pub fn init(&self) -> Result<()> {
        match get_file(&self.backend, CACHE_INFO_KEY)? {
            None => {
                let contents = format!("StoreDir: {}\n", self.config.store_dir);
                self.backend
                    .upsert_file(CACHE_INFO_KEY, contents.as_bytes(), MIME_CACHE_INFO)
            }
            Some(data) => {
                let text = String::from_utf8(data).map_err(|e| {
                    FormatError(format!("cache header of '{}' is not UTF-8: {e}", self.uri))
                })?;
                for line in text.lines() {
                    let Some((name, value)) = line.split_once(':') else {
                        continue;
                    };
                    let value = value.trim();
                    match name {
                        "StoreDir" => {
                            if value != self.config.store_dir.as_str() {
                                return Err(StoreError::WrongStoreDir {
                                    uri: self.uri.to_string(),
                                    cache_dir: value.to_string(),
                                    store_dir: self.config.store_dir.to_string(),
                                }
                                .into());
                            }
                        }
                        "WantMassQuery" => {
                            self.want_mass_query.store(value == "1", Ordering::Relaxed);
                        }
                        "Priority" => {
                            let priority = value.parse::<u32>().map_err(|e| {
                                FormatError(format!(
                                    "bad Priority in cache header of '{}': {e}",
                                    self.uri
                                ))
                            })?;
                            self.priority.store(priority, Ordering::Relaxed);
                        }
                        // Unknown keys are reserved for newer peers.
                        _ => {}
                    }
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    #[must_use]
    pub fn store_dir(&self) -> &StoreDir {
        &self.config.store_dir
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn want_mass_query(&self) -> bool {
        self.want_mass_query.load(Ordering::Relaxed)
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn secret_key(&self) -> Option<&SecretKey> {
        self.secret_key.as_ref()
    }

    fn narinfo_key(path: &StorePath) -> String {
        format!("{}.narinfo", path.hash_part())
    }

    /// Whether the cache holds metadata for this path, consulting the
    /// cache tiers before the backend.
    pub fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        if let Some(cached) = self.path_info_cache.lookup(path.hash_part()) {
            return Ok(cached.value.is_some());
        }
        if let Some((disk, id)) = &self.disk_cache {
            if let Some(hit) = disk.lookup(*id, path.hash_part())? {
                return Ok(matches!(hit, DiskCacheHit::Present(_)));
            }
        }
        self.is_valid_path_uncached(path)
    }

    /// Existence probe against the backend. Checks only the hash part:
    /// two paths sharing it but differing in name alias to the same
    /// metadata key.
    pub fn is_valid_path_uncached(&self, path: &StorePath) -> Result<bool> {
        self.backend.file_exists(&Self::narinfo_key(path))
    }

    /// Asynchronous metadata fetch. The callback receives `Ok(None)` when
    /// the cache has no entry, and is invoked exactly once.
    pub fn query_path_info_uncached(
        &self,
        path: &StorePath,
        callback: Box<dyn FnOnce(Result<Option<NarInfo>>) + Send + 'static>,
    ) {
        let key = Self::narinfo_key(path);
        let store_dir = self.config.store_dir.clone();
        let stats = Arc::clone(&self.stats);
        let path_name = path.to_string();
        debug!(path = %path_name, uri = %self.uri, "querying path info");
        let inner: FileCallback = Box::new(move |result| {
            let outcome = match result {
                Ok(data) => {
                    stats.nar_info_read.fetch_add(1, Ordering::Relaxed);
                    String::from_utf8(data)
                        .map_err(|e| {
                            FormatError(format!("narinfo '{key}' is not UTF-8: {e}")).into()
                        })
                        .and_then(|text| NarInfo::parse(&store_dir, &text, &key))
                        .map(Some)
                }
                Err(err) => match err.downcast_ref::<StoreError>() {
                    Some(StoreError::NoSuchBinaryCacheFile(_)) => Ok(None),
                    _ => Err(err),
                },
            };
            callback(outcome);
        });
        self.backend.fetch_async(&Self::narinfo_key(path), inner);
    }

    fn query_path_info_uncached_sync(&self, path: &StorePath) -> Result<Option<NarInfo>> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.query_path_info_uncached(
            path,
            Box::new(move |result| {
                // A dropped receiver means the waiter gave up; nothing to do.
                let _ = tx.send(result);
            }),
        );
        rx.recv()
            .context("backend dropped the path-info callback")?
    }

    fn lookup_path_info(
        &self,
        path: &StorePath,
        refresh: bool,
    ) -> Result<Option<Arc<NarInfo>>> {
        let hash_part = path.hash_part();

        if !refresh {
            if let Some(cached) = self.path_info_cache.lookup(hash_part) {
                return Ok(cached.value);
            }
            if let Some((disk, id)) = &self.disk_cache {
                match disk.lookup(*id, hash_part)? {
                    Some(DiskCacheHit::Present(text)) => {
                        let narinfo = Arc::new(NarInfo::parse(
                            &self.config.store_dir,
                            &text,
                            &Self::narinfo_key(path),
                        )?);
                        self.path_info_cache
                            .insert(hash_part.to_string(), Some(Arc::clone(&narinfo)));
                        return Ok(Some(narinfo));
                    }
                    Some(DiskCacheHit::Absent) => {
                        self.path_info_cache.insert(hash_part.to_string(), None);
                        return Ok(None);
                    }
                    None => {}
                }
            }
        }

        let fetched = self.query_path_info_uncached_sync(path)?.map(Arc::new);
        self.path_info_cache
            .insert(hash_part.to_string(), fetched.clone());
        if let Some((disk, id)) = &self.disk_cache {
            let rendered = match &fetched {
                Some(narinfo) => Some(narinfo.render(&self.config.store_dir)?),
                None => None,
            };
            disk.upsert(*id, hash_part, rendered.as_deref())?;
        }
        Ok(fetched)
    }

    /// Metadata for a path, `None` when the cache has no entry.
    pub fn query_path_info_opt(&self, path: &StorePath) -> Result<Option<Arc<NarInfo>>> {
        self.lookup_path_info(path, false)
    }

    /// Metadata for a path; a missing entry is an
    /// [`StoreError::InvalidPath`].
    pub fn query_path_info(&self, path: &StorePath) -> Result<Arc<NarInfo>> {
        self.query_path_info_opt(path)?
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()).into())
    }

    /// Authoritative metadata lookup bypassing both cache tiers; the
    /// tiers are repopulated with whatever the backend answers.
    pub fn refresh_path_info(&self, path: &StorePath) -> Result<Option<Arc<NarInfo>>> {
        self.lookup_path_info(path, true)
    }

    /// Upload a metadata record and populate both cache tiers.
    pub(crate) fn write_nar_info(&self, narinfo: NarInfo) -> Result<()> {
        let key = Self::narinfo_key(&narinfo.info.path);
        let rendered = narinfo.render(&self.config.store_dir)?;
        self.backend
            .upsert_file(&key, rendered.as_bytes(), MIME_NARINFO)?;

        let hash_part = narinfo.info.path.hash_part().to_string();
        let narinfo = Arc::new(narinfo);
        self.path_info_cache
            .insert(hash_part.clone(), Some(Arc::clone(&narinfo)));
        if let Some((disk, id)) = &self.disk_cache {
            disk.upsert(*id, &hash_part, Some(&rendered))?;
        }
        self.stats.nar_info_write.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stream the uncompressed archive of `path` into `sink`. Returns the
    /// number of bytes delivered.
    ///
    /// Metadata that names a vanished blob fails with
    /// [`StoreError::SubstituteGone`], distinct from a path that never
    /// existed.
    pub fn nar_from_path(&self, path: &StorePath, sink: &mut dyn Sink) -> Result<u64> {
        let narinfo = self.query_path_info(path)?;

        let mut counting = CountingSink::new(sink);
        let mut decompressor = DecompressionSink::new(narinfo.compression, &mut counting);
        let blob = match self.backend.fetch(&narinfo.url) {
            Ok(blob) => blob,
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::NoSuchBinaryCacheFile(_)) => {
                    return Err(StoreError::SubstituteGone(path.to_string()).into());
                }
                _ => return Err(err),
            },
        };
        for chunk in blob.chunks(64 * 1024) {
            decompressor.write(chunk)?;
        }
        decompressor.finish()?;

        let nar_size = counting.count();
        self.stats.nar_read.fetch_add(1, Ordering::Relaxed);
        self.stats
            .nar_read_bytes
            .fetch_add(nar_size, Ordering::Relaxed);
        Ok(nar_size)
    }

    /// Merge signatures into a path's metadata and rewrite it.
    ///
    /// There is no locking across writers: concurrent signers can race
    /// and the last rewrite wins, temporarily dropping the loser's
    /// signatures on eventually-consistent backends.
    pub fn add_signatures(
        &self,
        path: &StorePath,
        sigs: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        let mut narinfo = (*self.query_path_info(path)?).clone();
        narinfo.info.sigs.extend(sigs);
        self.write_nar_info(narinfo)
    }

    /// Fetch the build log of a path, resolving non-derivation paths
    /// through their deriver. `None` when no log (or deriver) is known.
    pub fn get_build_log(&self, path: &StorePath) -> Result<Option<Vec<u8>>> {
        let drv_path = if path.is_derivation() {
            path.clone()
        } else {
            match self.query_path_info_opt(path)? {
                Some(narinfo) => match &narinfo.info.deriver {
                    Some(deriver) => deriver.clone(),
                    None => return Ok(None),
                },
                None => return Ok(None),
            }
        };
        let key = format!("log/{drv_path}");
        debug!(uri = %self.uri, key = %key, "fetching build log");
        get_file(&self.backend, &key)
    }

    /// Store a derivation's canonical text, with its inputs as
    /// references.
    pub fn write_derivation(&self, drv: &Derivation, repair: bool) -> Result<StorePath> {
        // Outputs are not references: they may be absent and must not be
        // pinned by the derivation file.
        let references: Vec<&StorePath> = drv
            .input_srcs
            .iter()
            .chain(drv.input_drvs.keys())
            .collect();
        let contents = drv.unparse(&self.config.store_dir, false, None)?;
        let name = format!("{}{}", drv.name, crate::derivation::DRV_EXTENSION);
        self.add_text_to_store(&name, contents.as_bytes(), references, repair)
    }

    /// Read a stored derivation back out of its archive.
    pub fn read_stored_derivation(&self, drv_path: &StorePath) -> Result<Derivation> {
        let mut sink = VecSink::default();
        self.nar_from_path(drv_path, &mut sink)?;
        let accessor = silo_core::nar::NarAccessor::from_bytes(&sink.bytes)?;
        let contents = accessor.read_file("/")?;
        let text = std::str::from_utf8(contents).map_err(|e| {
            FormatError(format!("derivation '{drv_path}' is not UTF-8: {e}"))
        })?;
        let name = drv_path
            .name()
            .strip_suffix(crate::derivation::DRV_EXTENSION)
            .unwrap_or(drv_path.name());
        parse_derivation(&self.config.store_dir, text, name)
            .with_context(|| format!("error parsing derivation '{drv_path}'"))
    }

    /// Hash a stored derivation modulo its fixed-output dependencies,
    /// memoized for the lifetime of this store.
    pub fn hash_derivation_modulo(&self, drv: &Derivation, mask_outputs: bool) -> Result<silo_core::Hash> {
        crate::derivation::hash_derivation_modulo(
            self,
            &self.drv_hashes,
            &self.config.store_dir,
            drv,
            mask_outputs,
        )
    }
}

impl<B: BlobBackend> DerivationResolver for BinaryCacheStore<B> {
    fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation> {
        self.read_stored_derivation(drv_path)
    }
}
