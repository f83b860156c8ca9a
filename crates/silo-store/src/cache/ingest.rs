//! Ingestion paths of the binary cache (split out of mod.rs for
//! readability).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::debug;

use silo_core::hash::{Hash, HashAlgo};
use silo_core::io::{compress, SliceSource, Source, VecSink};
use silo_core::nar::{dump_bytes, dump_path, has_magic_prefix, write_listing, NarAccessor, NarNode};
use silo_core::pool::{check_interrupt, ThreadPool};
use silo_core::store_path::{
    compute_store_path_for_text, make_fixed_output_path, FileIngestionMethod, StorePath,
};

use crate::backend::BlobBackend;
use crate::error::StoreError;
use crate::narinfo::{NarInfo, ValidPathInfo};

use super::{BinaryCacheStore, MIME_JSON, MIME_NAR};

/// Workers indexing debuginfo members during one ingest.
const DEBUG_INFO_PARALLELISM: usize = 25;

const BUILD_ID_DIR: &str = "/lib/debug/.build-id";

impl<B: BlobBackend> BinaryCacheStore<B> {
    /// Ingest an archive under the identity and references declared in
    /// `info`.
    ///
    /// The source must yield a complete NAR; it is drained into memory
    /// before anything is written. Ingesting an already-valid path is a
    /// no-op unless `repair` is set. `check_sigs` is accepted for
    /// interface parity with other store kinds; a cache trusts its
    /// writers.
    pub fn add_to_store(
        &self,
        info: &ValidPathInfo,
        nar_source: &mut dyn Source,
        repair: bool,
        _check_sigs: bool,
    ) -> Result<()> {
        let nar = nar_source.drain()?;

        if !repair && self.is_valid_path(&info.path)? {
            debug!(path = %info.path, "path already in cache, skipping");
            return Ok(());
        }

        // Validate references up front; their metadata reads are
        // usually already cached.
        for reference in &info.references {
            if reference != &info.path && self.query_path_info_opt(reference)?.is_none() {
                return Err(StoreError::MissingReference {
                    path: info.path.to_string(),
                    reference: reference.to_string(),
                }
                .into());
            }
        }

        if !has_magic_prefix(&nar) {
            return Err(StoreError::BadArchiveMagic(info.path.to_string()).into());
        }

        let nar_hash = Hash::of_bytes(HashAlgo::Sha256, &nar);
        let nar_size = nar.len() as u64;
        if let Some(expected) = &info.nar_hash {
            if *expected != nar_hash {
                return Err(StoreError::CorruptedPath(info.path.to_string()).into());
            }
        }

        let mut narinfo = NarInfo::from_info(info.clone());
        narinfo.info.nar_hash = Some(nar_hash);
        narinfo.info.nar_size = nar_size;

        let accessor = NarAccessor::from_bytes(&nar)
            .with_context(|| format!("while indexing the archive of '{}'", info.path))?;

        if self.config().write_nar_listing {
            let listing = write_listing(&accessor);
            self.backend().upsert_file(
                &format!("{}.ls", info.path),
                listing.to_string().as_bytes(),
                MIME_JSON,
            )?;
        }

        narinfo.compression = self.config().compression;
        let started = Instant::now();
        let compressed = compress(
            self.config().compression,
            &nar,
            self.config().parallel_compression,
        )?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let file_hash = Hash::of_bytes(HashAlgo::Sha256, &compressed);
        narinfo.file_hash = Some(file_hash.clone());
        narinfo.file_size = Some(compressed.len() as u64);
        narinfo.url = format!(
            "nar/{}.nar{}",
            file_hash.to_base32(),
            self.config().compression.extension()
        );

        debug!(
            path = %info.path,
            nar_size,
            ratio = 100.0 * (1.0 - compressed.len() as f64 / nar.len().max(1) as f64),
            duration_ms,
            "compressed archive for upload"
        );

        if self.config().write_debug_info {
            self.index_debug_info(&accessor, &narinfo.url)?;
        }

        if repair || !self.backend().file_exists(&narinfo.url)? {
            self.stats().nar_write.fetch_add(1, Ordering::Relaxed);
            self.backend()
                .upsert_file(&narinfo.url, &compressed, MIME_NAR)?;
        } else {
            self.stats().nar_write_averted.fetch_add(1, Ordering::Relaxed);
        }
        self.stats()
            .nar_write_bytes
            .fetch_add(nar_size, Ordering::Relaxed);
        self.stats()
            .nar_write_compressed_bytes
            .fetch_add(compressed.len() as u64, Ordering::Relaxed);
        self.stats()
            .nar_write_compression_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        if let Some(key) = self.secret_key() {
            narinfo.info.sign(self.store_dir(), key)?;
        }

        self.write_nar_info(narinfo)
    }

    /// Maintain `debuginfo/<buildId>` records pointing into the archive
    /// for every build-id member it carries.
    fn index_debug_info(&self, accessor: &NarAccessor, archive_url: &str) -> Result<()> {
        let Some(NarNode::Directory(_)) = accessor.stat(BUILD_ID_DIR) else {
            return Ok(());
        };

        let mut pool = ThreadPool::new(DEBUG_INFO_PARALLELISM);
        let target = format!("../{archive_url}");

        for prefix in accessor.read_directory(BUILD_ID_DIR)? {
            let dir = format!("{BUILD_ID_DIR}/{prefix}");
            if prefix.len() != 2 || !is_lower_hex(&prefix) {
                continue;
            }
            if !matches!(accessor.stat(&dir), Some(NarNode::Directory(_))) {
                continue;
            }
            for member in accessor.read_directory(&dir)? {
                let debug_path = format!("{dir}/{member}");
                if !matches!(accessor.stat(&debug_path), Some(NarNode::Regular { .. })) {
                    continue;
                }
                let Some(stem) = member.strip_suffix(".debug") else {
                    continue;
                };
                if stem.len() != 38 || !is_lower_hex(stem) {
                    continue;
                }

                let key = format!("debuginfo/{prefix}{member}");
                let record = serde_json::json!({
                    "archive": target.as_str(),
                    "member": &debug_path[1..],
                });
                let overwrite = self.config().overwrite_debug_info;
                pool.enqueue(move || {
                    check_interrupt()?;
                    // Keeping an existing link may leave it pointing at a
                    // collected blob; the overwrite knob trades that for
                    // extra writes.
                    if !overwrite && self.backend().file_exists(&key)? {
                        return Ok(());
                    }
                    debug!(key = %key, "writing debuginfo link");
                    self.backend()
                        .upsert_file(&key, record.to_string().as_bytes(), MIME_JSON)
                });
            }
        }

        pool.process()
    }

    /// Ingest a filesystem path, content-addressing it by `method` and
    /// `algo`. Returns the resulting store path.
    pub fn add_path_to_store(
        &self,
        name: &str,
        src_path: &Path,
        method: FileIngestionMethod,
        algo: HashAlgo,
        repair: bool,
    ) -> Result<StorePath> {
        let mut sink = VecSink::default();
        let hash = match method {
            FileIngestionMethod::Recursive => {
                dump_path(src_path, &mut sink)?;
                Hash::of_bytes(algo, &sink.bytes)
            }
            FileIngestionMethod::Flat => {
                let contents = std::fs::read(src_path)
                    .with_context(|| format!("failed to read {}", src_path.display()))?;
                dump_bytes(&contents, &mut sink)?;
                Hash::of_bytes(algo, &contents)
            }
        };

        let path = make_fixed_output_path(self.store_dir(), method, &hash, name)?;
        let info = ValidPathInfo::new(path.clone());
        let mut source = SliceSource::new(&sink.bytes);
        self.add_to_store(&info, &mut source, repair, true)?;
        Ok(path)
    }

    /// Store a literal text artifact whose path is derived from its
    /// contents and references.
    pub fn add_text_to_store<'a>(
        &self,
        name: &str,
        contents: &[u8],
        references: impl IntoIterator<Item = &'a StorePath>,
        repair: bool,
    ) -> Result<StorePath> {
        let references: Vec<&StorePath> = references.into_iter().collect();
        let path = compute_store_path_for_text(
            self.store_dir(),
            name,
            contents,
            references.iter().copied(),
        )?;

        if !repair && self.is_valid_path(&path)? {
            return Ok(path);
        }

        let mut info = ValidPathInfo::new(path.clone());
        info.references = references.into_iter().cloned().collect();

        let mut sink = VecSink::default();
        dump_bytes(contents, &mut sink)?;
        let mut source = SliceSource::new(&sink.bytes);
        self.add_to_store(&info, &mut source, repair, true)?;
        Ok(path)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
