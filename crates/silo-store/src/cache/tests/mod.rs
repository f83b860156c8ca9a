//! Binary cache store tests, split by topic.

mod sigs_logs;

use anyhow::Result;
use std::sync::Arc;

use silo_core::hash::{Hash, HashAlgo};
use silo_core::io::VecSink;
use silo_core::nar::dump_bytes;
use silo_core::store_path::{make_fixed_output_path, FileIngestionMethod, StoreDir};

use crate::backend::{BlobBackend, MemoryBackend};
use crate::config::CacheConfig;
use crate::narinfo::ValidPathInfo;

use super::BinaryCacheStore;

const TEST_URI: &str = "memory://unit";

type TestStore = BinaryCacheStore<Arc<MemoryBackend>>;

fn new_store() -> Result<(Arc<MemoryBackend>, TestStore)> {
    new_store_with(CacheConfig::default())
}

fn new_store_with(config: CacheConfig) -> Result<(Arc<MemoryBackend>, TestStore)> {
    let backend = Arc::new(MemoryBackend::new());
    let store = BinaryCacheStore::open(TEST_URI, config, Arc::clone(&backend))?;
    store.init()?;
    Ok((backend, store))
}

/// A single-file archive plus metadata declaring its computed hash.
fn flat_artifact(name: &str, contents: &[u8]) -> Result<(ValidPathInfo, Vec<u8>)> {
    let mut sink = VecSink::default();
    dump_bytes(contents, &mut sink)?;
    let nar = sink.bytes;

    let path = make_fixed_output_path(
        &StoreDir::default(),
        FileIngestionMethod::Flat,
        &Hash::of_bytes(HashAlgo::Sha256, contents),
        name,
    )?;
    let mut info = ValidPathInfo::new(path);
    info.nar_hash = Some(Hash::of_bytes(HashAlgo::Sha256, &nar));
    info.nar_size = nar.len() as u64;
    Ok((info, nar))
}

/// Ingest a flat artifact and hand back its metadata.
fn ingest_flat(store: &TestStore, name: &str, contents: &[u8]) -> Result<ValidPathInfo> {
    let (info, nar) = flat_artifact(name, contents)?;
    let mut source = silo_core::io::SliceSource::new(&nar);
    store.add_to_store(&info, &mut source, false, true)?;
    Ok(info)
}
