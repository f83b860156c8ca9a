use super::*;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use silo_core::signing::PublicKey;
use silo_core::store_path::StorePath;
use std::fs;
use tempfile::tempdir;

fn write_key_file(dir: &std::path::Path) -> Result<(std::path::PathBuf, PublicKey)> {
    let signing = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
    let encoded = BASE64_STANDARD.encode(signing.to_keypair_bytes());
    let key_file = dir.join("signing.key");
    fs::write(&key_file, format!("unit-tests-1:{encoded}\n"))?;
    let public = PublicKey::parse(&format!(
        "unit-tests-1:{}",
        BASE64_STANDARD.encode(signing.verifying_key().to_bytes())
    ))?;
    Ok((key_file, public))
}

#[test]
fn ingest_signs_the_canonical_fingerprint() -> Result<()> {
    let temp = tempdir()?;
    let (key_file, public) = write_key_file(temp.path())?;
    let config = CacheConfig {
        secret_key_file: Some(key_file),
        ..CacheConfig::default()
    };
    let (_backend, store) = new_store_with(config)?;

    let info = ingest_flat(&store, "signed", b"signed payload")?;
    let narinfo = store.query_path_info(&info.path)?;
    assert_eq!(narinfo.info.sigs.len(), 1);
    let sig = narinfo.info.sigs.iter().next().unwrap();
    let fingerprint = narinfo.info.fingerprint(store.store_dir())?;
    assert!(public.verify(&fingerprint, sig));
    Ok(())
}

#[test]
fn added_signatures_union_without_touching_other_fields() -> Result<()> {
    let (_backend, store) = new_store()?;
    let info = ingest_flat(&store, "multi-signed", b"payload")?;
    let before = store.query_path_info(&info.path)?;

    store.add_signatures(&info.path, ["peer-1:c2lnbmF0dXJl".to_string()])?;
    store.add_signatures(
        &info.path,
        [
            "peer-1:c2lnbmF0dXJl".to_string(),
            "peer-2:YW5vdGhlcg==".to_string(),
        ],
    )?;

    let after = store.query_path_info(&info.path)?;
    assert_eq!(after.info.sigs.len(), 2);
    assert_eq!(after.info.nar_hash, before.info.nar_hash);
    assert_eq!(after.info.nar_size, before.info.nar_size);
    assert_eq!(after.info.references, before.info.references);
    assert_eq!(after.url, before.url);
    Ok(())
}

#[test]
fn build_logs_resolve_directly_for_derivation_paths() -> Result<()> {
    let (backend, store) = new_store()?;
    let drv = StorePath::from_base_name("syd87l2rxw8cbsxmxl853h0r6pdwhwjr-hello-1.0.drv")?;
    backend.upsert_file(&format!("log/{drv}"), b"building hello...\n", "text/plain")?;
    assert_eq!(
        store.get_build_log(&drv)?.as_deref(),
        Some(b"building hello...\n".as_slice())
    );
    Ok(())
}

#[test]
fn build_logs_resolve_through_the_deriver() -> Result<()> {
    let (backend, store) = new_store()?;
    let drv = StorePath::from_base_name("syd87l2rxw8cbsxmxl853h0r6pdwhwjr-hello-1.0.drv")?;

    let (mut info, nar) = flat_artifact("hello-1.0", b"the output")?;
    info.deriver = Some(drv.clone());
    let mut source = silo_core::io::SliceSource::new(&nar);
    store.add_to_store(&info, &mut source, false, true)?;

    backend.upsert_file(&format!("log/{drv}"), b"log body", "text/plain")?;
    assert_eq!(
        store.get_build_log(&info.path)?.as_deref(),
        Some(b"log body".as_slice())
    );
    Ok(())
}

#[test]
fn paths_without_a_deriver_have_no_log() -> Result<()> {
    let (_backend, store) = new_store()?;
    let info = ingest_flat(&store, "underived", b"payload")?;
    assert_eq!(store.get_build_log(&info.path)?, None);

    let unknown = StorePath::from_base_name("syd87l2rxw8cbsxmxl853h0r6pdwhwjr-unknown")?;
    assert_eq!(store.get_build_log(&unknown)?, None);
    Ok(())
}
