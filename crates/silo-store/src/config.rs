//! Store configuration.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use silo_core::io::CompressionAlgo;
use silo_core::StoreDir;

/// Knobs of a binary cache store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Store prefix artifacts were built for.
    pub store_dir: StoreDir,
    /// Compression applied to uploaded archives.
    pub compression: CompressionAlgo,
    /// Use the multi-threaded xz encoder.
    pub parallel_compression: bool,
    /// Publish a JSON listing next to each archive.
    pub write_nar_listing: bool,
    /// Maintain the `debuginfo/` build-id index.
    pub write_debug_info: bool,
    /// Rewrite existing debuginfo links instead of keeping them. The
    /// default keeps them, which can leave links pointing at blobs a
    /// collector has since removed.
    pub overwrite_debug_info: bool,
    /// File holding the `name:base64` signing key.
    pub secret_key_file: Option<PathBuf>,
    /// Directory where callers may keep decompressed archives.
    pub local_nar_cache: Option<PathBuf>,
    /// Directory for the persistent path-info cache; `None` disables it.
    pub disk_cache_dir: Option<PathBuf>,
    /// Relative preference among substituters (lower wins).
    pub priority: u32,
    /// Whether peers should batch-query this cache.
    pub want_mass_query: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_dir: StoreDir::default(),
            compression: CompressionAlgo::Xz,
            parallel_compression: false,
            write_nar_listing: false,
            write_debug_info: false,
            overwrite_debug_info: false,
            secret_key_file: None,
            local_nar_cache: None,
            disk_cache_dir: None,
            priority: 50,
            want_mass_query: false,
        }
    }
}

/// Default location for the persistent path-info cache:
/// `SILO_CACHE_DIR` when set, the user cache directory otherwise.
pub fn default_disk_cache_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("SILO_CACHE_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let base = dirs_next::cache_dir().context("failed to resolve a user cache directory")?;
    Ok(base.join("silo"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_documented_behavior() {
        let config = CacheConfig::default();
        assert_eq!(config.compression, CompressionAlgo::Xz);
        assert!(!config.write_nar_listing);
        assert!(config.disk_cache_dir.is_none());
        assert_eq!(config.priority, 50);
    }

    #[test]
    #[serial]
    fn cache_dir_env_override_wins() -> Result<()> {
        let prev = env::var_os("SILO_CACHE_DIR");
        env::set_var("SILO_CACHE_DIR", "/tmp/silo-test-cache");
        let resolved = default_disk_cache_dir();
        match prev {
            Some(v) => env::set_var("SILO_CACHE_DIR", v),
            None => env::remove_var("SILO_CACHE_DIR"),
        }
        assert_eq!(resolved?, PathBuf::from("/tmp/silo-test-cache"));
        Ok(())
    }
}
