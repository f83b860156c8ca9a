//! Store paths and the fingerprints that derive them.
//!
//! A store path is identified by a 32-character base-32 hash part (a
//! 160-bit fold of a SHA-256 digest) followed by a human-readable name.
//! Equality and ordering use the hash part first, so two paths that share
//! it compare equal on identity even when their names differ.

use anyhow::Result;
use std::fmt;

use crate::hash::{encode_base32, Hash, HashAlgo};
use crate::FormatError;

/// Length of the base-32 hash part in a path basename.
pub const HASH_PART_LEN: usize = 32;

/// Raw byte length of the folded path digest.
pub const PATH_DIGEST_LEN: usize = 20;

const MAX_NAME_LEN: usize = 211;

/// How file contents were turned into a hash during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileIngestionMethod {
    /// Hash over the plain bytes of a single file.
    Flat,
    /// Hash over the NAR serialization of a path subtree.
    Recursive,
}

impl FileIngestionMethod {
    /// Prefix used in `<method><algo>` renderings: empty or `r:`.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Flat => "",
            Self::Recursive => "r:",
        }
    }

    /// Render `<algo>` or `r:<algo>` for fixed-output descriptors.
    #[must_use]
    pub fn print_method_algo(self, algo: HashAlgo) -> String {
        format!("{}{}", self.prefix(), algo)
    }
}

/// The directory all store paths live under, e.g. `/nix/store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir(String);

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        if !dir.starts_with('/') || dir.ends_with('/') {
            return Err(FormatError(format!("'{dir}' is not a valid store directory")).into());
        }
        Ok(Self(dir))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute rendering of a path under this store.
    #[must_use]
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// Parse an absolute path that must live directly under this store.
    pub fn parse_path(&self, s: &str) -> Result<StorePath> {
        let rest = s
            .strip_prefix(self.0.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| {
                FormatError(format!("path '{s}' is not in the store '{}'", self.0))
            })?;
        if rest.contains('/') {
            return Err(FormatError(format!("path '{s}' is not a top-level store path")).into());
        }
        StorePath::from_base_name(rest)
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        Self("/nix/store".to_string())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store path basename: `<hashPart>-<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    hash_part: String,
    name: String,
}

impl StorePath {
    /// Parse a basename of the form `<32 base-32 chars>-<name>`.
    pub fn from_base_name(s: &str) -> Result<Self> {
        if s.len() < HASH_PART_LEN + 1 || s.as_bytes()[HASH_PART_LEN] != b'-' {
            return Err(FormatError(format!("'{s}' is not a valid store path name")).into());
        }
        let (hash_part, rest) = s.split_at(HASH_PART_LEN);
        let name = &rest[1..];
        if !hash_part
            .bytes()
            .all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'z') && !matches!(c, b'e' | b'o' | b'u' | b't'))
        {
            return Err(FormatError(format!("invalid hash part in store path '{s}'")).into());
        }
        check_name(name)?;
        Ok(Self {
            hash_part: hash_part.to_string(),
            name: name.to_string(),
        })
    }

    /// Build a path from a folded digest and a checked name.
    pub fn from_parts(digest: &[u8; PATH_DIGEST_LEN], name: &str) -> Result<Self> {
        check_name(name)?;
        Ok(Self {
            hash_part: encode_base32(digest),
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn hash_part(&self) -> &str {
        &self.hash_part
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this path names a stored derivation.
    #[must_use]
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash_part, self.name)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(FormatError(format!("store path name '{name}' has a bad length")).into());
    }
    if name.starts_with('.') {
        return Err(FormatError(format!("store path name '{name}' starts with a period")).into());
    }
    for c in name.bytes() {
        if !matches!(c, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
        {
            return Err(FormatError(format!(
                "store path name '{name}' contains the illegal character '{}'",
                c as char
            ))
            .into());
        }
    }
    Ok(())
}

/// Fold an arbitrary digest down to `output_len` bytes by XOR-ing each
/// input byte into the output buffer in rotation.
#[must_use]
pub fn compress_hash(input: &[u8], output_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; output_len];
    for (i, b) in input.iter().enumerate() {
        out[i % output_len] ^= b;
    }
    out
}

/// Derive a store path from a type tag, a content hash and a name.
///
/// The identity fingerprint is
/// `<type>:sha256:<base16 hash>:<storeDir>:<name>`; its SHA-256 digest is
/// folded to 160 bits and becomes the hash part.
pub fn make_store_path(
    store_dir: &StoreDir,
    path_type: &str,
    hash: &Hash,
    name: &str,
) -> Result<StorePath> {
    let fingerprint = format!(
        "{}:{}:{}:{}:{}",
        path_type,
        hash.algo(),
        hash.to_base16(),
        store_dir,
        name
    );
    let digest = Hash::of_bytes(HashAlgo::Sha256, fingerprint.as_bytes());
    let folded = compress_hash(digest.digest(), PATH_DIGEST_LEN);
    let mut arr = [0u8; PATH_DIGEST_LEN];
    arr.copy_from_slice(&folded);
    StorePath::from_parts(&arr, name)
}

/// Path of a content-addressed artifact: a pure function of
/// `(method, hash, name)`.
pub fn make_fixed_output_path(
    store_dir: &StoreDir,
    method: FileIngestionMethod,
    hash: &Hash,
    name: &str,
) -> Result<StorePath> {
    if method == FileIngestionMethod::Recursive && hash.algo() == HashAlgo::Sha256 {
        make_store_path(store_dir, "source", hash, name)
    } else {
        let inner = format!(
            "fixed:out:{}{}:{}:",
            method.prefix(),
            hash.algo(),
            hash.to_base16()
        );
        let outer = Hash::of_bytes(HashAlgo::Sha256, inner.as_bytes());
        make_store_path(store_dir, "output:out", &outer, name)
    }
}

/// Path of a literal text artifact whose contents may reference other
/// store paths.
pub fn compute_store_path_for_text<'a>(
    store_dir: &StoreDir,
    name: &str,
    contents: &[u8],
    references: impl IntoIterator<Item = &'a StorePath>,
) -> Result<StorePath> {
    let mut path_type = String::from("text");
    for reference in references {
        path_type.push(':');
        path_type.push_str(&store_dir.display_path(reference));
    }
    let hash = Hash::of_bytes(HashAlgo::Sha256, contents);
    make_store_path(store_dir, &path_type, &hash, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_base_names() -> Result<()> {
        let p = StorePath::from_base_name("syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin")?;
        assert_eq!(p.hash_part(), "syd87l2rxw8cbsxmxl853h0r6pdwhwjr");
        assert_eq!(p.name(), "curl-7.82.0-bin");
        assert_eq!(p.to_string(), "syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin");
        assert!(!p.is_derivation());
        Ok(())
    }

    #[test]
    fn rejects_malformed_base_names() {
        for bad in ["", "short-name", "syd87l2rxw8cbsxmxl853h0r6pdwhwjrXcurl"] {
            assert!(StorePath::from_base_name(bad).is_err(), "{bad:?} accepted");
        }
        // 'e' is outside the base-32 alphabet.
        assert!(StorePath::from_base_name("eyd87l2rxw8cbsxmxl853h0r6pdwhwjr-x").is_err());
    }

    #[test]
    fn store_dir_round_trips_absolute_paths() -> Result<()> {
        let dir = StoreDir::default();
        let p = StorePath::from_base_name("syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin")?;
        let abs = dir.display_path(&p);
        assert_eq!(dir.parse_path(&abs)?, p);
        assert!(dir.parse_path("/tmp/nope").is_err());

        let custom = StoreDir::new("/gnu/store")?;
        assert!(custom.parse_path(&abs).is_err());
        assert!(StoreDir::new("relative/store").is_err());
        Ok(())
    }

    #[test]
    fn compress_hash_folds_by_xor() {
        assert_eq!(compress_hash(&[0xff, 0x01], 1), vec![0xfe]);
        assert_eq!(compress_hash(&[1, 2, 3, 4, 5], 2), vec![1 ^ 3 ^ 5, 2 ^ 4]);
    }

    #[test]
    fn fixed_output_path_is_a_pure_function() -> Result<()> {
        let dir = StoreDir::default();
        let h = Hash::of_bytes(HashAlgo::Sha256, b"artifact");
        let a = make_fixed_output_path(&dir, FileIngestionMethod::Recursive, &h, "artifact")?;
        let b = make_fixed_output_path(&dir, FileIngestionMethod::Recursive, &h, "artifact")?;
        assert_eq!(a, b);
        let flat = make_fixed_output_path(&dir, FileIngestionMethod::Flat, &h, "artifact")?;
        assert_ne!(a, flat);
        Ok(())
    }

    #[test]
    fn text_path_depends_on_references() -> Result<()> {
        let dir = StoreDir::default();
        let r = StorePath::from_base_name("syd87l2rxw8cbsxmxl853h0r6pdwhwjr-dep")?;
        let plain = compute_store_path_for_text(&dir, "cfg", b"hello", [])?;
        let with_ref = compute_store_path_for_text(&dir, "cfg", b"hello", [&r])?;
        assert_ne!(plain, with_ref);
        Ok(())
    }
}
