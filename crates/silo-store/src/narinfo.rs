//! Path metadata records and their `.narinfo` wire form.

use anyhow::Result;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::str::FromStr;

use silo_core::hash::Hash;
use silo_core::io::CompressionAlgo;
use silo_core::signing::SecretKey;
use silo_core::store_path::{FileIngestionMethod, StoreDir, StorePath};
use silo_core::FormatError;

/// How a content-addressed path was derived from its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentAddress {
    /// A text artifact (`text:<algo>:<base32>`).
    Text { hash: Hash },
    /// A fixed-output artifact (`fixed:<r:>?<algo>:<base32>`).
    Fixed {
        method: FileIngestionMethod,
        hash: Hash,
    },
}

impl ContentAddress {
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text { hash } => format!("text:{}", hash.to_typed_base32()),
            Self::Fixed { method, hash } => {
                format!("fixed:{}{}", method.prefix(), hash.to_typed_base32())
            }
        }
    }
}

impl FromStr for ContentAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| FormatError(format!("malformed content address '{s}'")))?;
        match tag {
            "text" => Ok(Self::Text {
                hash: Hash::parse_typed(rest)?,
            }),
            "fixed" => {
                let (method, rest) = match rest.strip_prefix("r:") {
                    Some(rest) => (FileIngestionMethod::Recursive, rest),
                    None => (FileIngestionMethod::Flat, rest),
                };
                Ok(Self::Fixed {
                    method,
                    hash: Hash::parse_typed(rest)?,
                })
            }
            other => Err(FormatError(format!("unknown content address kind '{other}'")).into()),
        }
    }
}

/// Everything the store knows about one valid path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    /// Hash of the uncompressed archive. `None` on ingest means "compute
    /// and trust"; a mismatch with the computed hash rejects the copy.
    pub nar_hash: Option<Hash>,
    pub nar_size: u64,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
    /// Seconds since the epoch; local bookkeeping, not serialized.
    pub registration_time: u64,
    /// Whether this path was built locally rather than substituted.
    pub ultimate: bool,
    pub sigs: BTreeSet<String>,
    pub ca: Option<ContentAddress>,
}

impl ValidPathInfo {
    #[must_use]
    pub fn new(path: StorePath) -> Self {
        Self {
            path,
            nar_hash: None,
            nar_size: 0,
            references: BTreeSet::new(),
            deriver: None,
            registration_time: 0,
            ultimate: false,
            sigs: BTreeSet::new(),
            ca: None,
        }
    }

    /// The canonical string a path signature covers: path, archive hash,
    /// archive size and references, nothing else.
    pub fn fingerprint(&self, store_dir: &StoreDir) -> Result<String> {
        let nar_hash = self.nar_hash.as_ref().ok_or_else(|| {
            FormatError(format!(
                "cannot fingerprint '{}' without an archive hash",
                self.path
            ))
        })?;
        let references = self
            .references
            .iter()
            .map(|r| store_dir.display_path(r))
            .collect::<Vec<_>>()
            .join(",");
        Ok(format!(
            "1;{};{};{};{}",
            store_dir.display_path(&self.path),
            nar_hash.to_typed_base32(),
            self.nar_size,
            references
        ))
    }

    /// Sign the fingerprint and add the signature. Existing fields are
    /// left untouched.
    pub fn sign(&mut self, store_dir: &StoreDir, key: &SecretKey) -> Result<()> {
        let signature = key.sign(&self.fingerprint(store_dir)?);
        self.sigs.insert(signature);
        Ok(())
    }
}

/// Metadata record describing one compressed archive in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    pub info: ValidPathInfo,
    /// Blob key relative to the cache root, e.g. `nar/<hash>.nar.xz`.
    pub url: String,
    pub compression: CompressionAlgo,
    /// Hash of the compressed blob.
    pub file_hash: Option<Hash>,
    pub file_size: Option<u64>,
}

impl NarInfo {
    #[must_use]
    pub fn from_info(info: ValidPathInfo) -> Self {
        Self {
            info,
            url: String::new(),
            compression: CompressionAlgo::default(),
            file_hash: None,
            file_size: None,
        }
    }

    /// Parse a `.narinfo` document. `origin` names the fetched key and is
    /// only used to anchor diagnostics. Key order does not matter;
    /// unknown keys are ignored for forward compatibility.
    pub fn parse(store_dir: &StoreDir, s: &str, origin: &str) -> Result<Self> {
        let mut path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = BTreeSet::new();
        let mut deriver = None;
        let mut sigs = BTreeSet::new();
        let mut ca = None;

        for line in s.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                FormatError(format!("bad line '{line}' in narinfo '{origin}'"))
            })?;
            let value = value.trim_start();
            match key {
                "StorePath" => path = Some(store_dir.parse_path(value)?),
                "URL" => url = Some(value.to_string()),
                "Compression" => compression = Some(value.parse()?),
                "FileHash" => file_hash = Some(Hash::parse_typed(value)?),
                "FileSize" => {
                    file_size = Some(value.parse::<u64>().map_err(|e| {
                        FormatError(format!("bad FileSize in narinfo '{origin}': {e}"))
                    })?);
                }
                "NarHash" => nar_hash = Some(Hash::parse_typed(value)?),
                "NarSize" => {
                    nar_size = Some(value.parse::<u64>().map_err(|e| {
                        FormatError(format!("bad NarSize in narinfo '{origin}': {e}"))
                    })?);
                }
                "References" => {
                    for basename in value.split_whitespace() {
                        references.insert(StorePath::from_base_name(basename)?);
                    }
                }
                "Deriver" => deriver = Some(StorePath::from_base_name(value)?),
                "Sig" => {
                    sigs.insert(value.to_string());
                }
                "CA" => ca = Some(value.parse()?),
                _ => {}
            }
        }

        let path = path
            .ok_or_else(|| FormatError(format!("narinfo '{origin}' lacks a StorePath")))?;
        let url =
            url.ok_or_else(|| FormatError(format!("narinfo '{origin}' lacks a URL")))?;
        let nar_hash = nar_hash
            .ok_or_else(|| FormatError(format!("narinfo '{origin}' lacks a NarHash")))?;
        let nar_size = nar_size
            .ok_or_else(|| FormatError(format!("narinfo '{origin}' lacks a NarSize")))?;

        let mut info = ValidPathInfo::new(path);
        info.nar_hash = Some(nar_hash);
        info.nar_size = nar_size;
        info.references = references;
        info.deriver = deriver;
        info.sigs = sigs;
        info.ca = ca;

        Ok(Self {
            info,
            url,
            // Old producers omitted the key and meant bzip2.
            compression: compression.unwrap_or(CompressionAlgo::Bzip2),
            file_hash,
            file_size,
        })
    }

    /// Serialize in the canonical key order.
    pub fn render(&self, store_dir: &StoreDir) -> Result<String> {
        let nar_hash = self.info.nar_hash.as_ref().ok_or_else(|| {
            FormatError(format!(
                "cannot serialize narinfo for '{}' without an archive hash",
                self.info.path
            ))
        })?;
        let mut out = String::new();
        writeln!(out, "StorePath: {}", store_dir.display_path(&self.info.path))?;
        writeln!(out, "URL: {}", self.url)?;
        writeln!(out, "Compression: {}", self.compression)?;
        if let Some(file_hash) = &self.file_hash {
            writeln!(out, "FileHash: {}", file_hash.to_typed_base32())?;
        }
        if let Some(file_size) = self.file_size {
            writeln!(out, "FileSize: {file_size}")?;
        }
        writeln!(out, "NarHash: {}", nar_hash.to_typed_base32())?;
        writeln!(out, "NarSize: {}", self.info.nar_size)?;
        let references = self
            .info
            .references
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "References: {references}")?;
        if let Some(deriver) = &self.info.deriver {
            writeln!(out, "Deriver: {deriver}")?;
        }
        for sig in &self.info.sigs {
            writeln!(out, "Sig: {sig}")?;
        }
        if let Some(ca) = &self.info.ca {
            writeln!(out, "CA: {}", ca.render())?;
        }
        Ok(out)
    }
}
