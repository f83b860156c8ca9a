//! Content hashes and their textual encodings.
//!
//! Digests travel in three encodings: lowercase base-16, the 32-character
//! little-endian base-32 used in store path names, and standard base-64.
//! `Hash::parse` picks the encoding by length so callers never have to
//! announce which form they hold.

use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::FormatError;

/// Alphabet for the store's base-32 encoding. Omits e, o, u, t.
const BASE32_CHARS: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    /// Digest size in bytes.
    #[must_use]
    pub fn digest_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    #[must_use]
    pub fn base16_len(self) -> usize {
        self.digest_len() * 2
    }

    #[must_use]
    pub fn base32_len(self) -> usize {
        (self.digest_len() * 8 - 1) / 5 + 1
    }

    #[must_use]
    pub fn base64_len(self) -> usize {
        ((4 * self.digest_len() / 3) + 3) & !3
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(FormatError(format!("unknown hash algorithm '{other}'")).into()),
        }
    }
}

/// A digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    /// Wrap raw digest bytes; the length must match the algorithm.
    pub fn from_bytes(algo: HashAlgo, digest: Vec<u8>) -> Result<Self> {
        if digest.len() != algo.digest_len() {
            return Err(FormatError(format!(
                "{} digest has {} bytes, expected {}",
                algo,
                digest.len(),
                algo.digest_len()
            ))
            .into());
        }
        Ok(Self { algo, digest })
    }

    /// Hash a byte slice in one shot.
    #[must_use]
    pub fn of_bytes(algo: HashAlgo, data: &[u8]) -> Self {
        let digest = match algo {
            HashAlgo::Md5 => Md5::digest(data).to_vec(),
            HashAlgo::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgo::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgo::Sha512 => Sha512::digest(data).to_vec(),
        };
        Self { algo, digest }
    }

    #[must_use]
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Parse an encoded digest for a known algorithm. The encoding is
    /// inferred from the string length.
    pub fn parse(s: &str, algo: HashAlgo) -> Result<Self> {
        let digest = if s.len() == algo.base16_len() {
            hex::decode(s)
                .map_err(|e| FormatError(format!("invalid base-16 hash '{s}': {e}")))?
        } else if s.len() == algo.base32_len() {
            decode_base32(s, algo.digest_len())?
        } else if s.len() == algo.base64_len() {
            let bytes = BASE64_STANDARD
                .decode(s)
                .map_err(|e| FormatError(format!("invalid base-64 hash '{s}': {e}")))?;
            if bytes.len() != algo.digest_len() {
                return Err(FormatError(format!(
                    "base-64 hash '{s}' decodes to {} bytes, expected {}",
                    bytes.len(),
                    algo.digest_len()
                ))
                .into());
            }
            bytes
        } else {
            return Err(FormatError(format!(
                "hash '{s}' has wrong length for {algo}"
            ))
            .into());
        };
        Ok(Self { algo, digest })
    }

    /// Parse an `<algo>:<encoded>` string.
    pub fn parse_typed(s: &str) -> Result<Self> {
        let (algo, rest) = s
            .split_once(':')
            .ok_or_else(|| FormatError(format!("hash '{s}' lacks an algorithm prefix")))?;
        let algo: HashAlgo = algo.parse()?;
        Self::parse(rest, algo).with_context(|| format!("while parsing hash '{s}'"))
    }

    #[must_use]
    pub fn to_base16(&self) -> String {
        hex::encode(&self.digest)
    }

    #[must_use]
    pub fn to_base32(&self) -> String {
        encode_base32(&self.digest)
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.digest)
    }

    /// `<algo>:<base32>` form used in narinfo files and fingerprints.
    #[must_use]
    pub fn to_typed_base32(&self) -> String {
        format!("{}:{}", self.algo, self.to_base32())
    }

    /// `<algo>:<base16>` form.
    #[must_use]
    pub fn to_typed_base16(&self) -> String {
        format!("{}:{}", self.algo, self.to_base16())
    }
}

/// Encode bytes in little-endian base-32 (no padding).
#[must_use]
pub fn encode_base32(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let len = (bytes.len() * 8 - 1) / 5 + 1;
    let mut out = String::with_capacity(len);
    for n in (0..len).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let mut c = u16::from(bytes[i]) >> j;
        if i + 1 < bytes.len() {
            c |= u16::from(bytes[i + 1]) << (8 - j);
        }
        out.push(BASE32_CHARS[(c & 0x1f) as usize] as char);
    }
    out
}

/// Decode a little-endian base-32 string into `digest_len` bytes.
pub fn decode_base32(s: &str, digest_len: usize) -> Result<Vec<u8>> {
    let chars = s.as_bytes();
    let mut out = vec![0u8; digest_len];
    for (n, &ch) in chars.iter().rev().enumerate() {
        let digit = BASE32_CHARS
            .iter()
            .position(|&c| c == ch)
            .ok_or_else(|| FormatError(format!("invalid base-32 character '{}'", ch as char)))?
            as u16;
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        out[i] |= (digit << j) as u8;
        let spill = digit >> (8 - j);
        if spill != 0 {
            if i + 1 < digest_len {
                out[i + 1] |= spill as u8;
            } else {
                return Err(FormatError(format!("invalid base-32 string '{s}'")).into());
            }
        }
    }
    Ok(out)
}
