//! Ed25519 signing keys in the `<keyName>:<base64>` key-file format.

use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signer, Verifier};
use std::path::Path;

use crate::FormatError;

/// A named secret key able to sign path fingerprints.
pub struct SecretKey {
    name: String,
    key: ed25519_dalek::SigningKey,
}

impl SecretKey {
    /// Parse `name:base64(64-byte keypair)`.
    pub fn parse(s: &str) -> Result<Self> {
        let (name, key) = split_key(s)?;
        let bytes: [u8; 64] = key
            .as_slice()
            .try_into()
            .map_err(|_| FormatError(format!("secret key '{name}' has the wrong length")))?;
        let key = ed25519_dalek::SigningKey::from_keypair_bytes(&bytes)
            .map_err(|e| FormatError(format!("secret key '{name}' is invalid: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            key,
        })
    }

    /// Load a key from a file, trimming a trailing newline.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secret key {}", path.display()))?;
        Self::parse(contents.trim_end())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sign a fingerprint, yielding the `keyName:base64(sig)` form stored
    /// in path metadata.
    #[must_use]
    pub fn sign(&self, fingerprint: &str) -> String {
        let sig = self.key.sign(fingerprint.as_bytes());
        format!("{}:{}", self.name, BASE64_STANDARD.encode(sig.to_bytes()))
    }

    /// The matching public key.
    #[must_use]
    pub fn to_public(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            key: self.key.verifying_key(),
        }
    }
}

/// A named verification key.
pub struct PublicKey {
    name: String,
    key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Parse `name:base64(32-byte public key)`.
    pub fn parse(s: &str) -> Result<Self> {
        let (name, key) = split_key(s)?;
        let bytes: [u8; 32] = key
            .as_slice()
            .try_into()
            .map_err(|_| FormatError(format!("public key '{name}' has the wrong length")))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| FormatError(format!("public key '{name}' is invalid: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            key,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check a `keyName:base64(sig)` signature over a fingerprint. A
    /// signature by a different key name does not verify.
    #[must_use]
    pub fn verify(&self, fingerprint: &str, signature: &str) -> bool {
        let Some((name, sig)) = signature.split_once(':') else {
            return false;
        };
        if name != self.name {
            return false;
        }
        let Ok(bytes) = BASE64_STANDARD.decode(sig) else {
            return false;
        };
        let bytes: [u8; 64] = match bytes.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(&bytes);
        self.key.verify(fingerprint.as_bytes(), &sig).is_ok()
    }
}

fn split_key(s: &str) -> Result<(&str, Vec<u8>)> {
    let (name, encoded) = s
        .split_once(':')
        .ok_or_else(|| FormatError("key lacks a 'name:' prefix".into()))?;
    if name.is_empty() {
        return Err(FormatError("key has an empty name".into()).into());
    }
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| FormatError(format!("key '{name}' is not valid base64: {e}")))?;
    Ok((name, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecretKey {
        // Deterministic test keypair derived from a fixed seed.
        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let encoded = BASE64_STANDARD.encode(signing.to_keypair_bytes());
        SecretKey::parse(&format!("cache.example.org-1:{encoded}")).expect("valid key")
    }

    #[test]
    fn sign_then_verify() {
        let secret = test_key();
        let public = secret.to_public();
        let fingerprint = "1;/nix/store/abc-x;sha256:ffff;10;";
        let sig = secret.sign(fingerprint);
        assert!(sig.starts_with("cache.example.org-1:"));
        assert!(public.verify(fingerprint, &sig));
        assert!(!public.verify("1;/nix/store/abc-y;sha256:ffff;10;", &sig));
    }

    #[test]
    fn verify_rejects_foreign_key_names() {
        let secret = test_key();
        let public = secret.to_public();
        let sig = secret.sign("payload");
        let forged = sig.replacen("cache.example.org-1", "other-key", 1);
        assert!(!public.verify("payload", &forged));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SecretKey::parse("no-colon").is_err());
        assert!(SecretKey::parse(":empty-name").is_err());
        assert!(SecretKey::parse("k:AAAA").is_err());
    }
}
