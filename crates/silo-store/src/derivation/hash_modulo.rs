//! Derivation hashing modulo fixed-output dependencies.
//!
//! A fixed-output derivation contributes only `(method, algo, hash,
//! outPath)` to the hashes of its dependents, so changing how such an
//! artifact is fetched does not ripple output paths through the whole
//! dependency graph. For everything else the input-derivation paths are
//! replaced by the recursive hash of the input itself, which makes the
//! result invariant under content-equivalent substitution of inputs.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use silo_core::hash::{Hash, HashAlgo};
use silo_core::store_path::{StoreDir, StorePath};

use super::{Derivation, DerivationOutput};

/// Reads stored derivations on behalf of the hasher.
pub trait DerivationResolver {
    fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation>;
}

/// Memo table keyed by derivation path. Derivation files are immutable,
/// so entries are never invalidated; a racing double-compute writes the
/// same value twice.
#[derive(Debug, Default)]
pub struct DrvHashes {
    memo: Mutex<HashMap<StorePath, Hash>>,
}

impl DrvHashes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, drv_path: &StorePath) -> Option<Hash> {
        self.memo.lock().expect("memo lock").get(drv_path).cloned()
    }

    fn insert(&self, drv_path: StorePath, hash: Hash) {
        self.memo.lock().expect("memo lock").insert(drv_path, hash);
    }
}

/// Hash a derivation modulo its fixed-output dependencies.
pub fn hash_derivation_modulo(
    resolver: &dyn DerivationResolver,
    memo: &DrvHashes,
    store_dir: &StoreDir,
    drv: &Derivation,
    mask_outputs: bool,
) -> Result<Hash> {
    if drv.is_fixed_output() {
        let (_, output) = drv.outputs.iter().next().expect("fixed-output has one output");
        let DerivationOutput::Fixed { method, hash } = output else {
            unreachable!("is_fixed_output checked the variant");
        };
        let out_path = output.path(store_dir, &drv.name)?;
        let preimage = format!(
            "fixed:out:{}:{}:{}",
            method.print_method_algo(hash.algo()),
            hash.to_base16(),
            store_dir.display_path(&out_path)
        );
        return Ok(Hash::of_bytes(HashAlgo::Sha256, preimage.as_bytes()));
    }

    // Replace each input derivation path with the hex rendering of its
    // own modulo-hash. Computation happens outside the memo lock.
    let mut inputs2: BTreeMap<String, _> = BTreeMap::new();
    for (drv_path, wanted_outputs) in &drv.input_drvs {
        let hash = match memo.lookup(drv_path) {
            Some(hash) => hash,
            None => {
                let input = resolver.read_derivation(drv_path).with_context(|| {
                    format!("while hashing the input derivation '{drv_path}'")
                })?;
                let hash =
                    hash_derivation_modulo(resolver, memo, store_dir, &input, false)?;
                memo.insert(drv_path.clone(), hash.clone());
                hash
            }
        };
        inputs2.insert(hash.to_base16(), wanted_outputs.clone());
    }

    let text = drv.unparse(store_dir, mask_outputs, Some(&inputs2))?;
    Ok(Hash::of_bytes(HashAlgo::Sha256, text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::store_path::{compress_hash, FileIngestionMethod};
    use std::collections::BTreeSet;

    struct MapResolver(HashMap<StorePath, Derivation>);

    impl DerivationResolver for MapResolver {
        fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation> {
            self.0
                .get(drv_path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown derivation '{drv_path}'"))
        }
    }

    fn path(seed: &str, name: &str) -> StorePath {
        let digest = Hash::of_bytes(HashAlgo::Sha256, seed.as_bytes());
        let folded = compress_hash(digest.digest(), 20);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&folded);
        StorePath::from_parts(&arr, name).expect("valid name")
    }

    fn fixed_drv(name: &str, url: &str) -> Derivation {
        let mut drv = Derivation {
            name: name.to_string(),
            platform: "x86_64-linux".into(),
            builder: "builtin:fetchurl".into(),
            ..Default::default()
        };
        drv.outputs.insert(
            "out".into(),
            DerivationOutput::Fixed {
                method: FileIngestionMethod::Flat,
                hash: Hash::of_bytes(HashAlgo::Sha256, b"downloaded bytes"),
            },
        );
        // The fetch location varies; the declared contents do not.
        drv.env.insert("url".into(), url.to_string());
        drv
    }

    fn dependent(name: &str, input: &StorePath) -> Derivation {
        let mut drv = Derivation {
            name: name.to_string(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            ..Default::default()
        };
        drv.outputs.insert(
            "out".into(),
            DerivationOutput::Intensional {
                path: path(&format!("{name}-out"), name),
            },
        );
        drv.input_drvs
            .insert(input.clone(), BTreeSet::from(["out".to_string()]));
        drv
    }

    #[test]
    fn fixed_output_hash_ignores_everything_but_the_output() -> Result<()> {
        let dir = StoreDir::default();
        let resolver = MapResolver(HashMap::new());
        let memo = DrvHashes::new();
        let a = fixed_drv("tarball", "https://mirror-one.example/t.tar");
        let b = fixed_drv("tarball", "https://mirror-two.example/t.tar");
        let ha = hash_derivation_modulo(&resolver, &memo, &dir, &a, false)?;
        let hb = hash_derivation_modulo(&resolver, &memo, &dir, &b, false)?;
        assert_eq!(ha, hb);
        Ok(())
    }

    #[test]
    fn dependents_are_stable_under_equivalent_input_substitution() -> Result<()> {
        let dir = StoreDir::default();
        // B and B' differ in their fetch URL only, so they hash alike.
        let b = fixed_drv("dep", "https://mirror-one.example/d.tar");
        let b_alt = fixed_drv("dep", "https://mirror-two.example/d.tar");
        let b_path = path("b", "dep.drv");
        let b_alt_path = path("b-alt", "dep.drv");

        let a = dependent("app", &b_path);
        let a_alt = dependent("app", &b_alt_path);

        let mut known = HashMap::new();
        known.insert(b_path, b);
        known.insert(b_alt_path, b_alt);
        let resolver = MapResolver(known);

        let ha = hash_derivation_modulo(&resolver, &DrvHashes::new(), &dir, &a, false)?;
        let ha_alt =
            hash_derivation_modulo(&resolver, &DrvHashes::new(), &dir, &a_alt, false)?;
        assert_eq!(ha, ha_alt);
        Ok(())
    }

    #[test]
    fn memo_spares_repeat_reads() -> Result<()> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingResolver {
            inner: MapResolver,
            reads: AtomicUsize,
        }
        impl DerivationResolver for CountingResolver {
            fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation> {
                self.reads.fetch_add(1, Ordering::SeqCst);
                self.inner.read_derivation(drv_path)
            }
        }

        let dir = StoreDir::default();
        let b_path = path("b", "dep.drv");
        let mut known = HashMap::new();
        known.insert(b_path.clone(), fixed_drv("dep", "https://x.example/d"));
        let resolver = CountingResolver {
            inner: MapResolver(known),
            reads: AtomicUsize::new(0),
        };

        let memo = DrvHashes::new();
        let a = dependent("app", &b_path);
        hash_derivation_modulo(&resolver, &memo, &dir, &a, false)?;
        hash_derivation_modulo(&resolver, &memo, &dir, &a, false)?;
        assert_eq!(resolver.reads.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
