//! Build recipes and their canonical serializations.
//!
//! A derivation's textual form is the input to content-addressing, so
//! every collection here is ordered (`BTreeMap`/`BTreeSet`) and the
//! printer iterates in that order. Two equal derivations serialize to
//! identical bytes.

mod hash_modulo;
mod parse;
mod print;
mod wire;

pub use hash_modulo::{hash_derivation_modulo, DerivationResolver, DrvHashes};
pub use parse::parse_derivation;
pub use wire::{read_derivation_wire, write_derivation_wire};

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use silo_core::hash::{encode_base32, Hash, HashAlgo};
use silo_core::store_path::{
    make_fixed_output_path, FileIngestionMethod, StoreDir, StorePath,
};
use silo_core::FormatError;

/// Filename suffix of stored derivations.
pub const DRV_EXTENSION: &str = ".drv";

/// Whether a path name denotes a stored derivation.
#[must_use]
pub fn is_derivation(name: &str) -> bool {
    name.ends_with(DRV_EXTENSION)
}

/// One declared output of a derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationOutput {
    /// The output path is declared up front; its identity comes from the
    /// derivation itself.
    Intensional { path: StorePath },
    /// Content-addressed: the path is a pure function of
    /// `(method, hash, name)`.
    Fixed {
        method: FileIngestionMethod,
        hash: Hash,
    },
}

impl DerivationOutput {
    /// The store path this output materializes at.
    pub fn path(&self, store_dir: &StoreDir, drv_name: &str) -> Result<StorePath> {
        match self {
            Self::Intensional { path } => Ok(path.clone()),
            Self::Fixed { method, hash } => {
                make_fixed_output_path(store_dir, *method, hash, drv_name)
            }
        }
    }
}

/// A build recipe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Derivation {
    pub name: String,
    pub outputs: BTreeMap<String, DerivationOutput>,
    /// Derivations this one consumes, with the output ids it wants.
    /// Absent from the binary codec, which is used post-resolution.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    pub input_srcs: BTreeSet<StorePath>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Derivation {
    /// Look an output up by id.
    pub fn find_output(&self, id: &str) -> Result<&DerivationOutput> {
        self.outputs
            .get(id)
            .ok_or_else(|| FormatError(format!("derivation has no output '{id}'")).into())
    }

    /// Paths of every declared output.
    pub fn output_paths(&self, store_dir: &StoreDir) -> Result<BTreeSet<StorePath>> {
        self.outputs
            .values()
            .map(|o| o.path(store_dir, &self.name))
            .collect()
    }

    #[must_use]
    pub fn output_names(&self) -> BTreeSet<String> {
        self.outputs.keys().cloned().collect()
    }

    /// A fixed-output derivation has exactly one output, `out`, with a
    /// declared content hash.
    #[must_use]
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1
            && self
                .outputs
                .iter()
                .next()
                .is_some_and(|(id, output)| {
                    id == "out" && matches!(output, DerivationOutput::Fixed { .. })
                })
    }

    /// Whether the builder is an in-process builtin rather than a program.
    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.builder.starts_with("builtin:")
    }
}

/// A derivation path plus the outputs a consumer asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePathWithOutputs {
    pub path: StorePath,
    pub outputs: BTreeSet<String>,
}

impl StorePathWithOutputs {
    /// `<abs path>` or `<abs path>!out1,out2`.
    #[must_use]
    pub fn render(&self, store_dir: &StoreDir) -> String {
        if self.outputs.is_empty() {
            store_dir.display_path(&self.path)
        } else {
            format!(
                "{}!{}",
                store_dir.display_path(&self.path),
                self.outputs.iter().cloned().collect::<Vec<_>>().join(",")
            )
        }
    }
}

/// An empty wanted-set means "any output".
#[must_use]
pub fn want_output(output: &str, wanted: &BTreeSet<String>) -> bool {
    wanted.is_empty() || wanted.contains(output)
}

/// Placeholder string substituted for an output path that is not known
/// yet at evaluation time.
#[must_use]
pub fn hash_placeholder(output_name: &str) -> String {
    let digest = Hash::of_bytes(
        HashAlgo::Sha256,
        format!("nix-output:{output_name}").as_bytes(),
    );
    format!("/{}", encode_base32(digest.digest()))
}
