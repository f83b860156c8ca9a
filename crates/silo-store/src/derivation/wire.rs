//! Framed binary codec for resolved derivations.
//!
//! Layout: output count; `(id, outPath, hashAlgo, hash)` per output;
//! input sources; platform; builder; arguments; environment count and
//! pairs. Input derivations are not carried: the binary form is used
//! after resolution, when inputs have been flattened into sources.

use anyhow::Result;
use std::collections::BTreeSet;

use silo_core::hash::Hash;
use silo_core::io::framed::{
    read_num, read_string, read_string_list, write_num, write_string, write_string_list,
};
use silo_core::io::{Sink, Source};
use silo_core::store_path::{FileIngestionMethod, StoreDir};

use super::{Derivation, DerivationOutput};

/// Read a resolved derivation from a framed stream.
pub fn read_derivation_wire(
    source: &mut dyn Source,
    store_dir: &StoreDir,
    name: &str,
) -> Result<Derivation> {
    let mut drv = Derivation {
        name: name.to_string(),
        ..Default::default()
    };

    let n_outputs = read_num(source)?;
    for _ in 0..n_outputs {
        let id = read_string(source)?;
        let path = read_string(source)?;
        let hash_algo = read_string(source)?;
        let hash = read_string(source)?;
        let output = if hash_algo.is_empty() {
            DerivationOutput::Intensional {
                path: store_dir.parse_path(&path)?,
            }
        } else {
            let (method, algo) = match hash_algo.strip_prefix("r:") {
                Some(rest) => (FileIngestionMethod::Recursive, rest),
                None => (FileIngestionMethod::Flat, hash_algo.as_str()),
            };
            DerivationOutput::Fixed {
                method,
                hash: Hash::parse(&hash, algo.parse()?)?,
            }
        };
        drv.outputs.insert(id, output);
    }

    drv.input_srcs = read_string_list(source)?
        .iter()
        .map(|p| store_dir.parse_path(p))
        .collect::<Result<BTreeSet<_>>>()?;
    drv.platform = read_string(source)?;
    drv.builder = read_string(source)?;
    drv.args = read_string_list(source)?;

    let n_env = read_num(source)?;
    for _ in 0..n_env {
        let key = read_string(source)?;
        let value = read_string(source)?;
        drv.env.insert(key, value);
    }

    Ok(drv)
}

/// Write a resolved derivation to a framed stream.
pub fn write_derivation_wire(
    sink: &mut dyn Sink,
    store_dir: &StoreDir,
    drv: &Derivation,
) -> Result<()> {
    write_num(sink, drv.outputs.len() as u64)?;
    for (id, output) in &drv.outputs {
        write_string(sink, id)?;
        let path = output.path(store_dir, &drv.name)?;
        write_string(sink, &store_dir.display_path(&path))?;
        match output {
            DerivationOutput::Fixed { method, hash } => {
                write_string(sink, &method.print_method_algo(hash.algo()))?;
                write_string(sink, &hash.to_base16())?;
            }
            DerivationOutput::Intensional { .. } => {
                write_string(sink, "")?;
                write_string(sink, "")?;
            }
        }
    }
    write_string_list(
        sink,
        drv.input_srcs
            .iter()
            .map(|p| store_dir.display_path(p))
            .collect::<Vec<_>>()
            .iter(),
    )?;
    write_string(sink, &drv.platform)?;
    write_string(sink, &drv.builder)?;
    write_string_list(sink, drv.args.iter())?;
    write_num(sink, drv.env.len() as u64)?;
    for (key, value) in &drv.env {
        write_string(sink, key)?;
        write_string(sink, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::hash::HashAlgo;
    use silo_core::io::{SliceSource, VecSink};
    use silo_core::store_path::StorePath;

    fn sample_path(seed: &str) -> StorePath {
        let digest = Hash::of_bytes(HashAlgo::Sha256, seed.as_bytes());
        let folded = silo_core::store_path::compress_hash(digest.digest(), 20);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&folded);
        StorePath::from_parts(&arr, seed).expect("valid name")
    }

    #[test]
    fn wire_round_trip_drops_nothing_it_carries() -> Result<()> {
        let dir = StoreDir::default();
        let mut drv = Derivation {
            name: "widget".into(),
            platform: "aarch64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec!["-e".into(), "build.sh".into()],
            ..Default::default()
        };
        drv.outputs.insert(
            "out".into(),
            DerivationOutput::Fixed {
                method: FileIngestionMethod::Recursive,
                hash: Hash::of_bytes(HashAlgo::Sha256, b"tree"),
            },
        );
        drv.outputs.insert(
            "doc".into(),
            DerivationOutput::Intensional {
                path: sample_path("widget-doc"),
            },
        );
        drv.input_srcs.insert(sample_path("builder-script"));
        drv.env.insert("PATH".into(), "/bin".into());

        let mut sink = VecSink::default();
        write_derivation_wire(&mut sink, &dir, &drv)?;
        let mut source = SliceSource::new(&sink.bytes);
        let parsed = read_derivation_wire(&mut source, &dir, "widget")?;
        assert_eq!(parsed, drv);
        Ok(())
    }

    #[test]
    fn input_derivations_are_not_carried() -> Result<()> {
        let dir = StoreDir::default();
        let mut drv = Derivation {
            name: "resolved".into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            ..Default::default()
        };
        drv.input_drvs
            .insert(sample_path("dep.drv"), BTreeSet::from(["out".to_string()]));

        let mut sink = VecSink::default();
        write_derivation_wire(&mut sink, &dir, &drv)?;
        let mut source = SliceSource::new(&sink.bytes);
        let parsed = read_derivation_wire(&mut source, &dir, "resolved")?;
        assert!(parsed.input_drvs.is_empty());
        Ok(())
    }
}
