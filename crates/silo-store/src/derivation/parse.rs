//! Parser for the textual `Derive(...)` form.
//!
//! The grammar is whitespace-sensitive: no token skipping, every literal
//! is matched exactly. Any mismatch fails with a
//! [`FormatError`](silo_core::FormatError).

use anyhow::Result;
use std::collections::BTreeSet;

use silo_core::hash::Hash;
use silo_core::store_path::{FileIngestionMethod, StoreDir};
use silo_core::FormatError;

use super::{Derivation, DerivationOutput};

/// Parse a derivation from its textual form. `name` is the derivation
/// name (the file basename without the hash part and `.drv` suffix).
pub fn parse_derivation(store_dir: &StoreDir, s: &str, name: &str) -> Result<Derivation> {
    let mut p = Parser {
        bytes: s.as_bytes(),
        pos: 0,
    };
    let mut drv = Derivation {
        name: name.to_string(),
        ..Default::default()
    };

    p.expect("Derive([")?;
    while !p.end_of_list()? {
        p.expect("(")?;
        let id = p.parse_string()?;
        let output = parse_output(store_dir, &mut p)?;
        drv.outputs.insert(id, output);
    }

    p.expect(",[")?;
    while !p.end_of_list()? {
        p.expect("(")?;
        let drv_path = store_dir.parse_path(&p.parse_path()?)?;
        p.expect(",[")?;
        let mut outputs = BTreeSet::new();
        while !p.end_of_list()? {
            outputs.insert(p.parse_string()?);
        }
        p.expect(")")?;
        drv.input_drvs.insert(drv_path, outputs);
    }

    p.expect(",[")?;
    while !p.end_of_list()? {
        drv.input_srcs.insert(store_dir.parse_path(&p.parse_path()?)?);
    }

    p.expect(",")?;
    drv.platform = p.parse_string()?;
    p.expect(",")?;
    drv.builder = p.parse_string()?;

    p.expect(",[")?;
    while !p.end_of_list()? {
        drv.args.push(p.parse_string()?);
    }

    p.expect(",[")?;
    while !p.end_of_list()? {
        p.expect("(")?;
        let name = p.parse_string()?;
        p.expect(",")?;
        let value = p.parse_string()?;
        p.expect(")")?;
        drv.env.insert(name, value);
    }

    p.expect(")")?;
    Ok(drv)
}

fn parse_output(store_dir: &StoreDir, p: &mut Parser<'_>) -> Result<DerivationOutput> {
    p.expect(",")?;
    let path = p.parse_path()?;
    p.expect(",")?;
    let hash_algo = p.parse_string()?;
    p.expect(",")?;
    let hash = p.parse_string()?;
    p.expect(")")?;

    if hash_algo.is_empty() {
        Ok(DerivationOutput::Intensional {
            path: store_dir.parse_path(&path)?,
        })
    } else {
        let (method, algo) = match hash_algo.strip_prefix("r:") {
            Some(rest) => (FileIngestionMethod::Recursive, rest),
            None => (FileIngestionMethod::Flat, hash_algo.as_str()),
        };
        let algo = algo.parse()?;
        Ok(DerivationOutput::Fixed {
            method,
            hash: Hash::parse(&hash, algo)?,
        })
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn next(&mut self) -> Result<u8> {
        let c = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| FormatError("unexpected end of derivation".into()))?;
        self.pos += 1;
        Ok(c)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, literal: &str) -> Result<()> {
        let end = self.pos + literal.len();
        if self.bytes.get(self.pos..end) != Some(literal.as_bytes()) {
            return Err(FormatError(format!("expected string '{literal}'")).into());
        }
        self.pos = end;
        Ok(())
    }

    fn parse_string(&mut self) -> Result<String> {
        self.expect("\"")?;
        let mut out = Vec::new();
        loop {
            match self.next()? {
                b'"' => break,
                b'\\' => match self.next()? {
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    c => out.push(c),
                },
                c => out.push(c),
            }
        }
        String::from_utf8(out)
            .map_err(|e| FormatError(format!("derivation string is not UTF-8: {e}")).into())
    }

    fn parse_path(&mut self) -> Result<String> {
        let s = self.parse_string()?;
        if !s.starts_with('/') {
            return Err(FormatError(format!("bad path '{s}' in derivation")).into());
        }
        Ok(s)
    }

    fn end_of_list(&mut self) -> Result<bool> {
        match self.peek() {
            Some(b',') => {
                self.pos += 1;
                Ok(false)
            }
            Some(b']') => {
                self.pos += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::hash::HashAlgo;
    use std::collections::BTreeMap;

    fn sample_drv() -> Derivation {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "out".to_string(),
            DerivationOutput::Fixed {
                method: FileIngestionMethod::Flat,
                hash: Hash::of_bytes(HashAlgo::Sha256, b"fixed contents"),
            },
        );
        let mut env = BTreeMap::new();
        env.insert("name".to_string(), "hi".to_string());
        Derivation {
            name: "hi".to_string(),
            outputs,
            input_drvs: BTreeMap::new(),
            input_srcs: BTreeSet::new(),
            platform: "x86_64-linux".to_string(),
            builder: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo hi".to_string()],
            env,
        }
    }

    #[test]
    fn round_trips_a_fixed_output_derivation() -> Result<()> {
        let dir = StoreDir::default();
        let drv = sample_drv();
        let text = drv.unparse(&dir, false, None)?;
        assert!(text.starts_with("Derive([(\"out\",\""));
        let parsed = parse_derivation(&dir, &text, "hi")?;
        assert_eq!(parsed, drv);
        Ok(())
    }

    #[test]
    fn unparse_is_byte_stable() -> Result<()> {
        let dir = StoreDir::default();
        let drv = sample_drv();
        assert_eq!(drv.unparse(&dir, false, None)?, drv.unparse(&dir, false, None)?);
        Ok(())
    }

    #[test]
    fn escapes_survive_the_round_trip() -> Result<()> {
        let dir = StoreDir::default();
        let mut drv = sample_drv();
        drv.args = vec!["line1\nline2".into(), "tab\there".into(), "q\"uote\\s".into()];
        drv.env
            .insert("weird".into(), "a\rb\tc\"d\\e".into());
        let text = drv.unparse(&dir, false, None)?;
        assert_eq!(parse_derivation(&dir, &text, "hi")?, drv);
        Ok(())
    }

    #[test]
    fn whitespace_between_tokens_is_rejected() -> Result<()> {
        let dir = StoreDir::default();
        let text = sample_drv().unparse(&dir, false, None)?;
        let spaced = text.replacen("],[", "], [", 1);
        let err = parse_derivation(&dir, &spaced, "hi").unwrap_err();
        assert!(err.downcast_ref::<FormatError>().is_some());
        Ok(())
    }

    #[test]
    fn relative_paths_are_rejected() {
        let dir = StoreDir::default();
        let text = r#"Derive([("out","relative/path","","")],[],[],"x","/bin/sh",[],[])"#;
        let err = parse_derivation(&dir, text, "x").unwrap_err();
        assert!(err.downcast_ref::<FormatError>().is_some());
    }

    #[test]
    fn empty_lists_print_as_brackets() -> Result<()> {
        let dir = StoreDir::default();
        let drv = Derivation {
            name: "empty".into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/true".into(),
            ..Default::default()
        };
        let text = drv.unparse(&dir, false, None)?;
        assert_eq!(
            text,
            r#"Derive([],[],[],"x86_64-linux","/bin/true",[],[])"#
        );
        assert_eq!(parse_derivation(&dir, &text, "empty")?, drv);
        Ok(())
    }

    #[test]
    fn masked_outputs_blank_paths_and_matching_env() -> Result<()> {
        let dir = StoreDir::default();
        let mut drv = sample_drv();
        drv.env.insert("out".into(), "/somewhere".into());
        let masked = drv.unparse(&dir, true, None)?;
        assert!(masked.contains(r#"("out","","sha256"#));
        assert!(masked.contains(r#"("out","")"#));
        assert!(masked.contains(r#"("name","hi")"#));
        Ok(())
    }
}
