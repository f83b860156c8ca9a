//! In-memory view over a parsed archive.
//!
//! Ingestion needs random access into a NAR it already holds in memory
//! (listing generation, debuginfo scans, reading stored derivations), so
//! the parser materializes the whole tree.

use anyhow::Result;
use std::collections::BTreeMap;

use super::NAR_VERSION_MAGIC;
use crate::io::framed::{read_num, read_padding, read_string};
use crate::io::{read_exact, SliceSource, Source};
use crate::FormatError;

/// One node of an unpacked archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarNode {
    Regular { executable: bool, contents: Vec<u8> },
    Symlink { target: String },
    Directory(BTreeMap<String, NarNode>),
}

/// Parsed archive with path-based lookups.
#[derive(Debug)]
pub struct NarAccessor {
    root: NarNode,
}

impl NarAccessor {
    /// Parse a complete archive held in memory.
    pub fn from_bytes(nar: &[u8]) -> Result<Self> {
        let mut source = SliceSource::new(nar);
        expect(&mut source, NAR_VERSION_MAGIC)?;
        let root = parse_node(&mut source)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &NarNode {
        &self.root
    }

    /// Look a node up by `/`-separated path; `/` or the empty string name
    /// the root.
    #[must_use]
    pub fn stat(&self, path: &str) -> Option<&NarNode> {
        let mut node = &self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            match node {
                NarNode::Directory(entries) => node = entries.get(part)?,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Entry names of a directory node, in archive (name) order.
    pub fn read_directory(&self, path: &str) -> Result<Vec<String>> {
        match self.stat(path) {
            Some(NarNode::Directory(entries)) => Ok(entries.keys().cloned().collect()),
            Some(_) => Err(FormatError(format!("'{path}' is not a directory")).into()),
            None => Err(FormatError(format!("no such archive member '{path}'")).into()),
        }
    }

    /// Contents of a regular-file node.
    pub fn read_file(&self, path: &str) -> Result<&[u8]> {
        match self.stat(path) {
            Some(NarNode::Regular { contents, .. }) => Ok(contents),
            Some(_) => Err(FormatError(format!("'{path}' is not a regular file")).into()),
            None => Err(FormatError(format!("no such archive member '{path}'")).into()),
        }
    }
}

fn expect(source: &mut dyn Source, expected: &str) -> Result<()> {
    let token = read_string(source)?;
    if token != expected {
        return Err(FormatError(format!(
            "archive token '{token}' where '{expected}' was expected"
        ))
        .into());
    }
    Ok(())
}

fn parse_node(source: &mut dyn Source) -> Result<NarNode> {
    expect(source, "(")?;
    expect(source, "type")?;
    let node = match read_string(source)?.as_str() {
        "regular" => {
            let mut executable = false;
            let mut token = read_string(source)?;
            if token == "executable" {
                expect(source, "")?;
                executable = true;
                token = read_string(source)?;
            }
            if token != "contents" {
                return Err(FormatError(format!(
                    "archive token '{token}' where 'contents' was expected"
                ))
                .into());
            }
            let len = read_num(source)?;
            if len > (1 << 33) {
                return Err(FormatError(format!(
                    "archive member of {len} bytes is too large"
                ))
                .into());
            }
            let mut contents = vec![0u8; len as usize];
            read_exact(source, &mut contents)?;
            read_padding(source, len)?;
            NarNode::Regular {
                executable,
                contents,
            }
        }
        "symlink" => {
            expect(source, "target")?;
            NarNode::Symlink {
                target: read_string(source)?,
            }
        }
        "directory" => {
            let mut entries = BTreeMap::new();
            loop {
                match read_string(source)?.as_str() {
                    ")" => return Ok(NarNode::Directory(entries)),
                    "entry" => {
                        expect(source, "(")?;
                        expect(source, "name")?;
                        let name = read_string(source)?;
                        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                            return Err(FormatError(format!(
                                "invalid archive entry name '{name}'"
                            ))
                            .into());
                        }
                        expect(source, "node")?;
                        let node = parse_node(source)?;
                        expect(source, ")")?;
                        if entries.insert(name.clone(), node).is_some() {
                            return Err(FormatError(format!(
                                "duplicate archive entry '{name}'"
                            ))
                            .into());
                        }
                    }
                    other => {
                        return Err(FormatError(format!(
                            "archive token '{other}' inside directory"
                        ))
                        .into())
                    }
                }
            }
        }
        other => {
            return Err(FormatError(format!("unknown archive node type '{other}'")).into())
        }
    };
    expect(source, ")")?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::framed::write_string;
    use crate::io::{Sink, VecSink};
    use crate::nar::dump_bytes;

    #[test]
    fn flat_archive_round_trips() -> Result<()> {
        let mut sink = VecSink::default();
        dump_bytes(b"payload", &mut sink)?;
        let accessor = NarAccessor::from_bytes(&sink.bytes)?;
        assert_eq!(accessor.read_file("/")?, b"payload");
        assert!(accessor.read_directory("/").is_err());
        Ok(())
    }

    #[test]
    fn rejects_missing_magic() {
        let mut sink = VecSink::default();
        write_string(&mut sink, "not-an-archive").unwrap();
        let err = NarAccessor::from_bytes(&sink.bytes).unwrap_err();
        assert!(err.downcast_ref::<FormatError>().is_some());
    }

    #[test]
    fn rejects_truncated_contents() -> Result<()> {
        let mut sink = VecSink::default();
        dump_bytes(b"0123456789abcdef", &mut sink)?;
        sink.bytes.truncate(sink.bytes.len() - 9);
        assert!(NarAccessor::from_bytes(&sink.bytes).is_err());
        Ok(())
    }

    #[test]
    fn stat_walks_nested_directories() -> Result<()> {
        // Hand-build directory > entry "bin" > regular file.
        let mut sink = VecSink::default();
        for token in [NAR_VERSION_MAGIC, "(", "type", "directory", "entry", "(", "name", "bin", "node"] {
            write_string(&mut sink, token)?;
        }
        dump_node_regular(&mut sink, b"x")?;
        for token in [")", ")"] {
            write_string(&mut sink, token)?;
        }
        let accessor = NarAccessor::from_bytes(&sink.bytes)?;
        assert!(matches!(accessor.stat("/bin"), Some(NarNode::Regular { .. })));
        assert!(accessor.stat("/bin/deeper").is_none());
        assert!(accessor.stat("/missing").is_none());
        Ok(())
    }

    fn dump_node_regular(sink: &mut dyn Sink, contents: &[u8]) -> Result<()> {
        use crate::io::framed::{write_num, write_padding};
        for token in ["(", "type", "regular", "contents"] {
            write_string(sink, token)?;
        }
        write_num(sink, contents.len() as u64)?;
        sink.write(contents)?;
        write_padding(sink, contents.len() as u64)?;
        write_string(sink, ")")
    }
}
