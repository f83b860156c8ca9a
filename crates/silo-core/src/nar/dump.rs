//! Archive serialization: filesystem subtree or in-memory bytes to NAR.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::NAR_VERSION_MAGIC;
use crate::io::framed::{write_num, write_padding, write_string};
use crate::io::Sink;
use crate::pool::check_interrupt;

/// Serialize the subtree rooted at `path` into `sink`.
pub fn dump_path(path: &Path, sink: &mut dyn Sink) -> Result<()> {
    write_string(sink, NAR_VERSION_MAGIC)?;
    dump_node(path, sink)
}

/// Serialize a byte buffer as an archive holding one regular file.
pub fn dump_bytes(contents: &[u8], sink: &mut dyn Sink) -> Result<()> {
    write_string(sink, NAR_VERSION_MAGIC)?;
    write_string(sink, "(")?;
    write_string(sink, "type")?;
    write_string(sink, "regular")?;
    write_contents(contents, sink)?;
    write_string(sink, ")")
}

fn dump_node(path: &Path, sink: &mut dyn Sink) -> Result<()> {
    check_interrupt()?;
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let file_type = metadata.file_type();

    write_string(sink, "(")?;
    write_string(sink, "type")?;
    if file_type.is_file() {
        write_string(sink, "regular")?;
        if is_executable(&metadata) {
            write_string(sink, "executable")?;
            write_string(sink, "")?;
        }
        let contents = fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        write_contents(&contents, sink)?;
    } else if file_type.is_symlink() {
        write_string(sink, "symlink")?;
        write_string(sink, "target")?;
        let target = fs::read_link(path)
            .with_context(|| format!("failed to read symlink {}", path.display()))?;
        write_string(sink, &target.to_string_lossy())?;
    } else if file_type.is_dir() {
        write_string(sink, "directory")?;
        let mut entries: Vec<_> = fs::read_dir(path)
            .with_context(|| format!("failed to list {}", path.display()))?
            .collect::<std::io::Result<_>>()?;
        // Entry order is part of the serialization.
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name();
            write_string(sink, "entry")?;
            write_string(sink, "(")?;
            write_string(sink, "name")?;
            write_string(sink, &name.to_string_lossy())?;
            write_string(sink, "node")?;
            dump_node(&entry.path(), sink)?;
            write_string(sink, ")")?;
        }
    } else {
        return Err(anyhow::anyhow!(
            "refusing to archive special file {}",
            path.display()
        ));
    }
    write_string(sink, ")")
}

fn write_contents(contents: &[u8], sink: &mut dyn Sink) -> Result<()> {
    write_string(sink, "contents")?;
    write_num(sink, contents.len() as u64)?;
    sink.write(contents)?;
    write_padding(sink, contents.len() as u64)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::VecSink;
    use crate::nar::NarAccessor;
    use tempfile::tempdir;

    #[test]
    fn dump_is_deterministic_and_ordered() -> Result<()> {
        let temp = tempdir()?;
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("sub"))?;
        fs::write(root.join("b.txt"), b"bee")?;
        fs::write(root.join("a.txt"), b"ay")?;
        fs::write(root.join("sub/inner"), b"deep")?;

        let mut first = VecSink::default();
        dump_path(&root, &mut first)?;
        let mut second = VecSink::default();
        dump_path(&root, &mut second)?;
        assert_eq!(first.bytes, second.bytes);

        let accessor = NarAccessor::from_bytes(&first.bytes)?;
        assert_eq!(accessor.read_directory("/")?, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(accessor.read_file("/sub/inner")?, b"deep");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_and_exec_bits_survive() -> Result<()> {
        use std::os::unix::fs::{symlink, PermissionsExt};
        let temp = tempdir()?;
        let root = temp.path().join("tree");
        fs::create_dir_all(&root)?;
        fs::write(root.join("run"), b"#!/bin/sh\n")?;
        fs::set_permissions(root.join("run"), fs::Permissions::from_mode(0o755))?;
        symlink("run", root.join("link"))?;

        let mut sink = VecSink::default();
        dump_path(&root, &mut sink)?;
        let accessor = NarAccessor::from_bytes(&sink.bytes)?;
        match accessor.stat("/run").expect("present") {
            crate::nar::NarNode::Regular { executable, .. } => assert!(executable),
            other => panic!("expected regular file, got {other:?}"),
        }
        match accessor.stat("/link").expect("present") {
            crate::nar::NarNode::Symlink { target } => assert_eq!(target, "run"),
            other => panic!("expected symlink, got {other:?}"),
        }
        Ok(())
    }
}
