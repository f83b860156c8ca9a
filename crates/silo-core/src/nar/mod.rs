//! The nested-archive (NAR) serialization.
//!
//! NARs are the canonical byte form of a filesystem subtree: regular
//! files (with an executable bit), symlinks and directories with entries
//! in name order, all framed with the primitives in [`crate::io::framed`].
//! Nothing else survives serialization, which is what makes the format
//! reproducible enough to hash.

mod accessor;
mod dump;

pub use accessor::{NarAccessor, NarNode};
pub use dump::{dump_bytes, dump_path};

use crate::io::framed::write_string;
use crate::io::VecSink;

/// Version tag opening every archive.
pub const NAR_VERSION_MAGIC: &str = "nix-archive-1";

/// The encoded bytes every archive starts with.
#[must_use]
pub fn magic_prefix() -> Vec<u8> {
    let mut sink = VecSink::default();
    write_string(&mut sink, NAR_VERSION_MAGIC).expect("writing to memory cannot fail");
    sink.bytes
}

/// Check that a byte buffer carries the archive magic.
#[must_use]
pub fn has_magic_prefix(nar: &[u8]) -> bool {
    let magic = magic_prefix();
    nar.len() >= magic.len() && nar[..magic.len()] == magic[..]
}

/// Serialize a directory listing of the archive as the `{version: 1}`
/// JSON document published next to stored blobs.
#[must_use]
pub fn write_listing(accessor: &NarAccessor) -> serde_json::Value {
    serde_json::json!({
        "version": 1,
        "root": listing_node(accessor.root()),
    })
}

fn listing_node(node: &NarNode) -> serde_json::Value {
    match node {
        NarNode::Regular {
            executable,
            contents,
        } => {
            let mut obj = serde_json::json!({
                "type": "regular",
                "size": contents.len(),
            });
            if *executable {
                obj["executable"] = serde_json::Value::Bool(true);
            }
            obj
        }
        NarNode::Symlink { target } => serde_json::json!({
            "type": "symlink",
            "target": target,
        }),
        NarNode::Directory(entries) => {
            let mut map = serde_json::Map::new();
            for (name, child) in entries {
                map.insert(name.clone(), listing_node(child));
            }
            serde_json::json!({
                "type": "directory",
                "entries": map,
            })
        }
    }
}
