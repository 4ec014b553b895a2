pub mod reader;
pub mod writer;

// This package provides facilities to both read and write shards.
//
// A shard is an immutable set of address strings, written once by the
// partitioner and read back by the combiner.
//
// Physically, a shard is a 12 byte header followed by a body:
// * the magic bytes "ADRS",
// * the number of records as a u32,
// * the length of the body in bytes as a u32.
//
// The body holds the records sorted by their UTF-8 bytes. Each entry is
// represented by a pair (u32, u32) followed by bytes, where the first
// coordinate is the length of the bytes and the second is the length of the
// prefix shared with the previous entry. Addresses share long prefixes once
// sorted, so this keeps shards small. Entries are length-prefixed, so the
// bytes are stored raw and a 0x00 inside a record needs no escaping.
//
// The header makes a shard self-describing: a file that was appended to, or
// cut short, no longer matches its body length and is rejected on read.
use std::fmt;

use crate::fs::ShardDir;

pub(crate) const MAGIC: [u8; 4] = *b"ADRS";
pub(crate) const HEADER_LEN: usize = 12;

/// Index of a shard within a run. Shards are numbered densely from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn next(self) -> Self {
        ShardId(self.0 + 1)
    }

    pub fn file_name(self, extension: &str) -> String {
        format!("{}.{}", self, extension)
    }

    pub fn tmp_name(self, extension: &str) -> String {
        format!("{}.{}.tmp", self, extension)
    }

    /// Parses a name of the form produced by [`ShardId::file_name`]. Only
    /// decimal digits are accepted, and at least two of them.
    pub fn parse(fname: &str, extension: &str) -> Option<Self> {
        let stem = fname
            .strip_suffix(extension)
            .and_then(|s| s.strip_suffix('.'))?;
        if stem.len() < 2 || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().map(ShardId)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Whether `fname` is something a partitioner run leaves behind: a shard or
/// an unfinished temporary shard.
pub fn is_shard_artifact(fname: &str, extension: &str) -> bool {
    ShardId::parse(fname, extension).is_some()
        || fname
            .strip_suffix(".tmp")
            .and_then(|s| ShardId::parse(s, extension))
            .is_some()
}

/// Lists the shards in `dir`, ordered by shard index. The directory listing
/// order is not stable across filesystems, so positions are only meaningful
/// after this sort.
pub fn list_shards<D: ShardDir>(
    dir: &mut D,
    extension: &str,
) -> anyhow::Result<Vec<(ShardId, String)>> {
    let mut shards: Vec<_> = dir
        .ls()?
        .into_iter()
        .filter_map(|name| match ShardId::parse(&name, extension) {
            Some(id) => Some((id, name)),
            None => {
                tracing::debug!(file = %name, "ignoring non-shard file");
                None
            }
        })
        .collect();
    // "07" and "007" both parse to 7; the name keeps the order total.
    shards.sort();
    Ok(shards)
}
