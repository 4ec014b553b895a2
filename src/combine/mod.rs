use std::collections::HashSet;

use anyhow::anyhow;

use crate::{
    fs::ShardDir,
    shard::{
        list_shards,
        reader::{decode_shard, read_shard_bytes},
    },
};

pub const BUCKET_COUNT: usize = 5;

// Position 20 always lands in the last bucket, whatever the shard count. The
// quartile ranges below never produce bucket 4 on their own.
const CARVE_OUT_POSITION: usize = 20;
const CARVE_OUT_BUCKET: usize = 4;

/// Picks the bucket for the shard at `position` (0-based, in shard index
/// order) out of `total` shards.
pub fn bucket_for(position: usize, total: usize) -> usize {
    let half = total / 2;
    let quarter = half / 2;

    if position == CARVE_OUT_POSITION {
        CARVE_OUT_BUCKET
    } else if position < quarter {
        0
    } else if position < half {
        1
    } else if position < half + quarter {
        2
    } else {
        3
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buckets {
    sets: [HashSet<String>; BUCKET_COUNT],
}

impl Buckets {
    pub fn new() -> Self {
        Self::default()
    }

    fn merge(&mut self, bucket: usize, records: HashSet<String>) {
        let set = &mut self.sets[bucket];
        if set.is_empty() {
            *set = records;
        } else {
            set.extend(records);
        }
    }

    pub fn get(&self, bucket: usize) -> Option<&HashSet<String>> {
        self.sets.get(bucket)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HashSet<String>> {
        self.sets.iter()
    }

    /// Sum of the bucket sizes. A record held by two buckets counts twice.
    pub fn total_len(&self) -> usize {
        self.sets.iter().map(HashSet::len).sum()
    }

    /// Number of distinct records across all buckets.
    pub fn unique_len(&self) -> usize {
        self.sets
            .iter()
            .flatten()
            .map(String::as_str)
            .collect::<HashSet<&str>>()
            .len()
    }

    pub fn contains(&self, record: &str) -> bool {
        self.sets.iter().any(|set| set.contains(record))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombineReport {
    pub buckets: Buckets,
    /// Shards that were found, including the skipped ones.
    pub shards_found: usize,
    /// Names of shards that failed to decode and contributed nothing.
    pub skipped: Vec<String>,
}

/// Reads every shard in `dir` and merges it into its bucket.
///
/// A shard that does not decode is logged and skipped. Failing to list, open
/// or read a shard is a filesystem error and ends the run.
pub fn combine<D>(dir: &mut D, extension: &str) -> anyhow::Result<CombineReport>
where
    D: ShardDir,
{
    let shards = list_shards(dir, extension)?;
    let total = shards.len();
    let mut report = CombineReport {
        shards_found: total,
        ..CombineReport::default()
    };

    for (position, (_, name)) in shards.into_iter().enumerate() {
        tracing::debug!(shard = %name, "reading shard {}/{}", position + 1, total);

        let mut file = dir
            .open(&name)?
            .ok_or_else(|| anyhow!("shard {} disappeared while combining", name))?;
        let data = read_shard_bytes(&mut file)?;

        match decode_shard(&data) {
            Ok(records) => {
                let bucket = bucket_for(position, total);
                tracing::debug!(shard = %name, bucket, records = records.len(), "merged shard");
                report.buckets.merge(bucket, records);
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!(shard = %name, %error, "skipping unreadable shard");
                report.skipped.push(name);
            }
        }
    }

    tracing::info!(
        shards = total,
        skipped = report.skipped.len(),
        total = report.buckets.total_len(),
        unique = report.buckets.unique_len(),
        "combining complete"
    );

    Ok(report)
}
