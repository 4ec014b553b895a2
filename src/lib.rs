//! Loads a large list of addresses into deduplicated on-disk shards, and
//! reads the shards back into five in-memory buckets.
//!
//! The two phases only share the shard directory. [`partition`] writes it,
//! [`combine`] reads it.

pub mod combine;
pub mod config;
pub mod fs;
pub mod partition;
pub mod shard;

pub use combine::{bucket_for, combine, Buckets, CombineReport, BUCKET_COUNT};
pub use config::Config;
pub use fs::{OsDir, ShardDir};
pub use partition::{partition_file, partition_lines, PartitionOptions, PartitionSummary};
pub use shard::ShardId;
