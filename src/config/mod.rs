use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use serde::Deserialize;

pub const DEFAULT_INPUT: &str = "addresses_with_balance.txt";
pub const DEFAULT_SHARD_DIR: &str = "database";
pub const DEFAULT_MAX_SET_SIZE: usize = 1_000_000;
pub const DEFAULT_PREFIX: char = '1';
pub const DEFAULT_EXTENSION: &str = "shard";

/// Settings for a loader run. Every field has a default, so a config file
/// only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Line-oriented input, one candidate address per line.
    pub input: PathBuf,
    /// Directory the shards are written to and read from.
    pub shard_dir: PathBuf,
    /// Accepted lines per shard before the working set is flushed.
    pub max_set_size: usize,
    /// Lines are only accepted if they start with this character.
    pub prefix: char,
    /// File extension of shard files, without the dot.
    pub extension: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: DEFAULT_INPUT.into(),
            shard_dir: DEFAULT_SHARD_DIR.into(),
            max_set_size: DEFAULT_MAX_SET_SIZE,
            prefix: DEFAULT_PREFIX,
            extension: DEFAULT_EXTENSION.to_owned(),
        }
    }
}

impl Config {
    /// Loads a JSON config from `path`. A missing file gives the defaults.
    pub fn load<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let config = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(contents.as_str())
                .with_context(|| format!("parsing config {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()))
            }
        };
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_set_size == 0 {
            bail!("max_set_size must be at least 1")
        }
        if self.extension.is_empty() || self.extension.contains(['/', '\\']) {
            bail!("invalid shard extension {:?}", self.extension)
        }
        Ok(())
    }
}
