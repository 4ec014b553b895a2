use std::path::PathBuf;

use addrshard::{
    combine, partition_file, Buckets, CombineReport, Config, OsDir, PartitionOptions,
};
use clap::{Args, Parser, Subcommand};
use tracing::Level;

#[derive(Parser)]
#[command(
    name = "addrshard",
    about = "Splits an address list into deduplicated shards and loads them back",
    version
)]
struct Cli {
    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true, default_value = "addrshard.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Args)]
struct DirArgs {
    /// Directory holding the shards
    #[arg(long)]
    shard_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PartitionArgs {
    /// Input file, one address per line
    #[arg(long)]
    input: Option<PathBuf>,

    /// Accepted lines per shard
    #[arg(long)]
    max_set_size: Option<usize>,

    #[command(flatten)]
    dir: DirArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Split the input into shards
    Partition(PartitionArgs),

    /// Read the shards back into buckets
    Combine(DirArgs),

    /// Partition, then combine
    Run(PartitionArgs),

    /// Report whether addresses are present in the shards
    Check {
        #[command(flatten)]
        dir: DirArgs,

        /// Addresses to look up
        #[arg(required = true)]
        addresses: Vec<String>,
    },
}

impl DirArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.shard_dir {
            config.shard_dir = dir.clone();
        }
    }
}

impl PartitionArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(input) = &self.input {
            config.input = input.clone();
        }
        if let Some(n) = self.max_set_size {
            config.max_set_size = n;
        }
        self.dir.apply(config);
    }
}

impl Commands {
    fn apply(&self, config: &mut Config) {
        match self {
            Commands::Partition(args) | Commands::Run(args) => args.apply(config),
            Commands::Combine(args) | Commands::Check { dir: args, .. } => args.apply(config),
        }
    }
}

/// Loads the config file and lays the command line flags over it.
fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(&cli.config)?;
    cli.command.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn check_line(address: &str, buckets: &Buckets) -> String {
    let address = address.trim();
    let state = if buckets.contains(address) {
        "present"
    } else {
        "absent"
    };
    format!("{} {}", address, state)
}

fn partition(config: &Config) -> anyhow::Result<()> {
    let dir = OsDir::open_dir(&config.shard_dir)?;
    partition_file(dir, PartitionOptions::from(config), &config.input)?;
    Ok(())
}

fn load(config: &Config) -> anyhow::Result<CombineReport> {
    let mut dir = OsDir::open_existing(&config.shard_dir)?;
    let report = combine(&mut dir, &config.extension)?;
    tracing::info!(
        "Database size: {} ({} unique)",
        report.buckets.total_len(),
        report.buckets.unique_len()
    );
    Ok(report)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Partition(_) => partition(&config)?,
        Commands::Combine(_) => {
            load(&config)?;
        }
        Commands::Run(_) => {
            partition(&config)?;
            load(&config)?;
        }
        Commands::Check { addresses, .. } => {
            let report = load(&config)?;
            for address in &addresses {
                println!("{}", check_line(address, &report.buckets));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, fs};

    use addrshard::{
        combine,
        fs::MockDir,
        shard::{writer::ShardWriter, ShardId},
        Config,
    };
    use clap::Parser;

    use super::{check_line, resolve_config, Cli};

    fn config_file(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("addrshard.json");
        fs::write(
            &path,
            r#"{"input": "file.txt", "shard_dir": "file_db", "max_set_size": 10}"#,
        )
        .unwrap();
        path.to_str().unwrap().to_owned()
    }

    fn resolve(args: &[&str]) -> anyhow::Result<Config> {
        resolve_config(&Cli::try_parse_from(args)?)
    }

    #[test]
    fn test_flags_override_config_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = config_file(&tmp);
        let path = path.as_str();

        let config = resolve(&["addrshard", "--config", path, "partition"])?;
        assert_eq!(config.max_set_size, 10);
        assert_eq!(config.input.to_str(), Some("file.txt"));
        assert_eq!(config.shard_dir.to_str(), Some("file_db"));

        let config = resolve(&[
            "addrshard",
            "--config",
            path,
            "partition",
            "--max-set-size",
            "5",
        ])?;
        assert_eq!(config.max_set_size, 5);
        assert_eq!(config.input.to_str(), Some("file.txt"));

        let config = resolve(&[
            "addrshard",
            "run",
            "--input",
            "flag.txt",
            "--shard-dir",
            "flag_db",
            "--config",
            path,
        ])?;
        assert_eq!(config.input.to_str(), Some("flag.txt"));
        assert_eq!(config.shard_dir.to_str(), Some("flag_db"));
        assert_eq!(config.max_set_size, 10);

        let config = resolve(&[
            "addrshard",
            "--config",
            path,
            "check",
            "--shard-dir",
            "x",
            "1a",
        ])?;
        assert_eq!(config.shard_dir.to_str(), Some("x"));

        let config = resolve(&["addrshard", "--config", path, "combine"])?;
        assert_eq!(config.shard_dir.to_str(), Some("file_db"));
        Ok(())
    }

    #[test]
    fn test_invalid_flag_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = config_file(&tmp);
        let path = path.as_str();
        let args = ["addrshard", "--config", path, "partition", "--max-set-size", "0"];
        assert!(resolve(&args).is_err());
        Ok(())
    }

    #[test]
    fn test_check_line() -> anyhow::Result<()> {
        let mut dir = MockDir::new();
        let records: HashSet<String> = ["1a".to_owned(), "1b".to_owned()].into();
        ShardWriter::new(&mut dir, "shard").write(ShardId(0), &records)?;
        let report = combine(&mut dir, "shard")?;

        assert_eq!(check_line("1a", &report.buckets), "1a present");
        assert_eq!(check_line("  1b \n", &report.buckets), "1b present");
        assert_eq!(check_line(" 1q", &report.buckets), "1q absent");
        Ok(())
    }
}
