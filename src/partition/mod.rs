use std::{collections::HashSet, fs, path::Path};

use anyhow::Context;

use crate::{
    config::Config,
    fs::ShardDir,
    shard::{is_shard_artifact, writer::ShardWriter, ShardId},
};

/// The working set of a partitioner run: the records accepted since the last
/// flush, and how many lines were accepted (duplicates included).
#[derive(Debug, Default)]
pub struct Accumulator {
    set: HashSet<String>,
    inserted: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: &str) {
        if !self.set.contains(record) {
            self.set.insert(record.to_owned());
        }
        self.inserted += 1;
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn records(&self) -> &HashSet<String> {
        &self.set
    }

    pub fn reset(&mut self) {
        self.set.clear();
        self.inserted = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenShard {
    pub id: ShardId,
    pub name: String,
    pub records: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub lines_seen: usize,
    pub lines_accepted: usize,
    pub shards: Vec<WrittenShard>,
}

impl PartitionSummary {
    pub fn records_written(&self) -> usize {
        self.shards.iter().map(|s| s.records).sum()
    }

    pub fn bytes_written(&self) -> usize {
        self.shards.iter().map(|s| s.bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOptions {
    pub max_set_size: usize,
    pub prefix: char,
    pub extension: String,
}

impl From<&Config> for PartitionOptions {
    fn from(config: &Config) -> Self {
        PartitionOptions {
            max_set_size: config.max_set_size,
            prefix: config.prefix,
            extension: config.extension.clone(),
        }
    }
}

impl Default for PartitionOptions {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

/// Splits a stream of lines into shards of at most `max_set_size` accepted
/// lines each.
pub struct Partitioner<D>
where
    D: ShardDir,
{
    dir: D,
    opts: PartitionOptions,
    acc: Accumulator,
    next_shard: ShardId,
    summary: PartitionSummary,
}

impl<D> Partitioner<D>
where
    D: ShardDir,
{
    /// Prepares `dir` for a fresh run. Shards and temporary files left by an
    /// earlier run are removed, so the shards in the directory afterwards are
    /// exactly the ones this run writes.
    pub fn new(mut dir: D, opts: PartitionOptions) -> anyhow::Result<Self> {
        anyhow::ensure!(opts.max_set_size > 0, "max_set_size must be at least 1");

        let mut stale: Vec<String> = dir
            .ls()?
            .into_iter()
            .filter(|name| is_shard_artifact(name, &opts.extension))
            .collect();
        stale.sort();
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "removing shards from a previous run");
        }
        for name in stale {
            dir.unlink(&name)?;
        }

        Ok(Partitioner {
            dir,
            opts,
            acc: Accumulator::new(),
            next_shard: ShardId(0),
            summary: PartitionSummary::default(),
        })
    }

    pub fn push(&mut self, line: &str) -> anyhow::Result<()> {
        self.summary.lines_seen += 1;
        if !line.starts_with(self.opts.prefix) {
            return Ok(());
        }

        self.acc.insert(line.trim());
        self.summary.lines_accepted += 1;

        if self.acc.inserted() >= self.opts.max_set_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the remaining records as the final shard, which is written even
    /// when empty.
    pub fn finish(mut self) -> anyhow::Result<PartitionSummary> {
        self.flush()?;
        tracing::info!(
            lines = self.summary.lines_seen,
            accepted = self.summary.lines_accepted,
            shards = self.summary.shards.len(),
            records = self.summary.records_written(),
            bytes = self.summary.bytes_written(),
            "partitioning complete"
        );
        Ok(self.summary)
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        let id = self.next_shard;
        let bytes = ShardWriter::new(&mut self.dir, &self.opts.extension)
            .write(id, self.acc.records())?;

        let shard = WrittenShard {
            id,
            name: id.file_name(&self.opts.extension),
            records: self.acc.records().len(),
            bytes,
        };
        tracing::info!(
            shard = %shard.name,
            records = shard.records,
            bytes = shard.bytes,
            accepted = self.acc.inserted(),
            "flushed shard"
        );
        self.summary.shards.push(shard);

        self.acc.reset();
        self.next_shard = id.next();
        Ok(())
    }
}

pub fn partition_lines<D, I, S>(
    dir: D,
    opts: PartitionOptions,
    lines: I,
) -> anyhow::Result<PartitionSummary>
where
    D: ShardDir,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut partitioner = Partitioner::new(dir, opts)?;
    for line in lines {
        partitioner.push(line.as_ref())?;
    }
    partitioner.finish()
}

/// Partitions the file at `input`. The whole file is read into memory before
/// any shard is written.
pub fn partition_file<D, P>(
    dir: D,
    opts: PartitionOptions,
    input: P,
) -> anyhow::Result<PartitionSummary>
where
    D: ShardDir,
    P: AsRef<Path>,
{
    let input = input.as_ref();
    let contents =
        fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    tracing::info!(input = %input.display(), bytes = contents.len(), "loaded input");
    partition_lines(dir, opts, contents.lines())
}

#[cfg(test)]
mod test {
    use std::{
        collections::{BTreeMap, HashSet},
        fmt::Write,
    };

    use rand::Rng;

    use crate::{
        fs::{MockDir, ShardDir},
        shard::{list_shards, reader::decode_shard, ShardId},
    };

    use super::{partition_lines, PartitionOptions, Partitioner};

    fn opts(max_set_size: usize) -> PartitionOptions {
        PartitionOptions {
            max_set_size,
            ..PartitionOptions::default()
        }
    }

    fn read_shard(dir: &MockDir, name: &str) -> HashSet<String> {
        let data = (*dir.fs).borrow().contents(name).unwrap();
        decode_shard(&data).unwrap()
    }

    fn sorted(set: HashSet<String>) -> Vec<String> {
        let mut v: Vec<_> = set.into_iter().collect();
        v.sort();
        v
    }

    #[test]
    fn test_dedup_and_filter() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let summary = partition_lines(
            dir.clone(),
            opts(1_000_000),
            ["1abc\n", "1abc\n", "2xyz\n", "1def\n"],
        )?;

        assert_eq!(summary.shards.len(), 1);
        assert_eq!(summary.lines_seen, 4);
        assert_eq!(summary.lines_accepted, 3);
        assert_eq!(sorted(read_shard(&dir, "00.shard")), ["1abc", "1def"]);
        Ok(())
    }

    #[test]
    fn test_threshold_split() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let summary = partition_lines(dir.clone(), opts(2), ["1a\n", "1b\n", "1c\n"])?;

        let names: Vec<_> = summary.shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["00.shard", "01.shard"]);
        assert_eq!(sorted(read_shard(&dir, "00.shard")), ["1a", "1b"]);
        assert_eq!(sorted(read_shard(&dir, "01.shard")), ["1c"]);

        let fs = (*dir.fs).borrow();
        for shard in &summary.shards {
            assert_eq!(Some(shard.bytes), fs.contents(&shard.name).map(|c| c.len()));
        }
        // "1b" shares one byte with "1a", so its entry is a byte shorter.
        assert_eq!(summary.shards[0].bytes, 12 + 10 + 9);
        assert_eq!(summary.bytes_written(), 12 + 10 + 9 + 12 + 10);
        Ok(())
    }

    #[test]
    fn test_duplicates_count_towards_threshold() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let summary = partition_lines(dir.clone(), opts(2), ["1a", "1a", "1b"])?;

        assert_eq!(summary.shards.len(), 2);
        assert_eq!(summary.shards[0].records, 1);
        assert_eq!(sorted(read_shard(&dir, "01.shard")), ["1b"]);
        Ok(())
    }

    #[test]
    fn test_empty_final_shard() -> anyhow::Result<()> {
        let dir = MockDir::new();
        let summary = partition_lines(dir.clone(), opts(2), ["1a", "1b"])?;

        assert_eq!(summary.shards.len(), 2);
        assert!(read_shard(&dir, "01.shard").is_empty());

        let summary = partition_lines(MockDir::new(), opts(2), Vec::<String>::new())?;
        assert_eq!(summary.shards.len(), 1);
        assert_eq!(summary.shards[0].records, 0);
        Ok(())
    }

    #[test]
    fn test_rerun_removes_stale_shards() -> anyhow::Result<()> {
        let mut dir = MockDir::new();
        dir.plant("notes.txt", b"keep me");
        partition_lines(dir.clone(), opts(1), ["1a", "1b", "1c"])?;
        assert_eq!(list_shards(&mut dir, "shard")?.len(), 4);

        partition_lines(dir.clone(), opts(1), ["1z"])?;
        let shards = list_shards(&mut dir, "shard")?;
        assert_eq!(
            shards.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            [ShardId(0), ShardId(1)]
        );
        assert_eq!(sorted(read_shard(&dir, "00.shard")), ["1z"]);
        assert!(dir.ls()?.contains(&"notes.txt".to_owned()));
        Ok(())
    }

    #[test]
    fn test_filesystem_failure_is_fatal() {
        let dir = MockDir::new();
        let mut partitioner = Partitioner::new(dir.clone(), opts(2)).unwrap();
        (*dir.fs).borrow_mut().schedule_crash(2);

        partitioner.push("1a").unwrap();
        // The flush needs create, write, sync and rename; the third fails.
        assert!(partitioner.push("1b").is_err());
    }

    #[test]
    fn random_partitions() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let max_set_size = rng.gen_range(1..20);
            let mut lines = Vec::new();
            for _ in 0..rng.gen_range(0..200) {
                let prefix = if rng.gen_range(0..4) == 0 { '3' } else { '1' };
                let pad = if rng.gen_range(0..3) == 0 { " \r\n" } else { "\n" };
                lines.push(format!("{}addr{}{}", prefix, rng.gen_range(0..50), pad));
            }

            let mut expected = HashSet::new();
            for line in &lines {
                if line.starts_with('1') {
                    expected.insert(line.trim().to_owned());
                }
            }

            let dir = MockDir::new();
            let summary = partition_lines(dir.clone(), opts(max_set_size), &lines)?;

            let mut union = HashSet::new();
            let mut per_shard = BTreeMap::new();
            for (i, shard) in summary.shards.iter().enumerate() {
                assert_eq!(shard.id, ShardId(i as u32));
                let records = read_shard(&dir, &shard.name);
                assert!(records.len() <= max_set_size);
                per_shard.insert(shard.id, records.len());
                union.extend(records);
            }

            assert_eq!(union, expected);
            let accepted = lines.iter().filter(|l| l.starts_with('1')).count();
            assert_eq!(summary.shards.len(), accepted / max_set_size + 1);
            assert_eq!(per_shard.len(), summary.shards.len());
        }
        Ok(())
    }

    #[test]
    fn test_partition_trace() {
        datadriven::walk("src/partition/testdata/", |f| {
            let dir = MockDir::new();
            let mut summary = None;
            f.run(|test_case| match test_case.directive.as_str() {
                "partition" => {
                    let max_set_size = test_case.args["threshold"][0].parse().unwrap();
                    let lines: Vec<&str> = test_case.input.lines().collect();
                    summary = Some(
                        partition_lines(dir.clone(), opts(max_set_size), lines).unwrap(),
                    );
                    "ok\n".into()
                }
                "summary" => {
                    let summary = summary.as_ref().unwrap();
                    let mut out = String::new();
                    writeln!(
                        &mut out,
                        "seen={} accepted={}",
                        summary.lines_seen, summary.lines_accepted
                    )
                    .unwrap();
                    for shard in &summary.shards {
                        writeln!(&mut out, "{}: {} records", shard.name, shard.records).unwrap();
                    }
                    out
                }
                "read" => {
                    let mut out = String::new();
                    for record in sorted(read_shard(&dir, test_case.input.trim())) {
                        writeln!(&mut out, "{}", record).unwrap();
                    }
                    out
                }
                "trace" => {
                    let mut result = String::new();
                    for event in (*dir.fs).borrow_mut().take_events() {
                        event.write_abbrev(&mut result).unwrap();
                        result.push('\n');
                    }
                    if test_case.args.contains_key("squelch") {
                        "ok\n".into()
                    } else {
                        result
                    }
                }
                _ => {
                    panic!("unhandled");
                }
            })
        })
    }
}
