use std::{
    collections::HashSet,
    io::{Cursor, Write},
};

use anyhow::bail;

use crate::fs::{ShardDir, ShardFile};

use super::{reader::decode_shard, ShardId, HEADER_LEN, MAGIC};

struct Writer<W>
where
    W: Write,
{
    w: W,
    prev_val: Vec<u8>,
}

impl<W> Writer<W>
where
    W: Write,
{
    fn new(w: W) -> Self {
        Writer {
            w,
            prev_val: Vec::with_capacity(64),
        }
    }

    fn write(&mut self, record: &str) -> anyhow::Result<()> {
        let buf = record.as_bytes();

        let shared_prefix_len = self
            .prev_val
            .iter()
            .zip(buf)
            .take_while(|(a, b)| a == b)
            .count();

        self.w
            .write_all(&((buf.len() - shared_prefix_len) as u32).to_le_bytes())?;
        self.w
            .write_all(&(shared_prefix_len as u32).to_le_bytes())?;
        self.w.write_all(&buf[shared_prefix_len..])?;

        self.prev_val.clear();
        self.prev_val.extend_from_slice(buf);
        Ok(())
    }
}

/// Encodes a set of records into the shard format. Records are written in
/// sorted order so the output is deterministic for a given set.
pub fn encode_shard(records: &HashSet<String>) -> anyhow::Result<Vec<u8>> {
    if records.len() > u32::MAX as usize {
        bail!("{} records do not fit in one shard", records.len())
    }

    let mut sorted: Vec<&String> = records.iter().collect();
    sorted.sort_unstable();

    let mut body = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut body));
    for record in sorted {
        writer.write(record)?;
    }

    if body.len() > u32::MAX as usize {
        bail!("shard body of {} bytes is too large", body.len())
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub struct ShardWriter<'a, D>
where
    D: ShardDir,
{
    dir: &'a mut D,
    extension: &'a str,
}

impl<'a, D> ShardWriter<'a, D>
where
    D: ShardDir,
{
    pub fn new(dir: &'a mut D, extension: &'a str) -> Self {
        ShardWriter { dir, extension }
    }

    /// Writes `records` as shard `id`, replacing any file of that name.
    ///
    /// The encoded bytes are decoded again before anything touches the
    /// directory; if they do not reproduce `records` exactly the write fails
    /// and nothing is persisted. The shard is written under a temporary name
    /// and renamed into place once synced, so a reader never sees a partial
    /// shard under its final name.
    ///
    /// Returns the number of bytes written.
    pub fn write(&mut self, id: ShardId, records: &HashSet<String>) -> anyhow::Result<usize> {
        let name = id.file_name(self.extension);
        let data = encode_shard(records)?;

        match decode_shard(&data) {
            Ok(decoded) if decoded == *records => {}
            Ok(decoded) => bail!(
                "shard {} failed self-check: encoded {} records, decoded {}",
                name,
                records.len(),
                decoded.len()
            ),
            Err(e) => bail!("shard {} failed self-check: {:#}", name, e),
        }

        let tmp_name = id.tmp_name(self.extension);
        let mut file = self.dir.create(&tmp_name)?;
        file.write(&data)?;
        file.sync()?;
        self.dir.rename(&tmp_name, &name)?;

        tracing::debug!(shard = %name, bytes = data.len(), "shard written");

        Ok(data.len())
    }
}
