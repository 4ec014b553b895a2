use std::{
    collections::HashSet,
    io::{Cursor, Read},
};

use anyhow::{bail, Context};

use crate::fs::ShardFile;

use super::{HEADER_LEN, MAGIC};

struct Reader<R: Read> {
    r: R,
    data_len: u64,
    idx: u64,
    buf: Vec<u8>,
}

impl<R> Reader<R>
where
    R: Read,
{
    fn new(r: R, data_len: u32) -> Self {
        Reader {
            r,
            data_len: data_len.into(),
            idx: 0,
            buf: Vec::with_capacity(64),
        }
    }

    fn next(&mut self) -> anyhow::Result<Option<String>> {
        if self.idx >= self.data_len {
            return Ok(None);
        }
        if self.data_len - self.idx < 8 {
            bail!("truncated entry header at body offset {}", self.idx)
        }
        let mut buf = [0_u8; 4];
        self.r.read_exact(&mut buf)?;
        let len = u32::from_le_bytes(buf);
        self.r.read_exact(&mut buf)?;
        let prefix = u32::from_le_bytes(buf);

        if prefix as usize > self.buf.len() {
            bail!(
                "entry at body offset {} shares {} bytes with a {} byte key",
                self.idx,
                prefix,
                self.buf.len()
            )
        }
        if u64::from(len) > self.data_len - self.idx - 8 {
            bail!("entry at body offset {} runs past the body", self.idx)
        }

        self.buf.truncate(prefix as usize);
        self.buf.resize(prefix as usize + len as usize, 0);
        self.r.read_exact(&mut self.buf[(prefix as usize)..])?;
        let v = std::str::from_utf8(&self.buf)
            .with_context(|| format!("entry at body offset {} is not UTF-8", self.idx))?
            .to_owned();

        self.idx += 8 + u64::from(len);

        Ok(Some(v))
    }
}

/// Decodes a complete shard. Anything other than exactly one well-formed
/// shard, including trailing bytes, is an error.
pub fn decode_shard(data: &[u8]) -> anyhow::Result<HashSet<String>> {
    if data.len() < HEADER_LEN {
        bail!("shard is {} bytes, shorter than its header", data.len())
    }
    if data[..4] != MAGIC {
        bail!("bad magic {:?}", &data[..4])
    }
    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let body_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

    let body = &data[HEADER_LEN..];
    if body.len() != body_len as usize {
        bail!(
            "header declares a {} byte body but {} bytes follow",
            body_len,
            body.len()
        )
    }

    let mut reader = Reader::new(Cursor::new(body), body_len);
    // Every entry takes at least 8 bytes, which bounds a corrupt count.
    let mut records = HashSet::with_capacity(std::cmp::min(count, body_len / 8) as usize);
    while let Some(record) = reader.next()? {
        if records.contains(&record) {
            bail!("duplicate record {:?}", record)
        }
        records.insert(record);
    }

    if records.len() != count as usize {
        bail!(
            "header declares {} records but the body holds {}",
            count,
            records.len()
        )
    }

    Ok(records)
}

/// Reads the raw bytes of a shard file. I/O failures here are filesystem
/// errors, kept apart from decode failures so callers can treat them
/// differently.
pub fn read_shard_bytes<F: ShardFile>(file: &mut F) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(file.len());
    file.read_to_end(&mut data).context("reading shard")?;
    Ok(data)
}
