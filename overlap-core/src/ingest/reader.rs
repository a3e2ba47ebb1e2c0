//! Offset-tracked journal reader.
//!
//! Reads the bytes appended to an append-only JSONL journal since a given
//! offset and splits them into complete records. A trailing partial line (no
//! terminating `\n`) is not yielded and its bytes do not count toward
//! advancement, so a record the agent is mid-write on is picked up whole on
//! the next read. Re-reading from a prior offset yields the same sequence.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

/// Result of one incremental read.
#[derive(Debug, Default)]
pub struct ReadBatch {
    /// Complete records (without the trailing newline), in file order.
    pub records: Vec<String>,
    /// Offset just past the last complete record.
    pub new_offset: u64,
    /// The file shrank below the requested offset; records were re-read
    /// from the beginning and the caller must reset its state for the path.
    pub truncated: bool,
}

/// Incremental reader over one journal file.
pub struct JournalReader {
    path: PathBuf,
}

impl JournalReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read complete records starting at `offset`.
    ///
    /// A file that has disappeared is a no-op (empty batch at the same
    /// offset); the directory watcher owns reacting to removals. A file
    /// smaller than `offset` is a truncation: the batch restarts from zero
    /// with `truncated` set.
    pub async fn read_from(&self, offset: u64) -> Result<ReadBatch> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReadBatch {
                    records: Vec::new(),
                    new_offset: offset,
                    truncated: false,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let file_len = file.metadata().await?.len();

        let (start, truncated) = if file_len < offset {
            (0, true)
        } else {
            (offset, false)
        };

        if file_len == start {
            return Ok(ReadBatch {
                records: Vec::new(),
                new_offset: start,
                truncated,
            });
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((file_len - start) as usize);
        file.read_to_end(&mut buf).await?;

        Ok(split_complete_records(&buf, start, truncated))
    }
}

/// Split a byte run into complete newline-terminated records, advancing the
/// offset by the exact byte length consumed (record bytes plus separator).
fn split_complete_records(bytes: &[u8], start: u64, truncated: bool) -> ReadBatch {
    let Some(last_newline) = bytes.iter().rposition(|&b| b == b'\n') else {
        // The whole chunk is one incomplete line; do not advance.
        return ReadBatch {
            records: Vec::new(),
            new_offset: start,
            truncated,
        };
    };

    let complete = &bytes[..=last_newline];
    let records = complete
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect();

    ReadBatch {
        records,
        new_offset: start + complete.len() as u64,
        truncated,
    }
}
