//! Reading worker logs by byte offset.

use std::io::{self, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A slice of a job log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Offset the chunk starts at.
    pub offset: u64,
    /// Offset to pass to the next read.
    pub next_offset: u64,
    /// Log text; invalid UTF-8 is replaced.
    pub data: String,
    /// Whether the chunk reaches the current end of the file.
    pub eof: bool,
}

/// Read up to `max_bytes` from `path` starting at `offset`.
///
/// A missing log reads as empty. An offset past the end is clamped.
pub async fn read_log_chunk(path: &Path, offset: u64, max_bytes: usize) -> io::Result<LogChunk> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(LogChunk {
                offset,
                next_offset: offset,
                data: String::new(),
                eof: true,
            });
        }
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let start = offset.min(len);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity(max_bytes.min((len - start) as usize));
    file.take(max_bytes as u64).read_to_end(&mut buf).await?;

    let next_offset = start + buf.len() as u64;
    Ok(LogChunk {
        offset: start,
        next_offset,
        data: String::from_utf8_lossy(&buf).into_owned(),
        eof: next_offset >= len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        tokio::fs::write(&path, b"epoch 1\nepoch 2\n").await.unwrap();

        let first = read_log_chunk(&path, 0, 8).await.unwrap();
        assert_eq!(first.data, "epoch 1\n");
        assert_eq!(first.next_offset, 8);
        assert!(!first.eof);

        let rest = read_log_chunk(&path, first.next_offset, 1024).await.unwrap();
        assert_eq!(rest.data, "epoch 2\n");
        assert!(rest.eof);

        let past = read_log_chunk(&path, 999, 10).await.unwrap();
        assert_eq!((past.offset, past.data.as_str()), (16, ""));
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = read_log_chunk(&dir.path().join("none.log"), 0, 10).await.unwrap();
        assert!(chunk.data.is_empty());
        assert!(chunk.eof);
    }
}
