use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;

use fws_protocol::Result;
use fws_protocol::TranscriptEntry;

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptRange {
    pub entries: Vec<TranscriptEntry>,
    pub total: u64,
}

/// Append one entry as a single JSONL line. The caller holds the
/// conversation's append lock and has already assigned `msg_num`.
pub(crate) async fn append_line(path: &Path, entry: &TranscriptEntry) -> Result<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Count existing entries so sequence numbering survives a restart.
pub(crate) async fn count_entries(path: &Path) -> Result<u64> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut count = 0u64;
    while lines.next_line().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Read entries with `from <= msg_num < to`. Unparseable lines are skipped
/// with a warning rather than failing the whole read.
pub(crate) async fn read_range(path: &Path, from: u64, to: u64) -> Result<TranscriptRange> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TranscriptRange {
                entries: Vec::new(),
                total: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut entries = Vec::new();
    let mut total = 0u64;
    while let Some(line) = lines.next_line().await? {
        total += 1;
        match serde_json::from_str::<TranscriptEntry>(&line) {
            Ok(entry) => {
                if entry.msg_num >= from && entry.msg_num < to {
                    entries.push(entry);
                }
            }
            Err(e) => {
                tracing::warn!("skipping malformed transcript line: {e}");
            }
        }
    }
    Ok(TranscriptRange { entries, total })
}
