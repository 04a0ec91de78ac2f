//! On-disk block store.
//!
//! `events.jsonl` holds BEGIN/DELTA/END lifecycle records, `blocks.jsonl` one
//! metadata line per finalized block, `blocks/<block_id>.out` the raw bytes
//! between BEGIN and END. `blocks.jsonl` is a pure function of `events.jsonl`
//! (see [`replay_blocks`]), which is the recovery path after a crash.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use serde::Serialize;

use fws_protocol::BlockEvent;
use fws_protocol::BlockMeta;
use fws_protocol::FwsErr;
use fws_protocol::Result;

#[derive(Debug, Clone, Serialize)]
pub struct BlockSearchHit {
    pub block_id: String,
    pub line: u64,
    pub text: String,
}

pub(crate) struct BlockStore {
    dir: PathBuf,
    state: StdMutex<Files>,
}

struct Files {
    events: std::fs::File,
    blocks: std::fs::File,
    blocks_len: u64,
    active_out: Option<(String, std::fs::File)>,
}

impl BlockStore {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join("blocks"))?;
        let events = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(dir.join("events.jsonl"))?;
        let blocks_path = dir.join("blocks.jsonl");
        let blocks_len = std::fs::metadata(&blocks_path).map(|m| m.len()).unwrap_or(0);
        let blocks = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&blocks_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state: StdMutex::new(Files {
                events,
                blocks,
                blocks_len,
                active_out: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Files> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn out_path(&self, block_id: &str) -> PathBuf {
        self.dir.join("blocks").join(format!("{block_id}.out"))
    }

    fn append_event(files: &mut Files, event: &BlockEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        files.events.write_all(line.as_bytes())?;
        files.events.flush()?;
        Ok(())
    }

    pub(crate) fn record_begin(&self, event: &BlockEvent) -> Result<()> {
        let mut files = self.lock();
        Self::append_event(&mut files, event)?;
        let out = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.out_path(event.block_id()))?;
        files.active_out = Some((event.block_id().to_string(), out));
        Ok(())
    }

    /// Raw output bytes for the active block; one DELTA record per call.
    pub(crate) fn record_output(&self, block_id: &str, conversation_id: &str, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut files = self.lock();
        match &mut files.active_out {
            Some((active_id, out)) if active_id == block_id => {
                if let Err(e) = out.write_all(bytes).and_then(|_| out.flush()) {
                    tracing::warn!("block output write failed: {e}");
                    return;
                }
            }
            _ => return,
        }
        let delta = BlockEvent::Delta {
            block_id: block_id.to_string(),
            conversation_id: conversation_id.to_string(),
            bytes: bytes.len(),
        };
        if let Err(e) = Self::append_event(&mut files, &delta) {
            tracing::warn!("block delta record failed: {e}");
        }
    }

    /// Record END and append the finalized metadata line derived from the
    /// BEGIN/END pair.
    pub(crate) fn record_end(
        &self,
        begin: &BlockEvent,
        end: &BlockEvent,
    ) -> Result<Option<BlockMeta>> {
        let mut files = self.lock();
        Self::append_event(&mut files, end)?;
        files.active_out = None;
        let Some(meta) = BlockMeta::finalize(begin, end) else {
            return Ok(None);
        };
        let mut line = serde_json::to_string(&meta)?;
        line.push('\n');
        files.blocks.write_all(line.as_bytes())?;
        files.blocks.flush()?;
        files.blocks_len += line.len() as u64;
        Ok(Some(meta))
    }

    pub(crate) fn blocks_cursor(&self) -> u64 {
        self.lock().blocks_len
    }

    /// Finalized blocks recorded at or after the byte cursor into
    /// `blocks.jsonl`, plus the cursor to resume from.
    pub(crate) fn since(&self, cursor: u64) -> Result<(Vec<BlockMeta>, u64)> {
        let data = std::fs::read(self.dir.join("blocks.jsonl"))?;
        let start = (cursor as usize).min(data.len());
        let mut out = Vec::new();
        let mut end = start;
        let mut pos = start;
        for chunk in data[start..].split_inclusive(|&b| b == b'\n') {
            if chunk.last() != Some(&b'\n') {
                break;
            }
            pos += chunk.len();
            match serde_json::from_slice::<BlockMeta>(chunk) {
                Ok(meta) => out.push(meta),
                Err(e) => tracing::warn!("skipping malformed block line: {e}"),
            }
            end = pos;
        }
        Ok((out, end as u64))
    }

    pub(crate) fn get(&self, block_id: &str) -> Result<BlockMeta> {
        let (all, _) = self.since(0)?;
        all.into_iter()
            .find(|m| m.block_id == block_id)
            .ok_or_else(|| FwsErr::NotFound(format!("block {block_id}")))
    }

    /// Normalized lines `[from_line, to_line)` of a block's output.
    pub(crate) fn read_lines(
        &self,
        block_id: &str,
        from_line: u64,
        to_line: u64,
    ) -> Result<Vec<String>> {
        let raw = std::fs::read(self.out_path(block_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FwsErr::NotFound(format!("block {block_id}"))
            } else {
                FwsErr::Io(e)
            }
        })?;
        let text = normalize(&raw);
        Ok(text
            .lines()
            .enumerate()
            .filter(|(i, _)| (*i as u64) >= from_line && (*i as u64) < to_line)
            .map(|(_, l)| l.to_string())
            .collect())
    }

    /// Substring search across block outputs; restricted to one block when
    /// `block_id` is given.
    pub(crate) fn search(
        &self,
        query: &str,
        block_id: Option<&str>,
    ) -> Result<Vec<BlockSearchHit>> {
        let (all, _) = self.since(0)?;
        let mut hits = Vec::new();
        for meta in all {
            if let Some(filter) = block_id
                && meta.block_id != filter
            {
                continue;
            }
            let raw = match std::fs::read(self.out_path(&meta.block_id)) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            for (i, line) in normalize(&raw).lines().enumerate() {
                if line.contains(query) {
                    hits.push(BlockSearchHit {
                        block_id: meta.block_id.clone(),
                        line: i as u64,
                        text: line.to_string(),
                    });
                }
            }
        }
        Ok(hits)
    }

    /// Normalized text of one block's full output (envelope previews).
    pub(crate) fn output_text(&self, block_id: &str) -> String {
        std::fs::read(self.out_path(block_id))
            .map(|raw| normalize(&raw))
            .unwrap_or_default()
    }
}

fn normalize(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.replace('\r', "")
}

/// Rebuild the `blocks.jsonl` content from an `events.jsonl` file. The live
/// write path and this replay use the same derivation, so the result matches
/// the on-disk file bit-for-bit.
pub fn replay_blocks(events_path: &Path) -> Result<String> {
    let data = std::fs::read_to_string(events_path)?;
    let mut begins: HashMap<String, BlockEvent> = HashMap::new();
    let mut out = String::new();
    for line in data.lines() {
        let event: BlockEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("skipping malformed event line: {e}");
                continue;
            }
        };
        match &event {
            BlockEvent::Begin { block_id, .. } => {
                begins.insert(block_id.clone(), event);
            }
            BlockEvent::Delta { .. } => {}
            BlockEvent::End { block_id, .. } => {
                if let Some(begin) = begins.remove(block_id)
                    && let Some(meta) = BlockMeta::finalize(&begin, &event)
                {
                    out.push_str(&serde_json::to_string(&meta)?);
                    out.push('\n');
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn begin(id: &str, ts: i64) -> BlockEvent {
        BlockEvent::Begin {
            block_id: id.into(),
            conversation_id: "c1".into(),
            seq: 1,
            ts,
            cwd: "/tmp".into(),
            cmd: format!("run {id}"),
        }
    }

    fn end(id: &str, ts: i64, exit: i32) -> BlockEvent {
        BlockEvent::End {
            block_id: id.into(),
            conversation_id: "c1".into(),
            seq: 1,
            ts,
            exit_code: Some(exit),
            cancelled: false,
        }
    }

    #[test]
    fn lifecycle_writes_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();

        let b = begin("b1", 10);
        store.record_begin(&b).unwrap();
        store.record_output("b1", "c1", b"out line\r\n");
        let meta = store.record_end(&b, &end("b1", 20, 0)).unwrap().unwrap();

        assert_eq!(meta.block_id, "b1");
        assert_eq!(
            std::fs::read(dir.path().join("blocks/b1.out")).unwrap(),
            b"out line\r\n"
        );

        let (all, cursor) = store.since(0).unwrap();
        assert_eq!(all.len(), 1);
        assert!(cursor > 0);
        let (none, cursor2) = store.since(cursor).unwrap();
        assert!(none.is_empty());
        assert_eq!(cursor, cursor2);

        assert_eq!(store.read_lines("b1", 0, 10).unwrap(), vec!["out line"]);
        let hits = store.search("out", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].block_id, "b1");
    }

    #[test]
    fn replay_reproduces_blocks_jsonl_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();

        for (id, exit) in [("b1", 0), ("b2", 1)] {
            let b = begin(id, 5);
            store.record_begin(&b).unwrap();
            store.record_output(id, "c1", b"x\n");
            store.record_end(&b, &end(id, 9, exit)).unwrap();
        }

        let replayed = replay_blocks(&dir.path().join("events.jsonl")).unwrap();
        let on_disk = std::fs::read_to_string(dir.path().join("blocks.jsonl")).unwrap();
        assert_eq!(replayed, on_disk);
    }

    #[test]
    fn events_file_orders_begin_before_end_per_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let b = begin("b1", 1);
        store.record_begin(&b).unwrap();
        store.record_end(&b, &end("b1", 2, 0)).unwrap();

        let events = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let kinds: Vec<BlockEvent> = events
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(matches!(kinds[0], BlockEvent::Begin { .. }));
        assert!(matches!(kinds.last().unwrap(), BlockEvent::End { .. }));
    }
}
