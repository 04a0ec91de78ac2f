//! Virtual screen model.
//!
//! Raw PTY bytes feed a vt100 emulator maintaining a fixed 120x40 grid,
//! cursor, title and alt-screen flag. Row-level deltas are throttled to at
//! most 10 per second; `screen.snapshot.json` is rewritten at most every
//! 250 ms, with forced flushes on the prompt sentinel and at session end.
//! Alt-screen is taken from the emulator's alt-buffer mode flag, never
//! inferred from content.
//!
//! Scrollback is a bounded ring of completed normalized lines (the vt100
//! crate's own scrollback is unreliable at this version; the ring is fed by
//! the same line stream as the spool).

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Duration;
use tokio::time::Instant;

use fws_protocol::EventMsg;
use fws_protocol::Result;
use fws_protocol::ScreenCursor;
use fws_protocol::ScreenRowUpdate;

pub(crate) const SCREEN_ROWS: u16 = 40;
pub(crate) const SCREEN_COLS: u16 = 120;
const SCROLLBACK_LINES: usize = 1000;
const DELTA_MIN_INTERVAL: Duration = Duration::from_millis(100);
const SNAPSHOT_MIN_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    pub rows: Vec<String>,
    pub cursor: ScreenCursor,
    pub title: String,
    pub alt_screen: bool,
    pub scrollback: Vec<String>,
    pub ts: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScreenDeltaRecord {
    seq: u64,
    ts: i64,
    rows: Vec<ScreenRowUpdate>,
    cursor: ScreenCursor,
    alt_screen: bool,
}

pub(crate) struct ScreenModel {
    parser: vt100::Parser,
    last_rows: Vec<String>,
    scrollback: VecDeque<String>,
    pending_rows: BTreeSet<u16>,
    seq: u64,
    last_delta_at: Option<Instant>,
    last_snapshot_at: Option<Instant>,
    jsonl: std::fs::File,
    jsonl_path: PathBuf,
    snapshot_path: PathBuf,
}

impl ScreenModel {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        let jsonl_path = dir.join("screen.jsonl");
        let jsonl = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&jsonl_path)?;
        Ok(Self {
            parser: vt100::Parser::new(SCREEN_ROWS, SCREEN_COLS, 0),
            last_rows: vec![String::new(); SCREEN_ROWS as usize],
            scrollback: VecDeque::new(),
            pending_rows: BTreeSet::new(),
            seq: 0,
            last_delta_at: None,
            last_snapshot_at: None,
            jsonl,
            jsonl_path,
            snapshot_path: dir.join("screen.snapshot.json"),
        })
    }

    /// Feed raw bytes. Returns a `screen_delta` event when one is due.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Option<EventMsg> {
        self.parser.process(bytes);
        let rows: Vec<String> = self
            .parser
            .screen()
            .rows(0, SCREEN_COLS)
            .collect();
        for (i, row) in rows.iter().enumerate() {
            if self.last_rows.get(i) != Some(row) {
                self.pending_rows.insert(i as u16);
            }
        }
        self.last_rows = rows;
        self.maybe_emit(false)
    }

    /// A completed normalized line for the scrollback ring.
    pub(crate) fn push_scrollback(&mut self, line: String) {
        self.scrollback.push_back(line);
        while self.scrollback.len() > SCROLLBACK_LINES {
            self.scrollback.pop_front();
        }
    }

    /// Force-flush pending deltas and the snapshot (prompt sentinel, session
    /// end).
    pub(crate) fn force_flush(&mut self) -> Option<EventMsg> {
        self.maybe_emit(true)
    }

    fn maybe_emit(&mut self, force: bool) -> Option<EventMsg> {
        if self.pending_rows.is_empty() {
            self.write_snapshot(force);
            return None;
        }
        let now = Instant::now();
        if !force
            && let Some(last) = self.last_delta_at
            && now - last < DELTA_MIN_INTERVAL
        {
            return None;
        }
        self.last_delta_at = Some(now);

        let screen = self.parser.screen();
        let (cursor_row, cursor_col) = screen.cursor_position();
        let cursor = ScreenCursor {
            row: cursor_row,
            col: cursor_col,
        };
        let alt_screen = screen.alternate_screen();
        let rows: Vec<ScreenRowUpdate> = self
            .pending_rows
            .iter()
            .filter_map(|&row| {
                self.last_rows.get(row as usize).map(|text| ScreenRowUpdate {
                    row,
                    text: text.clone(),
                })
            })
            .collect();
        self.pending_rows.clear();

        let record = ScreenDeltaRecord {
            seq: self.seq,
            ts: Utc::now().timestamp_millis(),
            rows: rows.clone(),
            cursor,
            alt_screen,
        };
        self.seq += 1;
        if let Ok(mut line) = serde_json::to_string(&record) {
            line.push('\n');
            if let Err(e) = self.jsonl.write_all(line.as_bytes()) {
                tracing::warn!("screen.jsonl write failed: {e}");
            }
        }

        self.write_snapshot(force);
        Some(EventMsg::ScreenDelta {
            seq: record.seq,
            rows,
            cursor,
            alt_screen,
        })
    }

    fn write_snapshot(&mut self, force: bool) {
        let now = Instant::now();
        if !force
            && let Some(last) = self.last_snapshot_at
            && now - last < SNAPSHOT_MIN_INTERVAL
        {
            return;
        }
        self.last_snapshot_at = Some(now);
        let snapshot = self.snapshot();
        if let Ok(json) = serde_json::to_vec_pretty(&snapshot) {
            let tmp = self.snapshot_path.with_extension("json.tmp");
            if std::fs::write(&tmp, &json)
                .and_then(|_| std::fs::rename(&tmp, &self.snapshot_path))
                .is_err()
            {
                tracing::warn!("screen snapshot write failed");
            }
        }
    }

    pub(crate) fn snapshot(&self) -> ScreenSnapshot {
        let screen = self.parser.screen();
        let (row, col) = screen.cursor_position();
        ScreenSnapshot {
            rows: self.last_rows.clone(),
            cursor: ScreenCursor { row, col },
            title: screen.title().to_string(),
            alt_screen: screen.alternate_screen(),
            scrollback: self.scrollback.iter().cloned().collect(),
            ts: Utc::now(),
        }
    }

    /// Read delta records from `screen.jsonl` starting at a byte cursor;
    /// same cursor semantics as `blocks.since`.
    pub(crate) fn read_deltas(&self, cursor: u64) -> Result<(Vec<serde_json::Value>, u64)> {
        let data = std::fs::read(&self.jsonl_path)?;
        let start = (cursor as usize).min(data.len());
        let mut end = start;
        let mut records = Vec::new();
        let mut pos = start;
        for chunk in data[start..].split_inclusive(|&b| b == b'\n') {
            if chunk.last() != Some(&b'\n') {
                break;
            }
            pos += chunk.len();
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(chunk) {
                records.push(value);
            }
            end = pos;
        }
        Ok((records, end as u64))
    }
}
