//! The normalized spool: an append-only, LF-only byte stream whose length is
//! monotonic non-decreasing. Cursors handed to clients are byte offsets into
//! this stream and nothing else.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;

use fws_protocol::Result;

pub(crate) struct Spool {
    state: StdMutex<SpoolState>,
    /// Bumped on every append, prompt observation and eof; waiters re-scan on
    /// each change.
    version_tx: watch::Sender<u64>,
}

struct SpoolState {
    buf: Vec<u8>,
    file: std::fs::File,
    prompt_offsets: Vec<u64>,
    eof_at: Option<u64>,
    version: u64,
}

impl Spool {
    /// Open (or re-open after a restart) the spool file. Existing contents
    /// are mirrored into memory so cursors from before the restart stay
    /// valid.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let buf = match std::fs::read(path) {
            Ok(existing) => existing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        let (version_tx, _) = watch::channel(0);
        Ok(Self {
            state: StdMutex::new(SpoolState {
                buf,
                file,
                prompt_offsets: Vec::new(),
                eof_at: None,
                version: 0,
            }),
            version_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bump(&self, state: &mut SpoolState) {
        state.version += 1;
        let _ = self.version_tx.send(state.version);
    }

    /// Append normalized bytes (caller has already stripped CR and markers).
    pub(crate) fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.lock();
        if let Err(e) = state.file.write_all(bytes).and_then(|_| state.file.flush()) {
            tracing::warn!("spool write failed: {e}");
        }
        state.buf.extend_from_slice(bytes);
        self.bump(&mut state);
    }

    /// Record a prompt sentinel at the current end of the spool.
    pub(crate) fn record_prompt(&self) -> u64 {
        let mut state = self.lock();
        let offset = state.buf.len() as u64;
        state.prompt_offsets.push(offset);
        self.bump(&mut state);
        offset
    }

    pub(crate) fn mark_eof(&self) {
        let mut state = self.lock();
        let offset = state.buf.len() as u64;
        state.eof_at = Some(offset);
        self.bump(&mut state);
    }

    pub(crate) fn len(&self) -> u64 {
        self.lock().buf.len() as u64
    }

    pub(crate) fn read(&self, from: u64, max_bytes: usize) -> (Vec<u8>, u64) {
        let state = self.lock();
        let len = state.buf.len() as u64;
        let start = from.min(len) as usize;
        let end = (start + max_bytes).min(state.buf.len());
        (state.buf[start..end].to_vec(), end as u64)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// One scan pass over `[from, window_end)`. Returns
    /// `(start, end, matched_text)` in spool byte offsets.
    pub(crate) fn scan(
        &self,
        spec: &crate::wait::CompiledMatch,
        from: u64,
        max_bytes: Option<u64>,
    ) -> Option<(u64, u64, String)> {
        let state = self.lock();
        match spec {
            crate::wait::CompiledMatch::Prompt => state
                .prompt_offsets
                .iter()
                .find(|&&p| p >= from)
                .map(|&p| (p, p, fws_protocol::MARKER_PROMPT.to_string())),
            crate::wait::CompiledMatch::Eof => state
                .eof_at
                .filter(|&e| e >= from)
                .map(|e| (e, e, "EOF".to_string())),
            crate::wait::CompiledMatch::Literal(needle) => {
                let (start, window) = window(&state.buf, from, max_bytes);
                find_sub(window, needle.as_bytes()).map(|i| {
                    let end = consume_newline(&state.buf, start + (i + needle.len()) as u64);
                    (start + i as u64, end, needle.clone())
                })
            }
            crate::wait::CompiledMatch::Regex(re) => {
                let (start, window) = window(&state.buf, from, max_bytes);
                let text = String::from_utf8_lossy(window);
                re.find(&text).map(|m| {
                    let end = consume_newline(&state.buf, start + m.end() as u64);
                    (start + m.start() as u64, end, m.as_str().to_string())
                })
            }
        }
    }
}

fn window(buf: &[u8], from: u64, max_bytes: Option<u64>) -> (u64, &[u8]) {
    let start = (from as usize).min(buf.len());
    let end = match max_bytes {
        Some(max) => (start + max as usize).min(buf.len()),
        None => buf.len(),
    };
    (start as u64, &buf[start..end])
}

/// A match ending at a line boundary consumes the newline, so the resumed
/// cursor lands on the next line rather than the dangling terminator.
fn consume_newline(buf: &[u8], end: u64) -> u64 {
    if buf.get(end as usize) == Some(&b'\n') {
        end + 1
    } else {
        end
    }
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::CompiledMatch;
    use pretty_assertions::assert_eq;

    fn spool() -> (tempfile::TempDir, Spool) {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(&dir.path().join("output.spool")).unwrap();
        (dir, spool)
    }

    #[test]
    fn append_persists_and_grows_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.spool");
        {
            let spool = Spool::open(&path).unwrap();
            spool.append(b"hello\n");
            assert_eq!(spool.len(), 6);
        }
        // Reopen mirrors what is on disk.
        let spool = Spool::open(&path).unwrap();
        assert_eq!(spool.len(), 6);
        spool.append(b"world\n");
        assert_eq!(spool.len(), 12);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello\nworld\n");
    }

    #[test]
    fn literal_scan_returns_byte_spans() {
        let (_dir, spool) = spool();
        spool.append(b"hello\nworld\n");
        // A match at a line boundary consumes the newline.
        let hit = spool
            .scan(&CompiledMatch::Literal("hello".into()), 0, None)
            .unwrap();
        assert_eq!(hit, (0, 6, "hello".to_string()));
        let hit = spool
            .scan(&CompiledMatch::Literal("world".into()), 6, None)
            .unwrap();
        assert_eq!(hit, (6, 12, "world".to_string()));
        // A mid-line match does not.
        let hit = spool
            .scan(&CompiledMatch::Literal("wor".into()), 0, None)
            .unwrap();
        assert_eq!(hit, (6, 9, "wor".to_string()));
        assert!(
            spool
                .scan(&CompiledMatch::Literal("hello".into()), 6, None)
                .is_none()
        );
    }

    #[test]
    fn prompt_scan_honors_from_cursor() {
        let (_dir, spool) = spool();
        spool.record_prompt();
        spool.append(b"output\n");
        let later = spool.record_prompt();
        assert_eq!(later, 7);

        let hit = spool.scan(&CompiledMatch::Prompt, 1, None).unwrap();
        assert_eq!(hit.0, 7);
        let first = spool.scan(&CompiledMatch::Prompt, 0, None).unwrap();
        assert_eq!(first.0, 0);
    }

    #[test]
    fn max_bytes_bounds_the_window() {
        let (_dir, spool) = spool();
        spool.append(b"aaaabbbb");
        assert!(
            spool
                .scan(&CompiledMatch::Literal("bbbb".into()), 0, Some(6))
                .is_none()
        );
        assert!(
            spool
                .scan(&CompiledMatch::Literal("bbbb".into()), 0, Some(8))
                .is_some()
        );
    }
}
