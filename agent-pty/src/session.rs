//! The per-conversation PTY session: mode machine, marker-driven block
//! lifecycle, dual output path and the public operation surface.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use fws_protocol::BlockEvent;
use fws_protocol::BlockMeta;
use fws_protocol::CommandPreview;
use fws_protocol::CommandSummary;
use fws_protocol::Event;
use fws_protocol::EventMsg;
use fws_protocol::FwsErr;
use fws_protocol::MARKER_BLOCK_BEGIN;
use fws_protocol::MARKER_BLOCK_END;
use fws_protocol::MARKER_PROMPT;
use fws_protocol::Marker;
use fws_protocol::Result;
use fws_shell_runtime::ShellId;
use fws_shell_runtime::ShellRuntime;
use fws_shell_runtime::ShellSpec;

use crate::block_store::BlockSearchHit;
use crate::block_store::BlockStore;
use crate::hook;
use crate::screen::SCREEN_COLS;
use crate::screen::SCREEN_ROWS;
use crate::screen::ScreenModel;
use crate::screen::ScreenSnapshot;
use crate::spool::Spool;
use crate::wait;
use crate::wait::MatchSpec;
use crate::wait::WaitResult;

const CTRL_C: &[u8] = b"\x03";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtyMode {
    Idle,
    BlockRunning,
    Interactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecReceipt {
    pub block_id: String,
    pub resume_cursor: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PtyStatus {
    pub mode: PtyMode,
    pub spool_size: u64,
    pub raw_size: u64,
    pub blocks_cursor: u64,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_id: Option<String>,
}

pub struct PtyConfig {
    pub conversation_id: String,
    pub dir: PathBuf,
    pub shell_program: String,
    pub events: Option<broadcast::Sender<Event>>,
    pub summaries: Option<mpsc::UnboundedSender<CommandSummary>>,
}

impl PtyConfig {
    pub fn new(conversation_id: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            dir,
            shell_program: "/bin/bash".to_string(),
            events: None,
            summaries: None,
        }
    }
}

struct ActiveBlock {
    block_id: String,
    seq: u64,
    cmd: String,
    interactive: bool,
    begin: Option<BlockEvent>,
}

struct Scanner {
    line: Vec<u8>,
    flushed: usize,
}

struct RawLog {
    file: std::fs::File,
    len: u64,
    path: PathBuf,
}

pub(crate) struct PtyInner {
    conversation_id: String,
    dir: PathBuf,
    runtime: ShellRuntime,
    shell_program: String,
    /// Serializes exec/expect_send/end_session/reset so mode transitions and
    /// match-then-send pairs cannot interleave.
    op_lock: Mutex<()>,
    mode: StdMutex<PtyMode>,
    seq: AtomicU64,
    shell: StdMutex<Option<ShellId>>,
    spool: Spool,
    raw: StdMutex<RawLog>,
    screen: StdMutex<ScreenModel>,
    blocks: BlockStore,
    scanner: StdMutex<Scanner>,
    active: StdMutex<Option<ActiveBlock>>,
    events: Option<broadcast::Sender<Event>>,
    summaries: Option<mpsc::UnboundedSender<CommandSummary>>,
}

/// Handle to one conversation's PTY subsystem. Cheap to clone; all state
/// lives behind the shared inner.
#[derive(Clone)]
pub struct AgentPty {
    inner: Arc<PtyInner>,
}

impl AgentPty {
    pub fn open(runtime: ShellRuntime, config: PtyConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let spool = Spool::open(&config.dir.join("output.spool"))?;
        let raw_path = config.dir.join("output.raw");
        let raw_len = std::fs::metadata(&raw_path).map(|m| m.len()).unwrap_or(0);
        let raw_file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&raw_path)?;
        let blocks = BlockStore::open(&config.dir)?;
        let screen = ScreenModel::open(&config.dir)?;

        // Continue block numbering across restarts.
        let (existing, _) = blocks.since(0)?;
        let max_seq = existing
            .iter()
            .filter_map(|m| m.block_id.strip_prefix('b'))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        Ok(Self {
            inner: Arc::new(PtyInner {
                conversation_id: config.conversation_id,
                dir: config.dir,
                runtime,
                shell_program: config.shell_program,
                op_lock: Mutex::new(()),
                mode: StdMutex::new(PtyMode::Idle),
                seq: AtomicU64::new(max_seq),
                shell: StdMutex::new(None),
                spool,
                raw: StdMutex::new(RawLog {
                    file: raw_file,
                    len: raw_len,
                    path: raw_path,
                }),
                screen: StdMutex::new(screen),
                blocks,
                scanner: StdMutex::new(Scanner {
                    line: Vec::new(),
                    flushed: 0,
                }),
                active: StdMutex::new(None),
                events: config.events,
                summaries: config.summaries,
            }),
        })
    }

    /// Run one command as a bounded block. Fails `busy` while another block
    /// runs and `mode_interactive` during an interactive session; neither
    /// failure touches the spool.
    pub async fn exec_block(&self, cmd: &str) -> Result<ExecReceipt> {
        let _guard = self.inner.op_lock.lock().await;
        PtyInner::ensure_started(&self.inner)?;
        let receipt = self.inner.register_block(cmd, false)?;
        if let Err(e) = self.write_run_line().await {
            self.inner.abort_registration();
            return Err(e);
        }
        Ok(receipt)
    }

    /// Enter interactive mode running `cmd`. The block stays open until the
    /// program exits or `end_session`.
    pub async fn exec_interactive(&self, cmd: &str) -> Result<ExecReceipt> {
        let _guard = self.inner.op_lock.lock().await;
        PtyInner::ensure_started(&self.inner)?;
        let receipt = self.inner.register_block(cmd, true)?;
        if let Err(e) = self.write_run_line().await {
            self.inner.abort_registration();
            return Err(e);
        }
        Ok(receipt)
    }

    async fn write_run_line(&self) -> Result<()> {
        let shell = self.inner.shell_id().ok_or(FwsErr::ShellGone)?;
        let (seq, cmd) = {
            let active = self.inner.lock_active();
            match active.as_ref() {
                Some(a) => (a.seq, a.cmd.clone()),
                None => return Err(FwsErr::Validation("no registered block".to_string())),
            }
        };
        self.inner
            .runtime
            .write(shell, hook::run_command_line(seq, &cmd).into_bytes())
            .await
    }

    /// Raw bytes to the PTY (keystrokes, control sequences).
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let shell = self.inner.shell_id().ok_or(FwsErr::ShellGone)?;
        self.inner.runtime.write(shell, bytes).await
    }

    pub async fn wait_for(
        &self,
        spec: &MatchSpec,
        from_cursor: u64,
        timeout_ms: u64,
        max_bytes: Option<u64>,
    ) -> Result<WaitResult> {
        wait::wait_for(&self.inner.spool, spec, from_cursor, timeout_ms, max_bytes).await
    }

    /// Atomic expect-then-send: no other writer can slip between the match
    /// and the send.
    pub async fn expect_send(
        &self,
        expect: &MatchSpec,
        send: Vec<u8>,
        from_cursor: u64,
        timeout_ms: u64,
    ) -> Result<WaitResult> {
        let _guard = self.inner.op_lock.lock().await;
        let result =
            wait::wait_for(&self.inner.spool, expect, from_cursor, timeout_ms, None).await?;
        if result.matched {
            let shell = self.inner.shell_id().ok_or(FwsErr::ShellGone)?;
            self.inner.runtime.write(shell, send).await?;
        }
        Ok(result)
    }

    pub fn read_spool(&self, cursor: u64, max_bytes: usize) -> (Vec<u8>, u64) {
        self.inner.spool.read(cursor, max_bytes)
    }

    /// Lossless bytes from `output.raw`.
    pub fn read_raw(&self, offset: u64, max_bytes: usize) -> Result<(Vec<u8>, u64)> {
        let raw = self.inner.lock_raw();
        let data = std::fs::read(&raw.path)?;
        let start = (offset as usize).min(data.len());
        let end = (start + max_bytes).min(data.len());
        Ok((data[start..end].to_vec(), end as u64))
    }

    pub fn status(&self) -> PtyStatus {
        let shell = self.inner.shell_id();
        let alive = shell
            .and_then(|id| self.inner.runtime.status(id).ok())
            .map(|s| s.alive)
            .unwrap_or(false);
        PtyStatus {
            mode: self.inner.mode(),
            spool_size: self.inner.spool.len(),
            raw_size: self.inner.lock_raw().len,
            blocks_cursor: self.inner.blocks.blocks_cursor(),
            alive,
            shell_id: shell.map(|id| id.to_string()),
        }
    }

    /// Interrupt the foreground program (Ctrl+C); no-op when idle.
    pub async fn interrupt(&self) -> Result<()> {
        if self.inner.mode() == PtyMode::Idle {
            return Ok(());
        }
        let Some(shell) = self.inner.shell_id() else {
            return Ok(());
        };
        self.inner.runtime.write(shell, CTRL_C.to_vec()).await
    }

    /// Graceful end of an interactive session: Ctrl+C, `exit` if the program
    /// is a shell, then finalize the open block.
    pub async fn end_session(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        if self.inner.mode() == PtyMode::Idle {
            return Ok(());
        }
        if let Some(shell) = self.inner.shell_id() {
            let _ = self.inner.runtime.write(shell, CTRL_C.to_vec()).await;
            let is_shell = {
                let active = self.inner.lock_active();
                active
                    .as_ref()
                    .map(|a| a.interactive && hook::looks_like_shell(&a.cmd))
                    .unwrap_or(false)
            };
            if is_shell {
                let _ = self.inner.runtime.write(shell, b"exit\r".to_vec()).await;
            }
        }
        self.inner.finalize_open_block(None, true);
        self.inner.set_mode(PtyMode::Idle);
        self.inner.flush_screen();
        Ok(())
    }

    /// Kill and forget the PTY process. Spool, blocks and screen logs stay
    /// on disk; the next exec spawns a fresh shell.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        let shell = self.inner.take_shell();
        if let Some(id) = shell {
            let _ = self.inner.runtime.terminate(id, true).await;
        }
        self.inner.finalize_open_block(None, true);
        self.inner.set_mode(PtyMode::Idle);
        self.inner.flush_screen();
        Ok(())
    }

    /// Raw output stream for the `/ws/pty` passthrough. Each subscriber sees
    /// bytes from subscription forward.
    pub fn subscribe_output(&self) -> Result<tokio::sync::broadcast::Receiver<Vec<u8>>> {
        let shell = self.inner.shell_id().ok_or(FwsErr::ShellGone)?;
        self.inner.runtime.subscribe(shell)
    }

    /// Spawn the managed shell if it is not already running.
    pub fn ensure_started(&self) -> Result<()> {
        PtyInner::ensure_started(&self.inner)
    }

    // -- screen and block queries ---------------------------------------

    pub fn read_screen(&self) -> ScreenSnapshot {
        self.inner.lock_screen().snapshot()
    }

    pub fn read_screen_deltas(&self, cursor: u64) -> Result<(Vec<serde_json::Value>, u64)> {
        self.inner.lock_screen().read_deltas(cursor)
    }

    pub fn blocks_since(&self, cursor: u64) -> Result<(Vec<BlockMeta>, u64)> {
        self.inner.blocks.since(cursor)
    }

    pub fn block_get(&self, block_id: &str) -> Result<BlockMeta> {
        self.inner.blocks.get(block_id)
    }

    pub fn block_read(&self, block_id: &str, from_line: u64, to_line: u64) -> Result<Vec<String>> {
        self.inner.blocks.read_lines(block_id, from_line, to_line)
    }

    pub fn block_search(&self, query: &str, block_id: Option<&str>) -> Result<Vec<BlockSearchHit>> {
        self.inner.blocks.search(query, block_id)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &PtyInner {
        &self.inner
    }
}

impl PtyInner {
    fn mode(&self) -> PtyMode {
        *lock(&self.mode)
    }

    fn set_mode(&self, mode: PtyMode) {
        *lock(&self.mode) = mode;
    }

    fn shell_id(&self) -> Option<ShellId> {
        *lock(&self.shell)
    }

    fn take_shell(&self) -> Option<ShellId> {
        lock(&self.shell).take()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveBlock>> {
        lock(&self.active)
    }

    fn lock_raw(&self) -> std::sync::MutexGuard<'_, RawLog> {
        lock(&self.raw)
    }

    fn lock_screen(&self) -> std::sync::MutexGuard<'_, ScreenModel> {
        lock(&self.screen)
    }

    fn emit(&self, msg: EventMsg) {
        if let Some(tx) = &self.events {
            let _ = tx.send(Event {
                conversation_id: self.conversation_id.clone(),
                msg,
            });
        }
    }

    /// Spawn the managed shell if none is running.
    fn ensure_started(this: &Arc<Self>) -> Result<()> {
        {
            let shell = lock(&this.shell);
            if let Some(id) = *shell
                && this.runtime.status(id).map(|s| s.alive).unwrap_or(false)
            {
                return Ok(());
            }
        }

        let rcfile = hook::write_rcfile(&this.dir)?;
        let mut spec = ShellSpec::command(hook::shell_argv(&this.shell_program, &rcfile));
        spec.env
            .insert("TERM".to_string(), "xterm-256color".to_string());
        spec.labels = vec!["agent-pty".to_string()];
        let ctx = HashMap::from([(
            "CONVERSATION_ID".to_string(),
            this.conversation_id.clone(),
        )]);

        let id = this.runtime.spawn_pty(&spec, &ctx, SCREEN_ROWS, SCREEN_COLS)?;
        *lock(&this.shell) = Some(id);
        std::fs::write(this.dir.join("shell_id.txt"), id.to_string())?;

        let rx = this.runtime.subscribe(id)?;
        let inner = this.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                match rx.recv().await {
                    Ok(chunk) => inner.ingest_chunk(&chunk),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("pty ingest lagged by {n} chunks");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inner.finalize_open_block(None, true);
            inner.set_mode(PtyMode::Idle);
            inner.spool.mark_eof();
            inner.flush_screen();
        });
        Ok(())
    }

    /// Mode check + block allocation. Split from `exec_*` so marker handling
    /// can be exercised without a live shell.
    pub(crate) fn register_block(&self, cmd: &str, interactive: bool) -> Result<ExecReceipt> {
        {
            let mode = lock(&self.mode);
            match *mode {
                PtyMode::Idle => {}
                PtyMode::BlockRunning => return Err(FwsErr::Busy),
                PtyMode::Interactive => {
                    if interactive {
                        return Err(FwsErr::Busy);
                    }
                    return Err(FwsErr::ModeInteractive);
                }
            }
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let block_id = format!("b{seq}");
        *self.lock_active() = Some(ActiveBlock {
            block_id: block_id.clone(),
            seq,
            cmd: cmd.to_string(),
            interactive,
            begin: None,
        });
        self.set_mode(if interactive {
            PtyMode::Interactive
        } else {
            PtyMode::BlockRunning
        });
        Ok(ExecReceipt {
            block_id,
            resume_cursor: self.spool.len(),
        })
    }

    fn abort_registration(&self) {
        *self.lock_active() = None;
        self.set_mode(PtyMode::Idle);
    }

    // -- ingest ----------------------------------------------------------

    /// Consume one chunk of raw PTY bytes: lossless raw log, screen model,
    /// marker scanning and normalized spool.
    pub(crate) fn ingest_chunk(&self, chunk: &[u8]) {
        {
            let mut raw = self.lock_raw();
            if let Err(e) = raw.file.write_all(chunk).and_then(|_| raw.file.flush()) {
                tracing::warn!("raw log write failed: {e}");
            }
            raw.len += chunk.len() as u64;
        }

        // Screen model first; it uses its own lock so spool waiters are not
        // coupled to snapshot I/O.
        let delta = self.lock_screen().feed(chunk);
        if let Some(msg) = delta {
            self.emit(msg);
        }

        let mut rest = chunk;
        loop {
            let newline = rest.iter().position(|&b| b == b'\n');
            let mut scanner = lock(&self.scanner);
            match newline {
                Some(pos) => {
                    scanner.line.extend_from_slice(&rest[..pos]);
                    let line = std::mem::take(&mut scanner.line);
                    let flushed = std::mem::replace(&mut scanner.flushed, 0);
                    drop(scanner);
                    self.handle_complete_line(&line, flushed);
                    rest = &rest[pos + 1..];
                }
                None => {
                    scanner.line.extend_from_slice(rest);
                    if !scanner.line.is_empty()
                        && !marker_candidate(&scanner.line)
                        && scanner.flushed < scanner.line.len()
                    {
                        let fresh = scanner.line[scanner.flushed..].to_vec();
                        scanner.flushed = scanner.line.len();
                        drop(scanner);
                        self.flush_content(&fresh);
                    }
                    break;
                }
            }
        }
    }

    fn handle_complete_line(&self, line: &[u8], already_flushed: usize) {
        if marker_candidate(line) {
            let text = String::from_utf8_lossy(line);
            if let Some(marker) = Marker::parse(&text) {
                self.handle_marker(marker);
                return;
            }
        }
        let mut tail = line[already_flushed.min(line.len())..].to_vec();
        tail.push(b'\n');
        self.flush_content(&tail);

        // Completed line for the screen scrollback ring.
        if self.in_block() {
            let normalized: String = String::from_utf8_lossy(line).replace('\r', "");
            self.lock_screen().push_scrollback(normalized);
        }
    }

    fn in_block(&self) -> bool {
        self.lock_active()
            .as_ref()
            .map(|a| a.begin.is_some())
            .unwrap_or(false)
    }

    /// Forward content to the spool (normalized) and the block output (raw),
    /// gated on being inside a block. Prompt noise and command echo between
    /// blocks never reach either.
    fn flush_content(&self, raw: &[u8]) {
        let block = {
            let active = self.lock_active();
            match active.as_ref() {
                Some(a) if a.begin.is_some() => Some(a.block_id.clone()),
                _ => None,
            }
        };
        let Some(block_id) = block else {
            return;
        };

        let normalized: Vec<u8> = raw.iter().copied().filter(|&b| b != b'\r').collect();
        self.spool.append(&normalized);
        self.blocks
            .record_output(&block_id, &self.conversation_id, raw);
    }

    fn handle_marker(&self, marker: Marker) {
        match marker {
            Marker::BlockBegin { seq, ts, cwd, cmd } => self.on_block_begin(seq, ts, cwd, cmd),
            Marker::BlockEnd { seq, ts, exit } => self.on_block_end(seq, ts, exit),
            Marker::Prompt { ts, exit, .. } => self.on_prompt(ts, exit),
        }
    }

    fn on_block_begin(&self, seq: u64, ts: i64, cwd: String, cmd: String) {
        let make_event = |block_id: &str| BlockEvent::Begin {
            block_id: block_id.to_string(),
            conversation_id: self.conversation_id.clone(),
            seq,
            ts,
            cwd: cwd.clone(),
            cmd: cmd.clone(),
        };
        let begin = {
            let mut active = self.lock_active();
            let registered = active
                .as_ref()
                .map(|a| (a.seq == seq, a.begin.is_some()));
            match registered {
                Some((true, false)) => {
                    if let Some(a) = active.as_mut() {
                        let event = make_event(&a.block_id);
                        a.begin = Some(event.clone());
                        Some(event)
                    } else {
                        None
                    }
                }
                Some(_) => None,
                None => {
                    // A block begun outside the exec APIs (user-typed). Track
                    // it so END accounting stays consistent.
                    let block_id = format!("b{seq}");
                    let event = make_event(&block_id);
                    *active = Some(ActiveBlock {
                        block_id,
                        seq,
                        cmd: cmd.clone(),
                        interactive: false,
                        begin: Some(event.clone()),
                    });
                    self.seq.fetch_max(seq, Ordering::SeqCst);
                    Some(event)
                }
            }
        };

        let Some(event) = begin else {
            tracing::warn!("ignoring BEGIN marker with unexpected seq {seq}");
            return;
        };
        if let Err(e) = self.blocks.record_begin(&event) {
            tracing::warn!("failed to record block begin: {e}");
        }
        if *lock(&self.mode) == PtyMode::Idle {
            self.set_mode(PtyMode::BlockRunning);
        }
        if let BlockEvent::Begin { block_id, cmd, cwd, .. } = event {
            self.emit(EventMsg::BlockBegin { block_id, cmd, cwd });
        }
    }

    fn on_block_end(&self, seq: u64, ts: i64, exit: Option<i32>) {
        let pair = {
            let mut active = self.lock_active();
            take_if(&mut active, |a| a.seq == seq && a.begin.is_some())
        };
        let Some(block) = pair else {
            tracing::warn!("ignoring END marker with no open block (seq {seq})");
            return;
        };
        self.finalize_block(block, seq, ts, exit, false);
        self.set_mode(PtyMode::Idle);
    }

    fn on_prompt(&self, ts: i64, exit: Option<i32>) {
        // Finalize a block the shell abandoned without an END marker.
        let dangling = {
            let mut active = self.lock_active();
            take_if(&mut active, |a| a.begin.is_some())
        };
        if let Some(block) = dangling {
            let seq = block.seq;
            self.finalize_block(block, seq, ts, exit, false);
        }

        // Idle first, then record: a PROMPT match implies mode is idle.
        self.set_mode(PtyMode::Idle);
        self.spool.record_prompt();
        self.flush_screen();
    }

    fn finalize_block(
        &self,
        block: ActiveBlock,
        seq: u64,
        ts: i64,
        exit: Option<i32>,
        cancelled: bool,
    ) {
        let Some(begin) = &block.begin else {
            return;
        };
        let end = BlockEvent::End {
            block_id: block.block_id.clone(),
            conversation_id: self.conversation_id.clone(),
            seq,
            ts,
            exit_code: exit,
            cancelled,
        };
        let meta = match self.blocks.record_end(begin, &end) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("failed to record block end: {e}");
                None
            }
        };
        self.emit(EventMsg::BlockEnd {
            block_id: block.block_id.clone(),
            exit_code: exit,
        });

        if let Some(meta) = meta
            && let Some(summaries) = &self.summaries
        {
            let output = self.blocks.output_text(&meta.block_id);
            let summary = CommandSummary {
                cmd: meta.cmd.clone(),
                exit_code: meta.exit_code,
                cwd: meta.cwd.clone(),
                block_id: meta.block_id.clone(),
                ts,
                preview: CommandPreview::from_output(&output),
            };
            let _ = summaries.send(summary);
        }
    }

    /// Used by end_session/reset when the shell cannot deliver an END.
    fn finalize_open_block(&self, exit: Option<i32>, cancelled: bool) {
        let open = {
            let mut active = self.lock_active();
            let begun = take_if(&mut active, |a| a.begin.is_some());
            *active = None;
            begun
        };
        if let Some(block) = open {
            let seq = block.seq;
            self.finalize_block(block, seq, Utc::now().timestamp_millis(), exit, cancelled);
        }
    }

    fn flush_screen(&self) {
        let event = self.lock_screen().force_flush();
        if let Some(msg) = event {
            self.emit(msg);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take_if<F>(active: &mut Option<ActiveBlock>, pred: F) -> Option<ActiveBlock>
where
    F: Fn(&ActiveBlock) -> bool,
{
    if active.as_ref().map(&pred).unwrap_or(false) {
        active.take()
    } else {
        None
    }
}

fn marker_candidate(line: &[u8]) -> bool {
    [MARKER_BLOCK_BEGIN, MARKER_BLOCK_END, MARKER_PROMPT]
        .iter()
        .any(|token| {
            let token = token.as_bytes();
            if line.len() < token.len() {
                token.starts_with(line)
            } else {
                line.starts_with(token)
            }
        })
}
