use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;

use fws_protocol::FwsErr;
use fws_protocol::Result;

use crate::pipe;
use crate::pty;
use crate::spec::ShellSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShellId(u64);

impl fmt::Display for ShellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell-{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellStatus {
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Everything a backend hands back after a successful spawn.
pub(crate) struct SpawnedShell {
    pub writer_tx: mpsc::Sender<Vec<u8>>,
    pub output_tx: broadcast::Sender<Vec<u8>>,
    /// Subscribed before the reader task starts, so the first subscriber
    /// sees every byte from process start.
    pub initial_rx: broadcast::Receiver<Vec<u8>>,
    pub exit_rx: watch::Receiver<Option<i32>>,
    pub pid: Option<u32>,
    pub kill_tx: mpsc::Sender<bool>,
}

struct ShellHandle {
    writer_tx: mpsc::Sender<Vec<u8>>,
    /// Dropped when the process exits so subscribers observe eof.
    output_tx: Option<broadcast::Sender<Vec<u8>>>,
    /// Handed to the first `subscribe` call.
    initial_rx: Option<broadcast::Receiver<Vec<u8>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    kill_tx: mpsc::Sender<bool>,
}

impl ShellHandle {
    fn alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }
}

/// Registry of child processes, uniform over backends. Single instance per
/// service; conversations hold `ShellId`s, never process handles.
#[derive(Clone)]
pub struct ShellRuntime {
    inner: Arc<Inner>,
}

struct Inner {
    next_id: AtomicU64,
    shells: StdMutex<HashMap<ShellId, ShellHandle>>,
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                shells: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn spawn_pipe(
        &self,
        spec: &ShellSpec,
        ctx: &HashMap<String, String>,
    ) -> Result<ShellId> {
        let resolved = spec.interpolate(ctx);
        let spawned = pipe::spawn(&resolved)?;
        Ok(self.register(spawned))
    }

    pub fn spawn_pty(
        &self,
        spec: &ShellSpec,
        ctx: &HashMap<String, String>,
        rows: u16,
        cols: u16,
    ) -> Result<ShellId> {
        let resolved = spec.interpolate(ctx);
        let spawned = pty::spawn(&resolved, rows, cols)?;
        Ok(self.register(spawned))
    }

    fn register(&self, spawned: SpawnedShell) -> ShellId {
        let id = ShellId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = ShellHandle {
            writer_tx: spawned.writer_tx,
            output_tx: Some(spawned.output_tx),
            initial_rx: Some(spawned.initial_rx),
            exit_rx: spawned.exit_rx.clone(),
            pid: spawned.pid,
            started_at: Utc::now(),
            kill_tx: spawned.kill_tx,
        };
        self.lock().insert(id, handle);

        // Reaper: once the process exits, drop the broadcast sender so late
        // subscribers see a closed channel instead of silence.
        let inner = self.inner.clone();
        let mut exit_rx = spawned.exit_rx;
        tokio::spawn(async move {
            while exit_rx.borrow().is_none() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
            if let Ok(mut shells) = inner.shells.lock()
                && let Some(handle) = shells.get_mut(&id)
            {
                handle.output_tx = None;
            }
        });

        id
    }

    /// Every consumer sees every byte from subscription forward — except the
    /// first, which gets the spawn-time receiver and so misses nothing. A
    /// closed receiver is the terminal eof signal.
    pub fn subscribe(&self, id: ShellId) -> Result<broadcast::Receiver<Vec<u8>>> {
        let mut shells = self.lock();
        let handle = shells
            .get_mut(&id)
            .ok_or_else(|| FwsErr::NotFound(format!("shell {id}")))?;
        if let Some(initial) = handle.initial_rx.take() {
            return Ok(initial);
        }
        match &handle.output_tx {
            Some(tx) => Ok(tx.subscribe()),
            None => {
                // Already exited: hand out a receiver that reads as closed.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                Ok(rx)
            }
        }
    }

    pub async fn write(&self, id: ShellId, bytes: Vec<u8>) -> Result<()> {
        let writer_tx = {
            let shells = self.lock();
            let handle = shells
                .get(&id)
                .ok_or_else(|| FwsErr::NotFound(format!("shell {id}")))?;
            if !handle.alive() {
                return Err(FwsErr::ShellGone);
            }
            handle.writer_tx.clone()
        };
        writer_tx.send(bytes).await.map_err(|_| FwsErr::ShellGone)
    }

    /// Idempotent: terminating a dead or unknown shell is a no-op.
    pub async fn terminate(&self, id: ShellId, force: bool) -> Result<()> {
        let kill_tx = {
            let shells = self.lock();
            match shells.get(&id) {
                Some(handle) if handle.alive() => handle.kill_tx.clone(),
                _ => return Ok(()),
            }
        };
        let _ = kill_tx.send(force).await;
        Ok(())
    }

    pub fn status(&self, id: ShellId) -> Result<ShellStatus> {
        let shells = self.lock();
        let handle = shells
            .get(&id)
            .ok_or_else(|| FwsErr::NotFound(format!("shell {id}")))?;
        Ok(ShellStatus {
            alive: handle.alive(),
            pid: handle.pid,
            started_at: handle.started_at,
        })
    }

    /// Watch the exit code; `None` until the process exits.
    pub fn exit_watch(&self, id: ShellId) -> Result<watch::Receiver<Option<i32>>> {
        let shells = self.lock();
        let handle = shells
            .get(&id)
            .ok_or_else(|| FwsErr::NotFound(format!("shell {id}")))?;
        Ok(handle.exit_rx.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ShellId, ShellHandle>> {
        match self.inner.shells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipe_shell_streams_and_reports_exit() {
        let runtime = ShellRuntime::new();
        let spec = ShellSpec::command(["/bin/sh", "-c", "printf hello"]);
        let id = runtime.spawn_pipe(&spec, &HashMap::new()).unwrap();
        let mut rx = runtime.subscribe(id).unwrap();

        let mut collected = Vec::new();
        loop {
            match rx.recv().await {
                Ok(chunk) => collected.extend_from_slice(&chunk),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        assert_eq!(collected, b"hello");

        let mut exit = runtime.exit_watch(id).unwrap();
        while exit.borrow().is_none() {
            exit.changed().await.unwrap();
        }
        assert_eq!(*exit.borrow(), Some(0));
        assert!(!runtime.status(id).unwrap().alive);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_to_dead_shell_fails_with_shell_gone() {
        let runtime = ShellRuntime::new();
        let spec = ShellSpec::command(["/bin/sh", "-c", "exit 0"]);
        let id = runtime.spawn_pipe(&spec, &HashMap::new()).unwrap();

        let mut exit = runtime.exit_watch(id).unwrap();
        while exit.borrow().is_none() {
            exit.changed().await.unwrap();
        }

        let err = runtime.write(id, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, FwsErr::ShellGone));

        // Terminate stays idempotent on a dead shell.
        runtime.terminate(id, true).await.unwrap();
    }
}
