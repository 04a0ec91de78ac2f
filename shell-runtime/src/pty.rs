//! PTY backend: a pseudo-terminal with a bidirectional byte stream.

use std::io::ErrorKind;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;

use fws_protocol::FwsErr;
use fws_protocol::Result;

use crate::spec::ShellSpec;
use crate::registry::SpawnedShell;

const WRITER_CHANNEL_CAPACITY: usize = 128;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn spawn(spec: &ShellSpec, rows: u16, cols: u16) -> Result<SpawnedShell> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(FwsErr::Validation("empty argv".to_string()));
    };

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| FwsErr::Io(std::io::Error::other(e.to_string())))?;

    let mut command_builder = CommandBuilder::new(program);
    command_builder.args(args);
    if let Some(cwd) = &spec.cwd {
        command_builder.cwd(cwd);
    }
    for (key, value) in &spec.env {
        command_builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(command_builder)
        .map_err(|e| FwsErr::Io(std::io::Error::other(e.to_string())))?;
    let pid = child.process_id();
    let mut killer = child.clone_killer();

    let (output_tx, initial_rx) = broadcast::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);
    let (kill_tx, mut kill_rx) = mpsc::channel::<bool>(1);

    // Reader: drain the PTY on a blocking thread and forward chunks.
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| FwsErr::Io(std::io::Error::other(e.to_string())))?;
    let output_tx_clone = output_tx.clone();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = output_tx_clone.send(buf[..n].to_vec());
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    // Writer: apply serialized writes on a blocking thread.
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| FwsErr::Io(std::io::Error::other(e.to_string())))?;
    let writer = Arc::new(StdMutex::new(writer));
    tokio::spawn(async move {
        // The pair must stay alive as long as writes are possible.
        let _master = pair.master;
        while let Some(bytes) = writer_rx.recv().await {
            let writer = writer.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = writer.lock() {
                    use std::io::Write;
                    let _ = guard.write_all(&bytes);
                    let _ = guard.flush();
                }
            })
            .await;
        }
    });

    // Kill listener: a terminate request signals the child out-of-band.
    tokio::spawn(async move {
        while let Some(_force) = kill_rx.recv().await {
            let _ = killer.kill();
        }
    });

    // Wait: publish the exit code when the child goes away.
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        let _ = exit_tx.send(Some(code));
    });

    Ok(SpawnedShell {
        writer_tx,
        output_tx,
        initial_rx,
        exit_rx,
        pid,
        kill_tx,
    })
}
