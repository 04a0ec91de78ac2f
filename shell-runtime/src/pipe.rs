//! Pipe backend: stdin/stdout/stderr as raw pipes.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;

use fws_protocol::FwsErr;
use fws_protocol::Result;

use crate::registry::SpawnedShell;
use crate::spec::ShellSpec;

const WRITER_CHANNEL_CAPACITY: usize = 128;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUF_BYTES: usize = 8192;

pub(crate) fn spawn(spec: &ShellSpec) -> Result<SpawnedShell> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(FwsErr::Validation("empty argv".to_string()));
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command.spawn()?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FwsErr::Validation("child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FwsErr::Validation("child stderr not captured".to_string()))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| FwsErr::Validation("child stdin not captured".to_string()))?;

    let (output_tx, initial_rx) = broadcast::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);
    let (kill_tx, mut kill_rx) = mpsc::channel::<bool>(1);

    // Reader task: drain stdout and forward chunks to the broadcast. Only
    // stdout carries protocol bytes; stderr goes to the log.
    {
        let output_tx = output_tx.clone();
        let mut stdout = stdout;
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_BYTES];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = output_tx.send(buf[..n].to_vec());
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "child_stderr", "{line}");
        }
    });

    // Writer task: serialize stdin writes.
    tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if stdin.write_all(&bytes).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    // Wait task: publish the exit code; honor kill requests.
    tokio::spawn(async move {
        let code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code()).unwrap_or(-1);
                }
                request = kill_rx.recv() => match request {
                    Some(_force) => {
                        let _ = child.start_kill();
                    }
                    // Kill channel gone; just wait for the child.
                    None => {
                        break child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1);
                    }
                },
            }
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

