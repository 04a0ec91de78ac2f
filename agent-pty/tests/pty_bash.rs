//! End-to-end checks against a real bash in a PTY. Skipped gracefully where
//! the sandbox forbids `openpty`.

use fws_agent_pty::AgentPty;
use fws_agent_pty::MatchSpec;
use fws_agent_pty::PtyConfig;
use fws_agent_pty::PtyMode;
use fws_protocol::BlockStatus;
use fws_shell_runtime::ShellRuntime;

fn restricted(e: &fws_protocol::FwsErr) -> bool {
    let text = e.to_string();
    text.contains("openpty") || text.contains("Operation not permitted")
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn block_mode_cursor_advance_against_real_bash() {
    let dir = tempfile::tempdir().unwrap();
    let config = PtyConfig::new("c1", dir.path().join("agent_pty"));
    let pty = AgentPty::open(ShellRuntime::new(), config).unwrap();

    let receipt = match pty.exec_block("printf 'hello\\nworld\\n'").await {
        Ok(receipt) => receipt,
        Err(e) if restricted(&e) => {
            eprintln!("skipping test due to restricted PTY: {e}");
            return;
        }
        Err(e) => panic!("exec_block failed unexpectedly: {e}"),
    };
    assert_eq!(receipt.block_id, "b1");

    let hello = pty
        .wait_for(&MatchSpec::Literal("hello".into()), receipt.resume_cursor, 10_000, None)
        .await
        .unwrap();
    assert!(hello.matched, "expected hello in spool");

    let world = pty
        .wait_for(&MatchSpec::Literal("world".into()), hello.resume_cursor, 10_000, None)
        .await
        .unwrap();
    assert!(world.matched);
    assert!(world.resume_cursor >= hello.resume_cursor);

    let prompt = pty
        .wait_for(&MatchSpec::Prompt, world.resume_cursor, 10_000, None)
        .await
        .unwrap();
    assert!(prompt.matched);
    assert_eq!(pty.status().mode, PtyMode::Idle);

    let (blocks, _) = pty.blocks_since(0).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].status, BlockStatus::Completed);
    assert_eq!(blocks[0].cmd, "printf 'hello\\nworld\\n'");
    assert_eq!(blocks[0].exit_code, Some(0));

    // The spool never contains marker lines.
    let (spool, _) = pty.read_spool(0, 1 << 16);
    assert!(!String::from_utf8_lossy(&spool).contains("__FWS_"));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exec_while_busy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = PtyConfig::new("c1", dir.path().join("agent_pty"));
    let pty = AgentPty::open(ShellRuntime::new(), config).unwrap();

    match pty.exec_block("sleep 2").await {
        Ok(_) => {}
        Err(e) if restricted(&e) => {
            eprintln!("skipping test due to restricted PTY: {e}");
            return;
        }
        Err(e) => panic!("exec_block failed unexpectedly: {e}"),
    }

    let err = pty.exec_block("echo hi").await.unwrap_err();
    assert!(matches!(err, fws_protocol::FwsErr::Busy));

    pty.reset().await.unwrap();
    assert_eq!(pty.status().mode, PtyMode::Idle);
}
