//! Managed shell integration.
//!
//! The PTY runs a bash whose rcfile is generated and owned here, so marker
//! emission does not depend on user rc customizations. `PROMPT_COMMAND`
//! emits the prompt sentinel; commands submitted through `exec_block` /
//! `exec_interactive` are wrapped in a function that brackets them with
//! BEGIN/END markers. The leading newline before END and the prompt sentinel
//! guards against commands whose output does not end in a newline.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;

use fws_protocol::MARKER_BLOCK_BEGIN;
use fws_protocol::MARKER_BLOCK_END;
use fws_protocol::MARKER_PROMPT;
use fws_protocol::Result;

pub(crate) const RCFILE_NAME: &str = "fws_bashrc";
const RUN_FUNCTION: &str = "__fws_run";

pub(crate) fn rcfile_contents() -> String {
    // Marker tokens are written literally; a test pins them to the protocol
    // constants.
    r#"# Generated by framework-shells; the managed shell owns this file.
__fws_ts_ms() {
  if [ -n "$EPOCHREALTIME" ]; then
    local t=${EPOCHREALTIME/./}
    printf '%s\n' "${t%???}"
  else
    printf '%s000\n' "$(date +%s)"
  fi
}
__fws_b64() { printf %s "$1" | base64 | tr -d '\n'; }
__fws_prompt() {
  local rc=$?
  printf '\n__FWS_PROMPT__ ts=%s cwd_b64=%s exit=%s\n' "$(__fws_ts_ms)" "$(__fws_b64 "$PWD")" "$rc"
}
__fws_run() {
  local seq="$1" cmd_b64="$2"
  local cmd
  cmd="$(printf %s "$cmd_b64" | base64 -d)"
  printf '__FWS_BLOCK_BEGIN__ seq=%s ts=%s cwd_b64=%s cmd_b64=%s\n' "$seq" "$(__fws_ts_ms)" "$(__fws_b64 "$PWD")" "$cmd_b64"
  eval "$cmd"
  local rc=$?
  printf '\n__FWS_BLOCK_END__ seq=%s ts=%s exit=%s\n' "$seq" "$(__fws_ts_ms)" "$rc"
  return $rc
}
PROMPT_COMMAND=__fws_prompt
PS1='$ '
"#
    .to_string()
}

pub(crate) fn write_rcfile(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(RCFILE_NAME);
    let mut file = std::fs::File::create(&path)?;
    file.write_all(rcfile_contents().as_bytes())?;
    Ok(path)
}

/// Argv for the managed shell. `--noprofile` plus our own rcfile keeps the
/// marker stream deterministic.
pub(crate) fn shell_argv(shell_program: &str, rcfile: &Path) -> Vec<String> {
    vec![
        shell_program.to_string(),
        "--noprofile".to_string(),
        "--rcfile".to_string(),
        rcfile.to_string_lossy().into_owned(),
        "-i".to_string(),
    ]
}

/// The line typed into the PTY to run one command as a block.
pub(crate) fn run_command_line(seq: u64, cmd: &str) -> String {
    format!("{RUN_FUNCTION} {seq} {}\r", BASE64_STANDARD.encode(cmd))
}

/// Heuristic used by `end_session` to decide whether `exit` makes sense.
pub(crate) fn looks_like_shell(cmd: &str) -> bool {
    let first = cmd.split_whitespace().next().unwrap_or("");
    let name = first.rsplit('/').next().unwrap_or(first);
    matches!(name, "sh" | "bash" | "zsh" | "dash" | "fish" | "ksh")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn run_line_encodes_the_command() {
        let line = run_command_line(3, "echo hi");
        assert!(line.starts_with("__fws_run 3 "));
        assert!(line.ends_with('\r'));
        let b64 = line
            .trim_end_matches('\r')
            .rsplit(' ')
            .next()
            .unwrap()
            .to_string();
        assert_eq!(BASE64_STANDARD.decode(b64).unwrap(), b"echo hi");
    }

    #[test]
    fn rcfile_mentions_every_marker() {
        let rc = rcfile_contents();
        assert!(rc.contains(MARKER_BLOCK_BEGIN));
        assert!(rc.contains(MARKER_BLOCK_END));
        assert!(rc.contains(MARKER_PROMPT));
        assert!(rc.contains("PROMPT_COMMAND=__fws_prompt"));
    }

    #[test]
    fn shell_detection_is_name_based() {
        assert!(looks_like_shell("/bin/bash"));
        assert!(looks_like_shell("zsh -l"));
        assert!(!looks_like_shell("./guess"));
        assert!(!looks_like_shell("python3 repl.py"));
    }
}
