//! Per-conversation SSOT meta.
//!
//! `conversation_meta.json` is the sole authority for model, cwd, policies
//! and thread binding. Writes are atomic (temp + rename) and `thread_id` is
//! write-once after first bind; both invariants are enforced by the store.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub settings: ConversationSettings,
    pub created_at: DateTime<Utc>,
    pub status: ConversationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_cmd_buffer: Option<PendingCmdBuffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_view: Option<String>,
}

impl ConversationMeta {
    pub fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            thread_id: None,
            label: None,
            settings: ConversationSettings::default(),
            created_at: Utc::now(),
            status: ConversationStatus::Draft,
            pending_cmd_buffer: None,
            active_view: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Created on UI request, no upstream thread yet.
    Draft,
    /// Bound to an upstream thread id or a loaded rollout.
    Active,
}

/// Settings use camelCase on the wire to match the child agent's params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<bool>,
}

/// Completed user-PTY block summaries awaiting injection into the next user
/// turn. Capped at [`PendingCmdBuffer::MAX_COMMANDS`], oldest dropped first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingCmdBuffer {
    pub total_commands_run: u64,
    pub dropped: u64,
    pub commands: Vec<CommandSummary>,
}

impl PendingCmdBuffer {
    pub const MAX_COMMANDS: usize = 10;

    pub fn push(&mut self, summary: CommandSummary) {
        self.total_commands_run += 1;
        self.commands.push(summary);
        while self.commands.len() > Self::MAX_COMMANDS {
            self.commands.remove(0);
            self.dropped += 1;
        }
    }

    pub fn kept(&self) -> u64 {
        self.commands.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cwd: String,
    pub block_id: String,
    /// Milliseconds since the Unix epoch, matching the marker timestamps.
    pub ts: i64,
    pub preview: CommandPreview,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPreview {
    pub lines: Vec<String>,
    pub bytes: usize,
    pub truncated: bool,
}

impl CommandPreview {
    pub const MAX_LINES: usize = 20;
    pub const MAX_BYTES: usize = 3000;

    /// Build a bounded preview from the tail of a block's output.
    pub fn from_output(output: &str) -> Self {
        let bytes = output.len();
        let all: Vec<&str> = output.lines().collect();
        let start = all.len().saturating_sub(Self::MAX_LINES);
        let mut lines: Vec<String> = all[start..].iter().map(|s| s.to_string()).collect();
        let mut kept_bytes: usize = lines.iter().map(|l| l.len() + 1).sum();
        let mut truncated = start > 0;
        while kept_bytes > Self::MAX_BYTES && !lines.is_empty() {
            let removed = lines.remove(0);
            kept_bytes -= removed.len() + 1;
            truncated = true;
        }
        Self {
            lines,
            bytes,
            truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn buffer_caps_at_ten_and_counts_drops() {
        let mut buffer = PendingCmdBuffer::default();
        for i in 0..13 {
            buffer.push(CommandSummary {
                cmd: format!("echo {i}"),
                exit_code: Some(0),
                cwd: "/tmp".into(),
                block_id: format!("b{i}"),
                ts: i,
                preview: CommandPreview::default(),
            });
        }
        assert_eq!(buffer.total_commands_run, 13);
        assert_eq!(buffer.kept(), 10);
        assert_eq!(buffer.dropped, 3);
        assert_eq!(buffer.commands[0].cmd, "echo 3");
    }

    #[test]
    fn preview_keeps_the_tail() {
        let output: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let preview = CommandPreview::from_output(&output);
        assert_eq!(preview.lines.len(), CommandPreview::MAX_LINES);
        assert_eq!(preview.lines[0], "line 10");
        assert!(preview.truncated);
        assert_eq!(preview.bytes, output.len());
    }

    #[test]
    fn settings_use_camel_case_on_the_wire() {
        let settings = ConversationSettings {
            approval_policy: Some("on-failure".into()),
            sandbox_policy: Some("workspace-write".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["approvalPolicy"], "on-failure");
        assert_eq!(value["sandboxPolicy"], "workspace-write");
    }
}
