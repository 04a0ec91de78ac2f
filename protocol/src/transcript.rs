//! Curated transcript entries.
//!
//! The transcript is an append-only JSONL file per conversation. Entries are
//! never rewritten; streamed deltas are never transcribed, only finalized
//! items and side effects.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorKind;
use crate::events::ApprovalKind;
use crate::events::PlanStep;
use crate::events::TokenUsage;
use crate::jsonrpc::RequestId;

/// One line of `transcript.jsonl`. `msg_num` is a dense, strictly increasing
/// sequence assigned by the store at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub msg_num: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub item: TranscriptItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TranscriptItem {
    User {
        text: String,
    },

    /// At most one per turn, written on `item/completed`.
    Assistant {
        turn_id: String,
        text: String,
    },

    /// At most one per turn.
    Reasoning {
        turn_id: String,
        text: String,
    },

    /// At most one per (turn, signature).
    Diff {
        turn_id: String,
        signature: String,
        diff: String,
    },

    /// A command execution item finalized by the child agent.
    Command {
        turn_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregated_output: Option<String>,
    },

    Approval {
        request_id: RequestId,
        kind: ApprovalKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decision: Option<String>,
    },

    /// Final plan snapshot, written once on `turn/completed`.
    Plan {
        turn_id: String,
        steps: Vec<PlanStep>,
    },

    ShellInput {
        text: String,
    },

    ShellOutput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block_id: Option<String>,
        text: String,
    },

    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    TokenUsage {
        usage: TokenUsage,
    },

    McpTool {
        server: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        succeeded: Option<bool>,
    },

    Error {
        kind: ErrorKind,
        message: String,
    },
}
