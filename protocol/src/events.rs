//! The normalized event stream.
//!
//! Raw protocol traffic from a child agent and raw PTY bytes are both
//! translated into these events before anything reaches a subscriber. One
//! subscriber set exists per conversation; events for a single conversation
//! are delivered in emission order.

use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorKind;
use crate::jsonrpc::RequestId;

/// An event as broadcast over `/ws/appserver`:
/// `{type, conversation_id, …type-specific fields…}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub conversation_id: String,
    #[serde(flatten)]
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, strum_macros::Display)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventMsg {
    TurnStarted {
        turn_id: String,
    },

    /// Streamed assistant text. UI-only; deltas are never transcribed.
    AssistantDelta {
        turn_id: String,
        item_id: String,
        delta: String,
    },

    ReasoningDelta {
        turn_id: String,
        item_id: String,
        delta: String,
    },

    AssistantFinalize {
        turn_id: String,
        item_id: String,
        text: String,
    },

    ReasoningFinalize {
        turn_id: String,
        item_id: String,
        text: String,
    },

    /// A command execution item finalized by the child agent.
    CommandFinalize {
        turn_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    /// A finalized user message (envelope already stripped).
    Message {
        text: String,
    },

    /// One canonical diff per (turn, content signature).
    Diff {
        turn_id: String,
        signature: String,
        diff: String,
    },

    Plan {
        turn_id: String,
        steps: Vec<PlanStep>,
    },

    /// Server-initiated approval request awaiting a user decision.
    Approval {
        request_id: RequestId,
        kind: ApprovalKind,
        payload: serde_json::Value,
    },

    TokenCount {
        usage: TokenUsage,
    },

    TurnCompleted {
        turn_id: String,
        errored: bool,
    },

    // ACP tool-call lifecycle, translated onto the shell vocabulary.
    ShellBegin {
        call_id: String,
        title: String,
    },

    ShellDelta {
        call_id: String,
        chunk: String,
    },

    ShellEnd {
        call_id: String,
        succeeded: bool,
    },

    BlockBegin {
        block_id: String,
        cmd: String,
        cwd: String,
    },

    BlockEnd {
        block_id: String,
        exit_code: Option<i32>,
    },

    /// Changed rows of the virtual screen, throttled at the source.
    ScreenDelta {
        seq: u64,
        rows: Vec<ScreenRowUpdate>,
        cursor: ScreenCursor,
        alt_screen: bool,
    },

    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Command,
    FileChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: String,
    pub status: PlanStepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRowUpdate {
    pub row: u16,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenCursor {
    pub row: u16,
    pub col: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_carry_snake_case_type_tags() {
        let event = Event {
            conversation_id: "c1".into(),
            msg: EventMsg::AssistantDelta {
                turn_id: "t1".into(),
                item_id: "i1".into(),
                delta: "hel".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "assistant_delta");
        assert_eq!(value["conversation_id"], "c1");
        assert_eq!(value["delta"], "hel");
    }

    #[test]
    fn display_matches_wire_tag() {
        let msg = EventMsg::TurnCompleted {
            turn_id: "t1".into(),
            errored: false,
        };
        assert_eq!(msg.to_string(), "turn_completed");
    }
}
