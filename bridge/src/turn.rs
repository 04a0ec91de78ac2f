//! Transient per-turn state, created on `turn/started` and destroyed on
//! `turn/completed`.

use std::collections::HashMap;
use std::collections::HashSet;

use fws_protocol::PlanStep;

#[derive(Default)]
pub(crate) struct TurnState {
    /// Streamed assistant text keyed by item id.
    pub assistant: HashMap<String, String>,
    /// Streamed reasoning summaries keyed by item id.
    pub reasoning: HashMap<String, String>,
    /// At most one assistant and one reasoning entry reach the transcript.
    pub assistant_transcribed: bool,
    pub reasoning_transcribed: bool,
    /// Signatures of diffs already surfaced this turn.
    pub diff_signatures: HashSet<String>,
    /// Item-level short diffs held back in favor of the contextual turn-level
    /// rendering; flushed at turn end if no contextual diff superseded them.
    pub short_diffs: Vec<(String, String)>,
    pub plan_steps: Vec<PlanStep>,
}

impl TurnState {
    pub(crate) fn append_assistant(&mut self, item_id: &str, delta: &str) {
        self.assistant
            .entry(item_id.to_string())
            .or_default()
            .push_str(delta);
    }

    pub(crate) fn append_reasoning(&mut self, item_id: &str, delta: &str) {
        self.reasoning
            .entry(item_id.to_string())
            .or_default()
            .push_str(delta);
    }

    /// Final text for an item: the completed payload when present, else the
    /// assembled buffer.
    pub(crate) fn take_assistant(&mut self, item_id: &str, completed: Option<&str>) -> String {
        let buffered = self.assistant.remove(item_id).unwrap_or_default();
        match completed {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => buffered,
        }
    }

    pub(crate) fn take_reasoning(&mut self, item_id: &str, completed: Option<&str>) -> String {
        let buffered = self.reasoning.remove(item_id).unwrap_or_default();
        match completed {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => buffered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deltas_accumulate_per_item() {
        let mut turn = TurnState::default();
        turn.append_assistant("i1", "hel");
        turn.append_assistant("i1", "lo");
        turn.append_assistant("i2", "other");
        assert_eq!(turn.take_assistant("i1", None), "hello");
        assert_eq!(turn.take_assistant("i2", None), "other");
        assert_eq!(turn.take_assistant("i3", None), "");
    }

    #[test]
    fn completed_payload_wins_over_buffer() {
        let mut turn = TurnState::default();
        turn.append_reasoning("i1", "partial");
        assert_eq!(turn.take_reasoning("i1", Some("full text")), "full text");
    }
}
