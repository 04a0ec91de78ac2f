//! Command-context envelope.
//!
//! When the user drives the PTY and then messages the agent, the outgoing
//! user text is prefixed with `\x1eCODEX_META <json>\x1f` so the child sees a
//! record of what the user just ran. The transcript and the UI never see the
//! envelope: every user-message ingress passes through
//! [`strip_meta_envelope`], the single choke point.
//!
//! The ASCII record/unit separators plus the literal guard prefix make
//! detection false-positive free without imposing UTF-8 constraints on the
//! payload.

use serde::Deserialize;
use serde::Serialize;

use crate::meta::CommandSummary;
use crate::meta::PendingCmdBuffer;

pub const META_ENVELOPE_PREFIX: &str = "\u{1e}CODEX_META ";
pub const META_ENVELOPE_TERMINATOR: char = '\u{1f}';

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdContextEnvelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_id: Option<String>,
    pub total_commands_run: u64,
    pub kept: u64,
    pub dropped: u64,
    pub commands: Vec<CommandSummary>,
    #[serde(default)]
    pub mcp: Vec<serde_json::Value>,
}

impl CmdContextEnvelope {
    pub fn from_buffer(
        conversation_id: &str,
        shell_id: Option<String>,
        buffer: &PendingCmdBuffer,
    ) -> Self {
        Self {
            v: 1,
            kind: "user_cmd_context".to_string(),
            conversation_id: conversation_id.to_string(),
            shell_id,
            total_commands_run: buffer.total_commands_run,
            kept: buffer.kept(),
            dropped: buffer.dropped,
            commands: buffer.commands.clone(),
            mcp: Vec::new(),
        }
    }

    /// Prefix `text` with the sentinel-framed serialized envelope.
    pub fn wrap(&self, text: &str) -> serde_json::Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!(
            "{META_ENVELOPE_PREFIX}{json}{META_ENVELOPE_TERMINATOR}{text}"
        ))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeIngress<'a> {
    /// No envelope prefix present; use the text as-is.
    Absent,
    /// Envelope removed; the remainder is the real user text.
    Stripped(&'a str),
    /// Prefix present but no terminator. Treat the text as-is and warn.
    Malformed,
}

pub fn strip_meta_envelope(text: &str) -> EnvelopeIngress<'_> {
    let Some(rest) = text.strip_prefix(META_ENVELOPE_PREFIX) else {
        return EnvelopeIngress::Absent;
    };
    match rest.find(META_ENVELOPE_TERMINATOR) {
        Some(idx) => EnvelopeIngress::Stripped(&rest[idx + META_ENVELOPE_TERMINATOR.len_utf8()..]),
        None => EnvelopeIngress::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wrap_then_strip_recovers_the_text() {
        let envelope = CmdContextEnvelope::from_buffer("c1", None, &PendingCmdBuffer::default());
        let wrapped = envelope.wrap("hi").unwrap();
        assert!(wrapped.starts_with("\u{1e}CODEX_META {"));
        assert_eq!(strip_meta_envelope(&wrapped), EnvelopeIngress::Stripped("hi"));
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_meta_envelope("hello"), EnvelopeIngress::Absent);
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let text = format!("{META_ENVELOPE_PREFIX}{{\"v\":1}} hi");
        assert_eq!(strip_meta_envelope(&text), EnvelopeIngress::Malformed);
    }

    #[test]
    fn envelope_reports_buffer_counters() {
        let mut buffer = PendingCmdBuffer::default();
        for i in 0..3 {
            buffer.push(crate::meta::CommandSummary {
                cmd: format!("cmd{i}"),
                exit_code: Some(0),
                cwd: "/".into(),
                block_id: format!("b{i}"),
                ts: i,
                preview: crate::meta::CommandPreview::default(),
            });
        }
        let envelope = CmdContextEnvelope::from_buffer("c1", Some("s1".into()), &buffer);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"kept\":3"));
        assert!(json.contains("\"dropped\":0"));
        assert!(json.contains("\"type\":\"user_cmd_context\""));
    }
}
