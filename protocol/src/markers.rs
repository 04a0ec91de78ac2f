//! Terminal marker grammar.
//!
//! The managed shell emits three structured marker lines into the PTY byte
//! stream. Fields that can contain arbitrary bytes (cwd, cmd) are base64
//! encoded so markers survive any command content. Markers are stripped from
//! the normalized spool but remain in the raw byte log.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;

pub const MARKER_BLOCK_BEGIN: &str = "__FWS_BLOCK_BEGIN__";
pub const MARKER_BLOCK_END: &str = "__FWS_BLOCK_END__";
pub const MARKER_PROMPT: &str = "__FWS_PROMPT__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    BlockBegin {
        seq: u64,
        ts: i64,
        cwd: String,
        cmd: String,
    },
    BlockEnd {
        seq: u64,
        ts: i64,
        exit: Option<i32>,
    },
    Prompt {
        ts: i64,
        cwd: Option<String>,
        exit: Option<i32>,
    },
}

impl Marker {
    /// True if `line` starts with any marker token; cheap pre-filter used by
    /// the spool writer before attempting a full parse.
    pub fn is_marker_line(line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.starts_with(MARKER_BLOCK_BEGIN)
            || trimmed.starts_with(MARKER_BLOCK_END)
            || trimmed.starts_with(MARKER_PROMPT)
    }

    pub fn parse(line: &str) -> Option<Marker> {
        let mut tokens = line.split_whitespace();
        let head = tokens.next()?;
        let fields: Fields = tokens.collect();
        match head {
            MARKER_BLOCK_BEGIN => Some(Marker::BlockBegin {
                seq: fields.get("seq")?.parse().ok()?,
                ts: fields.get("ts")?.parse().ok()?,
                cwd: fields.get_b64("cwd_b64")?,
                cmd: fields.get_b64("cmd_b64")?,
            }),
            MARKER_BLOCK_END => Some(Marker::BlockEnd {
                seq: fields.get("seq")?.parse().ok()?,
                ts: fields.get("ts")?.parse().ok()?,
                exit: fields.get("exit").and_then(|v| v.parse().ok()),
            }),
            MARKER_PROMPT => Some(Marker::Prompt {
                ts: fields.get("ts")?.parse().ok()?,
                cwd: fields.get_b64("cwd_b64"),
                exit: fields.get("exit").and_then(|v| v.parse().ok()),
            }),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Marker::BlockBegin { seq, ts, cwd, cmd } => format!(
                "{MARKER_BLOCK_BEGIN} seq={seq} ts={ts} cwd_b64={} cmd_b64={}",
                BASE64_STANDARD.encode(cwd),
                BASE64_STANDARD.encode(cmd),
            ),
            Marker::BlockEnd { seq, ts, exit } => match exit {
                Some(code) => format!("{MARKER_BLOCK_END} seq={seq} ts={ts} exit={code}"),
                None => format!("{MARKER_BLOCK_END} seq={seq} ts={ts}"),
            },
            Marker::Prompt { ts, cwd, exit } => {
                let mut out = format!("{MARKER_PROMPT} ts={ts}");
                if let Some(cwd) = cwd {
                    out.push_str(&format!(" cwd_b64={}", BASE64_STANDARD.encode(cwd)));
                }
                if let Some(code) = exit {
                    out.push_str(&format!(" exit={code}"));
                }
                out
            }
        }
    }
}

struct Fields<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> FromIterator<&'a str> for Fields<'a> {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        let pairs = iter
            .into_iter()
            .filter_map(|token| token.split_once('='))
            .collect();
        Self { pairs }
    }
}

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn get_b64(&self, key: &str) -> Option<String> {
        let raw = self.get(key)?;
        let bytes = BASE64_STANDARD.decode(raw).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}
