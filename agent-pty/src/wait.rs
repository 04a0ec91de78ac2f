//! `wait_for`: the central awaitable over the normalized spool.
//!
//! Exactly one cursor field, `resume_cursor`, comes back from every wait/read
//! API: `match_span.end` on success, the current spool size on timeout. It is
//! monotonic non-decreasing across successful calls and never earlier than
//! `from_cursor`.

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Duration;
use tokio::time::Instant;

use fws_protocol::FwsErr;
use fws_protocol::Result;

use crate::spool::Spool;

/// Token matched when the client asks for the prompt sentinel.
pub const PROMPT_TOKEN: &str = "PROMPT";
/// Token matched when the client asks for end-of-stream.
pub const EOF_TOKEN: &str = "EOF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSpec {
    Literal(String),
    Regex(String),
    Prompt,
    Eof,
}

impl MatchSpec {
    /// `regex` selects regex interpretation; the special tokens win either
    /// way.
    pub fn parse(pattern: &str, regex: bool) -> MatchSpec {
        match pattern {
            PROMPT_TOKEN => MatchSpec::Prompt,
            EOF_TOKEN => MatchSpec::Eof,
            other if regex => MatchSpec::Regex(other.to_string()),
            other => MatchSpec::Literal(other.to_string()),
        }
    }

    pub(crate) fn compile(&self) -> Result<CompiledMatch> {
        Ok(match self {
            MatchSpec::Literal(s) => CompiledMatch::Literal(s.clone()),
            MatchSpec::Regex(s) => CompiledMatch::Regex(
                regex_lite::Regex::new(s)
                    .map_err(|e| FwsErr::Validation(format!("bad match regex: {e}")))?,
            ),
            MatchSpec::Prompt => CompiledMatch::Prompt,
            MatchSpec::Eof => CompiledMatch::Eof,
        })
    }
}

pub(crate) enum CompiledMatch {
    Literal(String),
    Regex(regex_lite::Regex),
    Prompt,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpan {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResult {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_span: Option<MatchSpan>,
    pub resume_cursor: u64,
}

impl WaitResult {
    fn timeout(resume_cursor: u64) -> Self {
        Self {
            matched: false,
            match_text: None,
            match_span: None,
            resume_cursor,
        }
    }
}

/// Scan from `from_cursor`, then keep re-scanning as the spool grows until a
/// match appears or the deadline passes. A cursor beyond the spool returns
/// immediately with the current size so clients can re-synchronize.
pub(crate) async fn wait_for(
    spool: &Spool,
    spec: &MatchSpec,
    from_cursor: u64,
    timeout_ms: u64,
    max_bytes: Option<u64>,
) -> Result<WaitResult> {
    let compiled = spec.compile()?;
    if from_cursor > spool.len() {
        return Ok(WaitResult::timeout(spool.len()));
    }

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut version_rx = spool.subscribe();
    // Mark the current version seen; changes after this wake us.
    version_rx.mark_unchanged();

    loop {
        if let Some((start, end, text)) = spool.scan(&compiled, from_cursor, max_bytes) {
            return Ok(WaitResult {
                matched: true,
                match_text: Some(text),
                match_span: Some(MatchSpan { start, end }),
                resume_cursor: end.max(from_cursor),
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitResult::timeout(spool.len()));
        }
        match tokio::time::timeout(deadline - now, version_rx.changed()).await {
            Ok(Ok(())) => continue,
            // Writer gone: the stream can no longer grow.
            Ok(Err(_)) => return Ok(WaitResult::timeout(spool.len())),
            Err(_) => return Ok(WaitResult::timeout(spool.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn spool() -> (tempfile::TempDir, Arc<Spool>) {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(Spool::open(&dir.path().join("output.spool")).unwrap());
        (dir, spool)
    }

    #[tokio::test]
    async fn matches_existing_content_immediately() {
        let (_dir, spool) = spool();
        spool.append(b"hello\nworld\n");

        let res = wait_for(&spool, &MatchSpec::Literal("hello".into()), 0, 100, None)
            .await
            .unwrap();
        assert!(res.matched);
        assert_eq!(res.resume_cursor, 6);

        let res = wait_for(&spool, &MatchSpec::Literal("world".into()), 6, 100, None)
            .await
            .unwrap();
        assert_eq!(res.match_span, Some(MatchSpan { start: 6, end: 12 }));
        assert_eq!(res.resume_cursor, 12);
    }

    #[tokio::test]
    async fn wakes_on_growth_while_waiting() {
        let (_dir, spool) = spool();
        let writer = spool.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.append(b"late arrival\n");
        });

        let res = wait_for(&spool, &MatchSpec::Literal("arrival".into()), 0, 2_000, None)
            .await
            .unwrap();
        assert!(res.matched);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_returns_current_size_not_an_earlier_cursor() {
        let (_dir, spool) = spool();
        spool.append(b"abc");
        let res = wait_for(&spool, &MatchSpec::Literal("zzz".into()), 1, 50, None)
            .await
            .unwrap();
        assert!(!res.matched);
        assert_eq!(res.resume_cursor, 3);
    }

    #[tokio::test]
    async fn cursor_beyond_spool_returns_immediately() {
        let (_dir, spool) = spool();
        spool.append(b"ab");
        let started = Instant::now();
        let res = wait_for(&spool, &MatchSpec::Literal("a".into()), 99, 5_000, None)
            .await
            .unwrap();
        assert!(!res.matched);
        assert_eq!(res.resume_cursor, 2);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn regex_and_tokens_parse() {
        assert_eq!(MatchSpec::parse("PROMPT", false), MatchSpec::Prompt);
        assert_eq!(MatchSpec::parse("EOF", true), MatchSpec::Eof);
        assert_eq!(
            MatchSpec::parse("ab+", true),
            MatchSpec::Regex("ab+".into())
        );

        let (_dir, spool) = spool();
        spool.append(b"error: code 42\n");
        let res = wait_for(
            &spool,
            &MatchSpec::Regex(r"code \d+".into()),
            0,
            100,
            None,
        )
        .await
        .unwrap();
        assert_eq!(res.match_text.as_deref(), Some("code 42"));
    }

    #[tokio::test]
    async fn eof_matches_after_stream_end() {
        let (_dir, spool) = spool();
        spool.append(b"bye\n");
        spool.mark_eof();
        let res = wait_for(&spool, &MatchSpec::Eof, 0, 100, None).await.unwrap();
        assert!(res.matched);
        assert_eq!(res.resume_cursor, 4);
    }
}
