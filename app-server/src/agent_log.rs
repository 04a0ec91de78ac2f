//! Flat JSONL message board for coordinating multiple agents in one repo.
//!
//! Write payload is exactly `{who, message}`; the server adds `ts`. Reads
//! return everything, oldest first.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use fws_protocol::FwsErr;
use fws_protocol::Result;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub who: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

pub struct AgentLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AgentLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            append_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, who: String, message: String) -> Result<AgentLogEntry> {
        let entry = AgentLogEntry {
            who,
            message,
            ts: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(entry)
    }

    pub async fn read_all(&self) -> Result<Vec<AgentLogEntry>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in data.lines() {
            match serde_json::from_str::<AgentLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("skipping malformed agent log line: {e}"),
            }
        }
        Ok(entries)
    }
}

#[derive(Deserialize)]
pub struct PostMessageBody {
    pub who: String,
    pub message: String,
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<Json<Value>> {
    if body.who.trim().is_empty() || body.message.trim().is_empty() {
        return Err(FwsErr::Validation("who and message are required".to_string()).into());
    }
    let entry = state.agent_log.append(body.who, body.message).await?;
    Ok(Json(serde_json::to_value(&entry).map_err(FwsErr::from)?))
}

pub async fn get_messages(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let entries = state.agent_log.read_all().await?;
    Ok(Json(json!({"messages": entries})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn append_then_read_round_trips_with_server_ts() {
        let dir = tempfile::tempdir().unwrap();
        let log = AgentLog::new(dir.path().join("agent_chat.log.jsonl"));

        log.append("agent-alpha".into(), "starting task 3".into())
            .await
            .unwrap();
        log.append("agent-beta".into(), "ack".into()).await.unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].who, "agent-alpha");
        assert_eq!(entries[0].message, "starting task 3");
        assert_eq!(entries[1].who, "agent-beta");
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AgentLog::new(dir.path().join("nope.jsonl"));
        assert!(log.read_all().await.unwrap().is_empty());
    }
}
