//! REST handlers. All bodies are JSON; failures surface as
//! `{error:{kind,message}}` via [`crate::ApiError`].

use std::num::NonZero;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use fws_agent_pty::MatchSpec;
use fws_protocol::ApprovalKind;
use fws_protocol::ConversationSettings;
use fws_protocol::FwsErr;
use fws_protocol::RequestId;
use fws_protocol::TranscriptItem;

use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_READ_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

pub async fn list_conversations(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let conversations = state.store.list_conversations().await?;
    Ok(Json(json!({"conversations": conversations})))
}

pub async fn create_conversation(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let meta = state.store.create_conversation().await?;
    Ok(Json(serde_json::to_value(&meta).map_err(FwsErr::from)?))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.delete_conversation(&id).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct SelectBody {
    pub conversation_id: Option<String>,
    pub view: Option<String>,
}

pub async fn select(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectBody>,
) -> ApiResult<Json<Value>> {
    let config = state.store.select(body.conversation_id, body.view).await?;
    Ok(Json(serde_json::to_value(&config).map_err(FwsErr::from)?))
}

pub async fn active_meta(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(None).await?;
    let meta = state.store.load_meta(&id).await?;
    Ok(Json(serde_json::to_value(&meta).map_err(FwsErr::from)?))
}

#[derive(Deserialize)]
pub struct UpdateMetaBody {
    pub conversation_id: Option<String>,
    pub label: Option<String>,
    pub thread_id: Option<String>,
    pub settings: Option<ConversationSettings>,
}

pub async fn update_active_meta(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateMetaBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;

    if let Some(thread_id) = &body.thread_id {
        state.store.bind_thread(&id, thread_id).await?;
    }
    if let Some(label) = body.label {
        let mut meta = state.store.load_meta(&id).await?;
        meta.label = Some(label);
        state.store.save_meta(&id, meta).await?;
    }
    if let Some(settings) = body.settings {
        state.store.update_settings(&id, settings).await?;
        if let Some(acp) = &state.acp {
            // Eager session creation per the extension manifest.
            if let Err(e) = acp.on_settings_saved(&id).await {
                tracing::warn!("eager session init failed: {e}");
            }
        }
    }

    let meta = state.store.load_meta(&id).await?;
    Ok(Json(serde_json::to_value(&meta).map_err(FwsErr::from)?))
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RangeQuery {
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub from: u64,
    pub to: Option<u64>,
}

pub async fn transcript_range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let to = query.to.unwrap_or(u64::MAX);
    let range = state.store.range(&id, query.from, to).await?;
    Ok(Json(serde_json::to_value(&range).map_err(FwsErr::from)?))
}

#[derive(Deserialize)]
pub struct AppendBody {
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub item: TranscriptItem,
}

pub async fn transcript_append(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppendBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let msg_num = state.store.append_transcript(&id, body.item).await?;
    Ok(Json(json!({"msg_num": msg_num})))
}

// ---------------------------------------------------------------------------
// Child agent
// ---------------------------------------------------------------------------

pub async fn rpc_passthrough(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let result = state.bridge.rpc(body).await?;
    Ok(Json(json!({"result": result})))
}

pub async fn start_child(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(None).await?;
    state.bridge.start(&id).await?;
    Ok(Json(state.bridge.status()))
}

pub async fn stop_child(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.bridge.stop().await?;
    Ok(Json(state.bridge.status()))
}

pub async fn child_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    Ok(Json(state.bridge.status()))
}

/// Interrupt the current turn; orthogonally, poke the PTY if something is
/// running there.
pub async fn interrupt(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let rpc = state.bridge.interrupt().await;
    if let Ok(id) = state.resolve_conversation(None).await
        && let Ok(pty) = state.pty(&id).await
    {
        let _ = pty.interrupt().await;
    }
    match rpc {
        Ok(result) => Ok(Json(json!({"result": result}))),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
pub struct ApprovalRecordBody {
    pub conversation_id: Option<String>,
    pub request_id: RequestId,
    pub kind: ApprovalKind,
    pub decision: String,
}

pub async fn approval_record(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ApprovalRecordBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let msg_num = state
        .store
        .append_transcript(
            &id,
            TranscriptItem::Approval {
                request_id: body.request_id,
                kind: body.kind,
                decision: Some(body.decision),
            },
        )
        .await?;
    Ok(Json(json!({"msg_num": msg_num})))
}

// ---------------------------------------------------------------------------
// Agent PTY
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ExecBody {
    pub conversation_id: Option<String>,
    pub cmd: String,
}

pub async fn pty_exec(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    state
        .store
        .append_transcript(&id, TranscriptItem::ShellInput {
            text: body.cmd.clone(),
        })
        .await?;
    let receipt = pty.exec_block(&body.cmd).await?;
    Ok(Json(json!({
        "ok": true,
        "block_id": receipt.block_id,
        "resume_cursor": receipt.resume_cursor,
    })))
}

pub async fn pty_exec_interactive(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    state
        .store
        .append_transcript(&id, TranscriptItem::ShellInput {
            text: body.cmd.clone(),
        })
        .await?;
    let receipt = pty.exec_interactive(&body.cmd).await?;
    Ok(Json(json!({
        "ok": true,
        "session_id": receipt.block_id,
        "resume_cursor": receipt.resume_cursor,
    })))
}

#[derive(Deserialize)]
pub struct SendBody {
    pub conversation_id: Option<String>,
    /// Either plain text or base64 for control bytes.
    pub text: Option<String>,
    pub data_b64: Option<String>,
}

pub async fn pty_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let bytes = decode_send_payload(body.text, body.data_b64)?;
    pty.send(bytes).await?;
    Ok(Json(json!({"ok": true})))
}

fn decode_send_payload(text: Option<String>, data_b64: Option<String>) -> Result<Vec<u8>, FwsErr> {
    match (text, data_b64) {
        (Some(text), None) => Ok(text.into_bytes()),
        (None, Some(b64)) => BASE64_STANDARD
            .decode(b64)
            .map_err(|e| FwsErr::Validation(format!("bad data_b64: {e}"))),
        _ => Err(FwsErr::Validation(
            "exactly one of text or data_b64 is required".to_string(),
        )),
    }
}

#[derive(Deserialize)]
pub struct WaitForBody {
    pub conversation_id: Option<String>,
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub from_cursor: u64,
    pub timeout_ms: Option<u64>,
    pub max_bytes: Option<u64>,
}

pub async fn pty_wait_for(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WaitForBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let spec = MatchSpec::parse(&body.pattern, body.regex);
    let result = pty
        .wait_for(
            &spec,
            body.from_cursor,
            body.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS),
            body.max_bytes,
        )
        .await?;
    Ok(Json(serde_json::to_value(&result).map_err(FwsErr::from)?))
}

#[derive(Deserialize)]
pub struct ExpectSendBody {
    pub conversation_id: Option<String>,
    pub expect: String,
    #[serde(default)]
    pub regex: bool,
    pub send: String,
    #[serde(default)]
    pub from_cursor: u64,
    pub timeout_ms: Option<u64>,
}

pub async fn pty_expect_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExpectSendBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let spec = MatchSpec::parse(&body.expect, body.regex);
    let result = pty
        .expect_send(
            &spec,
            body.send.into_bytes(),
            body.from_cursor,
            body.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS),
        )
        .await?;
    Ok(Json(serde_json::to_value(&result).map_err(FwsErr::from)?))
}

#[derive(Deserialize)]
pub struct ReadSpoolBody {
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub cursor: u64,
    pub max_bytes: Option<usize>,
}

pub async fn pty_read_spool(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReadSpoolBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let (bytes, resume_cursor) =
        pty.read_spool(body.cursor, body.max_bytes.unwrap_or(DEFAULT_READ_BYTES));
    Ok(Json(json!({
        "text": String::from_utf8_lossy(&bytes),
        "resume_cursor": resume_cursor,
    })))
}

pub async fn pty_read_raw(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReadSpoolBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let (bytes, resume_cursor) =
        pty.read_raw(body.cursor, body.max_bytes.unwrap_or(DEFAULT_READ_BYTES))?;
    Ok(Json(json!({
        "data_b64": BASE64_STANDARD.encode(&bytes),
        "resume_cursor": resume_cursor,
    })))
}

#[derive(Deserialize)]
pub struct ConversationQuery {
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub cursor: u64,
}

pub async fn pty_read_screen(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let snapshot = pty.read_screen();
    Ok(Json(serde_json::to_value(&snapshot).map_err(FwsErr::from)?))
}

pub async fn pty_read_screen_deltas(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let (deltas, resume_cursor) = pty.read_screen_deltas(query.cursor)?;
    Ok(Json(json!({
        "deltas": deltas,
        "resume_cursor": resume_cursor,
    })))
}

pub async fn pty_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    Ok(Json(
        serde_json::to_value(&pty.status()).map_err(FwsErr::from)?,
    ))
}

#[derive(Deserialize)]
pub struct ConversationBody {
    pub conversation_id: Option<String>,
}

pub async fn pty_end_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConversationBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    pty.end_session().await?;
    Ok(Json(json!({"ok": true})))
}

pub async fn pty_reset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConversationBody>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(body.conversation_id).await?;
    let pty = state.pty(&id).await?;
    pty.reset().await?;
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Block queries
// ---------------------------------------------------------------------------

pub async fn blocks_since(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let (blocks, resume_cursor) = pty.blocks_since(query.cursor)?;
    Ok(Json(json!({
        "blocks": blocks,
        "resume_cursor": resume_cursor,
    })))
}

pub async fn blocks_get(
    State(state): State<Arc<AppState>>,
    Path(block_id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let meta = pty.block_get(&block_id)?;
    Ok(Json(serde_json::to_value(&meta).map_err(FwsErr::from)?))
}

#[derive(Deserialize)]
pub struct BlockReadQuery {
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub from_line: u64,
    pub to_line: Option<u64>,
}

pub async fn blocks_read(
    State(state): State<Arc<AppState>>,
    Path(block_id): Path<String>,
    Query(query): Query<BlockReadQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let lines = pty.block_read(
        &block_id,
        query.from_line,
        query.to_line.unwrap_or(u64::MAX),
    )?;
    Ok(Json(json!({"lines": lines})))
}

#[derive(Deserialize)]
pub struct BlockSearchQuery {
    pub conversation_id: Option<String>,
    pub query: String,
    pub block_id: Option<String>,
}

pub async fn blocks_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BlockSearchQuery>,
) -> ApiResult<Json<Value>> {
    let id = state.resolve_conversation(query.conversation_id).await?;
    let pty = state.pty(&id).await?;
    let hits = pty.block_search(&query.query, query.block_id.as_deref())?;
    Ok(Json(json!({"hits": hits})))
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FsListQuery {
    pub path: String,
}

pub async fn fs_list(
    State(_state): State<Arc<AppState>>,
    Query(query): Query<FsListQuery>,
) -> ApiResult<Json<Value>> {
    let listing = fws_file_search::list_dir(&PathBuf::from(query.path))?;
    Ok(Json(serde_json::to_value(&listing).map_err(FwsErr::from)?))
}

#[derive(Deserialize)]
pub struct FileSearchQuery {
    pub query: String,
    pub cwd: Option<String>,
    pub limit: Option<usize>,
}

pub async fn search_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileSearchQuery>,
) -> ApiResult<Json<Value>> {
    let root = match query.cwd {
        Some(cwd) => PathBuf::from(cwd),
        None => {
            let id = state.resolve_conversation(None).await?;
            let meta = state.store.load_meta(&id).await?;
            meta.settings
                .cwd
                .ok_or_else(|| FwsErr::Validation("no cwd configured".to_string()))?
        }
    };
    let limit = NonZero::new(query.limit.unwrap_or(50).max(1))
        .ok_or_else(|| FwsErr::Validation("limit must be positive".to_string()))?;
    let results = tokio::task::spawn_blocking(move || {
        fws_file_search::search(&root, &query.query, limit)
    })
    .await
    .map_err(|e| FwsErr::Validation(format!("search task failed: {e}")))??;
    Ok(Json(serde_json::to_value(&results).map_err(FwsErr::from)?))
}
