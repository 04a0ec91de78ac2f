//! Extension bridge for Agent Client Protocol children.
//!
//! Same line-delimited JSON-RPC transport as the codex bridge, different
//! protocol surface: one shared child across conversations, each
//! conversation mapped to an ACP session. The child is warmed up
//! (spawn + initialize) at installation startup; sessions are created
//! lazily, or eagerly on settings save when the extension manifest asks for
//! it. Session resume is not supported by the current extension target: a
//! lost session gets a fresh `session/new` and a `status:session_reset`
//! transcript entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Duration;

use fws_protocol::Event;
use fws_protocol::EventMsg;
use fws_protocol::FwsErr;
use fws_protocol::JsonRpcMessage;
use fws_protocol::JsonRpcRequest;
use fws_protocol::PlanStep;
use fws_protocol::RequestId;
use fws_protocol::Result;
use fws_protocol::TranscriptItem;
use fws_shell_runtime::ShellId;
use fws_shell_runtime::ShellRuntime;
use fws_shell_runtime::ShellSpec;
use fws_store::ConversationStore;

use crate::bridge::ChildState;
use crate::bridge::lock;
use crate::outgoing::RequestMap;

/// Budget for the startup `initialize` handshake.
const WARM_UP_TIMEOUT: Duration = Duration::from_secs(60);
/// Prompts run model turns; give them room.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(600);
const NEW_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AcpConfig {
    pub child_argv: Vec<String>,
    /// From the extension manifest: create a session as soon as a
    /// conversation's settings are saved.
    pub eager_session_init: bool,
}

impl Default for AcpConfig {
    fn default() -> Self {
        Self {
            child_argv: vec!["acp-agent".to_string()],
            eager_session_init: false,
        }
    }
}

struct SessionState {
    session_id: String,
    conversation_id: String,
    /// Turn counter for synthesized turn ids; ACP has no turn objects.
    turn: u64,
    assistant_buffer: String,
}

impl SessionState {
    fn turn_id(&self) -> String {
        format!("{}#{}", self.session_id, self.turn)
    }
}

struct AcpInner {
    store: Arc<ConversationStore>,
    runtime: ShellRuntime,
    config: AcpConfig,
    state: StdMutex<ChildState>,
    shell: StdMutex<Option<ShellId>>,
    out_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    requests: RequestMap,
    /// conversation id → session state; the session id partitions event
    /// delivery on the shared child.
    sessions: StdMutex<HashMap<String, SessionState>>,
    events: mpsc::UnboundedSender<Event>,
}

#[derive(Clone)]
pub struct AcpBridge {
    inner: Arc<AcpInner>,
}

impl AcpBridge {
    pub fn new(
        store: Arc<ConversationStore>,
        runtime: ShellRuntime,
        config: AcpConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            inner: Arc::new(AcpInner {
                store,
                runtime,
                config,
                state: StdMutex::new(ChildState::Stopped),
                shell: StdMutex::new(None),
                out_tx: StdMutex::new(None),
                requests: RequestMap::default(),
                sessions: StdMutex::new(HashMap::new()),
                events,
            }),
        }
    }

    #[cfg(test)]
    fn new_detached(
        store: Arc<ConversationStore>,
        events: mpsc::UnboundedSender<Event>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let bridge = Self::new(store, ShellRuntime::new(), AcpConfig::default(), events);
        *lock(&bridge.inner.state) = ChildState::Ready;
        *lock(&bridge.inner.out_tx) = Some(out_tx);
        (bridge, out_rx)
    }

    pub fn state(&self) -> ChildState {
        *lock(&self.inner.state)
    }

    /// Spawn the shared child and complete `initialize`. Called once at
    /// installation startup; sessions wait until a conversation needs one.
    pub async fn warm_up(&self) -> Result<()> {
        if self.state() == ChildState::Ready {
            return Ok(());
        }
        *lock(&self.inner.state) = ChildState::Starting;
        self.spawn_child()?;
        let result = self
            .inner
            .call(
                "initialize",
                Some(json!({
                    "protocolVersion": 1,
                    "clientCapabilities": {"fs": {"readTextFile": false, "writeTextFile": false}}
                })),
                WARM_UP_TIMEOUT,
            )
            .await;
        match result {
            Ok(_) => {
                *lock(&self.inner.state) = ChildState::Ready;
                Ok(())
            }
            Err(e) => {
                *lock(&self.inner.state) = ChildState::Crashed;
                Err(FwsErr::InitializeFailed(e.to_string()))
            }
        }
    }

    fn spawn_child(&self) -> Result<()> {
        let spec = ShellSpec::command(self.inner.config.child_argv.clone());
        let id = self.inner.runtime.spawn_pipe(&spec, &HashMap::new())?;
        *lock(&self.inner.shell) = Some(id);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.inner.out_tx) = Some(out_tx);

        let runtime = self.inner.runtime.clone();
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if runtime.write(id, bytes).await.is_err() {
                    break;
                }
            }
        });

        let rx = self.inner.runtime.subscribe(id)?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            let mut buf: Vec<u8> = Vec::new();
            loop {
                match rx.recv().await {
                    Ok(chunk) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                            if !text.trim().is_empty() {
                                inner.handle_line(text.trim()).await;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("acp reader lagged by {n} chunks");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inner.on_child_exit().await;
        });
        Ok(())
    }

    /// Eager session creation hook, driven by the extension manifest.
    pub async fn on_settings_saved(&self, conversation_id: &str) -> Result<()> {
        if !self.inner.config.eager_session_init {
            return Ok(());
        }
        self.ensure_session(conversation_id).await.map(|_| ())
    }

    pub async fn ensure_session(&self, conversation_id: &str) -> Result<String> {
        if let Some(existing) = self.inner.session_of(conversation_id) {
            return Ok(existing);
        }
        let meta = self.inner.store.load_meta(conversation_id).await?;
        let cwd = meta
            .settings
            .cwd
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let result = self
            .inner
            .call(
                "session/new",
                Some(json!({"cwd": cwd, "mcpServers": []})),
                NEW_SESSION_TIMEOUT,
            )
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| FwsErr::Validation("session/new returned no sessionId".to_string()))?
            .to_string();
        lock(&self.inner.sessions).insert(
            conversation_id.to_string(),
            SessionState {
                session_id: session_id.clone(),
                conversation_id: conversation_id.to_string(),
                turn: 0,
                assistant_buffer: String::new(),
            },
        );
        Ok(session_id)
    }

    /// One prompt = one turn. The response to `session/prompt` closes the
    /// assistant stream and the turn.
    pub async fn prompt(&self, conversation_id: &str, text: &str) -> Result<Value> {
        let session_id = self.ensure_session(conversation_id).await?;
        let turn_id = {
            let mut sessions = lock(&self.inner.sessions);
            let Some(session) = sessions.get_mut(conversation_id) else {
                return Err(FwsErr::NotFound(format!("session for {conversation_id}")));
            };
            session.turn += 1;
            session.assistant_buffer.clear();
            session.turn_id()
        };

        self.inner.emit(
            conversation_id,
            EventMsg::TurnStarted {
                turn_id: turn_id.clone(),
            },
        );
        self.inner
            .transcribe(conversation_id, TranscriptItem::User {
                text: text.to_string(),
            })
            .await;

        let result = self
            .inner
            .call(
                "session/prompt",
                Some(json!({
                    "sessionId": session_id,
                    "prompt": [{"type": "text", "text": text}]
                })),
                PROMPT_TIMEOUT,
            )
            .await;

        match result {
            Ok(value) => {
                let text = {
                    let mut sessions = lock(&self.inner.sessions);
                    sessions
                        .get_mut(conversation_id)
                        .map(|s| std::mem::take(&mut s.assistant_buffer))
                        .unwrap_or_default()
                };
                if !text.is_empty() {
                    self.inner.emit(
                        conversation_id,
                        EventMsg::AssistantFinalize {
                            turn_id: turn_id.clone(),
                            item_id: String::new(),
                            text: text.clone(),
                        },
                    );
                    self.inner
                        .transcribe(conversation_id, TranscriptItem::Assistant {
                            turn_id: turn_id.clone(),
                            text,
                        })
                        .await;
                }
                self.inner.emit(
                    conversation_id,
                    EventMsg::TurnCompleted {
                        turn_id,
                        errored: false,
                    },
                );
                Ok(value)
            }
            Err(e) => {
                self.inner.emit(
                    conversation_id,
                    EventMsg::TurnCompleted {
                        turn_id,
                        errored: true,
                    },
                );
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        *lock(&self.inner.state) = ChildState::Stopped;
        *lock(&self.inner.out_tx) = None;
        let shell = lock(&self.inner.shell).take();
        if let Some(id) = shell {
            self.inner.runtime.terminate(id, true).await?;
        }
        Ok(())
    }
}

impl AcpInner {
    fn session_of(&self, conversation_id: &str) -> Option<String> {
        lock(&self.sessions)
            .get(conversation_id)
            .map(|s| s.session_id.clone())
    }

    fn conversation_of_session(&self, session_id: &str) -> Option<String> {
        lock(&self.sessions)
            .values()
            .find(|s| s.session_id == session_id)
            .map(|s| s.conversation_id.clone())
    }

    fn emit(&self, conversation_id: &str, msg: EventMsg) {
        let _ = self.events.send(Event {
            conversation_id: conversation_id.to_string(),
            msg,
        });
    }

    async fn transcribe(&self, conversation_id: &str, item: TranscriptItem) {
        if let Err(e) = self.store.append_transcript(conversation_id, item).await {
            tracing::warn!("transcript append failed: {e}");
        }
    }

    fn send_line(&self, line: String) -> Result<()> {
        let tx = lock(&self.out_tx).clone();
        match tx {
            Some(tx) => tx.send(line).map_err(|_| FwsErr::ShellGone),
            None => Err(FwsErr::ShellGone),
        }
    }

    async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let (id, rx) = self.requests.allocate();
        let request = JsonRpcRequest::new(RequestId::Integer(id), method, params);
        self.send_line(serde_json::to_string(&JsonRpcMessage::Request(request))?)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FwsErr::ChildCrashed),
            Err(_) => {
                self.requests.forget(id);
                Err(FwsErr::RpcTimeout(method.to_string()))
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let msg: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("unparseable acp frame: {e}");
                return;
            }
        };
        match msg {
            JsonRpcMessage::Response(response) => {
                if let RequestId::Integer(id) = response.id {
                    self.requests.resolve(id, response.result);
                }
            }
            JsonRpcMessage::Error(error) => {
                if let RequestId::Integer(id) = error.id {
                    self.requests.reject(id, &error.error);
                }
            }
            JsonRpcMessage::Notification(note) => {
                if note.method == "session/update" {
                    self.on_session_update(note.params.unwrap_or(Value::Null)).await;
                }
            }
            JsonRpcMessage::Request(request) => {
                tracing::warn!("unhandled acp server request: {}", request.method);
            }
        }
    }

    /// ACP → normalized translation table.
    async fn on_session_update(&self, params: Value) {
        let Some(session_id) = params.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        let Some(conversation_id) = self.conversation_of_session(session_id) else {
            tracing::debug!("update for unknown session {session_id}");
            return;
        };
        let Some(update) = params.get("update") else {
            return;
        };
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let turn_id = lock(&self.sessions)
            .get(&conversation_id)
            .map(|s| s.turn_id())
            .unwrap_or_default();

        match kind {
            "agent_message_chunk" => {
                let delta = chunk_text(update);
                if let Some(session) = lock(&self.sessions).get_mut(&conversation_id) {
                    session.assistant_buffer.push_str(&delta);
                }
                self.emit(
                    &conversation_id,
                    EventMsg::AssistantDelta {
                        turn_id,
                        item_id: String::new(),
                        delta,
                    },
                );
            }
            "agent_thought_chunk" => {
                let delta = chunk_text(update);
                self.emit(
                    &conversation_id,
                    EventMsg::ReasoningDelta {
                        turn_id,
                        item_id: String::new(),
                        delta,
                    },
                );
            }
            "tool_call" => {
                let call_id = update
                    .get("toolCallId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let title = update
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.emit(&conversation_id, EventMsg::ShellBegin { call_id, title });
            }
            "tool_call_update" => {
                let call_id = update
                    .get("toolCallId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match update.get("status").and_then(Value::as_str) {
                    Some("completed") => {
                        self.emit(
                            &conversation_id,
                            EventMsg::ShellEnd {
                                call_id,
                                succeeded: true,
                            },
                        );
                    }
                    Some("failed") => {
                        self.emit(
                            &conversation_id,
                            EventMsg::ShellEnd {
                                call_id,
                                succeeded: false,
                            },
                        );
                    }
                    _ => {
                        self.emit(
                            &conversation_id,
                            EventMsg::ShellDelta {
                                call_id,
                                chunk: chunk_text(update),
                            },
                        );
                    }
                }
            }
            "plan" => {
                let steps = update
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| {
                                let step = entry.get("content").and_then(Value::as_str)?;
                                let status = entry
                                    .get("status")
                                    .cloned()
                                    .unwrap_or(Value::String("pending".into()));
                                let status = serde_json::from_value(status).ok()?;
                                Some(PlanStep {
                                    step: step.to_string(),
                                    status,
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                self.emit(&conversation_id, EventMsg::Plan { turn_id, steps });
            }
            other => {
                tracing::debug!("ignoring session update {other}");
            }
        }
    }

    /// The shared child died: every session is gone and cannot be resumed.
    /// Context loss is expected and surfaced per conversation.
    async fn on_child_exit(&self) {
        let was_stopped = { *lock(&self.state) == ChildState::Stopped };
        if was_stopped {
            return;
        }
        *lock(&self.state) = ChildState::Crashed;
        *lock(&self.out_tx) = None;
        self.requests.fail_all(|| FwsErr::ChildCrashed);

        let conversations: Vec<String> = {
            let mut sessions = lock(&self.sessions);
            sessions.drain().map(|(conversation, _)| conversation).collect()
        };
        for conversation_id in conversations {
            self.transcribe(
                &conversation_id,
                TranscriptItem::Status {
                    status: "session_reset".to_string(),
                    message: Some("extension session lost; a new session will be created".into()),
                },
            )
            .await;
        }
    }
}

fn chunk_text(update: &Value) -> String {
    update
        .get("content")
        .map(|content| match content {
            Value::String(text) => text.clone(),
            other => other
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
        .unwrap_or_default()
}
