//! The codex-variant bridge: one shared child process per installation,
//! driven over line-delimited JSON-RPC on raw pipes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use fws_protocol::ApprovalKind;
use fws_protocol::CmdContextEnvelope;
use fws_protocol::ErrorKind;
use fws_protocol::Event;
use fws_protocol::EventMsg;
use fws_protocol::FwsErr;
use fws_protocol::JsonRpcMessage;
use fws_protocol::JsonRpcRequest;
use fws_protocol::RequestId;
use fws_protocol::Result;
use fws_protocol::TranscriptItem;
use fws_shell_runtime::ShellId;
use fws_shell_runtime::ShellRuntime;
use fws_shell_runtime::ShellSpec;
use fws_store::ConversationStore;

use crate::outgoing::RPC_TIMEOUT;
use crate::outgoing::RequestMap;
use crate::settings;
use crate::turn::TurnState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    Stopped,
    Starting,
    Initialized,
    Ready,
    Crashed,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Child process argv, e.g. `["codex", "app-server"]`.
    pub child_argv: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            child_argv: vec!["codex".to_string(), "app-server".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PendingApproval {
    pub request_id: RequestId,
    pub kind: ApprovalKind,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

pub(crate) struct BridgeInner {
    pub store: Arc<ConversationStore>,
    runtime: ShellRuntime,
    config: BridgeConfig,
    state: StdMutex<ChildState>,
    shell: StdMutex<Option<ShellId>>,
    /// JSON lines queued for the child's stdin; the writer task appends the
    /// trailing newline.
    out_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    pub requests: RequestMap,
    pub turns: StdMutex<HashMap<String, TurnState>>,
    pub pending_approvals: StdMutex<HashMap<RequestId, PendingApproval>>,
    /// Conversation currently bound to this child's event stream.
    conversation: StdMutex<Option<String>>,
    events: mpsc::UnboundedSender<Event>,
}

/// Public handle. Cheap to clone.
#[derive(Clone)]
pub struct CodexBridge {
    inner: Arc<BridgeInner>,
}

impl CodexBridge {
    pub fn new(
        store: Arc<ConversationStore>,
        runtime: ShellRuntime,
        config: BridgeConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                runtime,
                config,
                state: StdMutex::new(ChildState::Stopped),
                shell: StdMutex::new(None),
                out_tx: StdMutex::new(None),
                requests: RequestMap::default(),
                turns: StdMutex::new(HashMap::new()),
                pending_approvals: StdMutex::new(HashMap::new()),
                conversation: StdMutex::new(None),
                events,
            }),
        }
    }

    /// Test harness: no child process; outbound lines are captured.
    #[cfg(test)]
    pub(crate) fn new_detached(
        store: Arc<ConversationStore>,
        events: mpsc::UnboundedSender<Event>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let bridge = Self::new(store, ShellRuntime::new(), BridgeConfig::default(), events);
        *lock(&bridge.inner.state) = ChildState::Ready;
        *lock(&bridge.inner.out_tx) = Some(out_tx);
        (bridge, out_rx)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<BridgeInner> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn bind_conversation(&self, conversation_id: &str) {
        *lock(&self.inner.conversation) = Some(conversation_id.to_string());
    }

    pub fn state(&self) -> ChildState {
        *lock(&self.inner.state)
    }

    pub fn conversation(&self) -> Option<String> {
        lock(&self.inner.conversation).clone()
    }

    /// Ensure the child is running and initialized, and bind its event
    /// stream to `conversation_id`. Re-entry into `ready` after a crash goes
    /// through the full re-initialize.
    pub async fn start(&self, conversation_id: &str) -> Result<()> {
        *lock(&self.inner.conversation) = Some(conversation_id.to_string());
        if self.state() == ChildState::Ready {
            return Ok(());
        }

        *lock(&self.inner.state) = ChildState::Starting;
        self.spawn_child()?;

        let initialize = self
            .inner
            .call_raw(
                "initialize",
                Some(json!({
                    "clientInfo": {"name": "framework-shells", "version": env!("CARGO_PKG_VERSION")}
                })),
            )
            .await;
        match initialize {
            Ok(_) => {
                *lock(&self.inner.state) = ChildState::Initialized;
                self.inner
                    .send_notification("initialized", None)
                    .unwrap_or_else(|e| tracing::warn!("initialized notification failed: {e}"));
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

        // Writer: one frame per line, trailing LF, in queue order.
        let runtime = self.inner.runtime.clone();
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if let Err(e) = runtime.write(id, bytes).await {
                    tracing::warn!("write to child failed: {e}");
                    break;
                }
            }
        });

        // Reader: reassemble lines from the byte stream and route them.
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
                        tracing::warn!("bridge reader lagged by {n} chunks");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inner.on_child_exit().await;
        });
        Ok(())
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

    pub fn status(&self) -> Value {
        let shell = *lock(&self.inner.shell);
        let alive = shell
            .and_then(|id| self.inner.runtime.status(id).ok())
            .map(|s| s.alive)
            .unwrap_or(false);
        json!({
            "state": self.state(),
            "alive": alive,
            "conversation_id": self.conversation(),
        })
    }

    /// JSON-RPC passthrough: client-supplied requests get a bridge id,
    /// settings injection and the envelope; id+result bodies are approval
    /// decisions relayed verbatim.
    pub async fn rpc(&self, body: Value) -> Result<Value> {
        if let Some(method) = body.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            let params = body.get("params").cloned();
            return self.request(&method, params).await;
        }
        if body.get("id").is_some()
            && (body.get("result").is_some() || body.get("error").is_some())
        {
            return self.inner.relay_approval_response(body).await;
        }
        Err(FwsErr::Validation(
            "expected a request or an approval response".to_string(),
        ))
    }

    /// A client-visible request with SSOT preparation applied.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.state() != ChildState::Ready {
            return Err(match self.state() {
                ChildState::Crashed => FwsErr::ChildCrashed,
                _ => FwsErr::Validation("child is not running".to_string()),
            });
        }
        let mut params = params.unwrap_or(Value::Null);
        self.inner.prepare_outbound(method, &mut params).await?;
        let params = if params.is_null() { None } else { Some(params) };
        let result = self.inner.call_raw(method, params).await?;
        self.inner.absorb_result(method, &result).await;
        Ok(result)
    }

    /// Interrupt the current turn.
    pub async fn interrupt(&self) -> Result<Value> {
        self.request("turn/interrupt", None).await
    }

    pub fn pending_approval_count(&self) -> usize {
        lock(&self.inner.pending_approvals).len()
    }
}

impl BridgeInner {
    pub(crate) fn send_line(&self, line: String) -> Result<()> {
        let tx = lock(&self.out_tx).clone();
        match tx {
            Some(tx) => tx.send(line).map_err(|_| FwsErr::ShellGone),
            None => Err(FwsErr::ShellGone),
        }
    }

    fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = fws_protocol::JsonRpcNotification::new(method, params);
        self.send_line(serde_json::to_string(&JsonRpcMessage::Notification(note))?)
    }

    /// Allocate an id, send, and await the single-shot response slot.
    pub(crate) async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (id, rx) = self.requests.allocate();
        let request = JsonRpcRequest::new(RequestId::Integer(id), method, params);
        self.send_line(serde_json::to_string(&JsonRpcMessage::Request(request))?)?;
        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FwsErr::ChildCrashed),
            Err(_) => {
                self.requests.forget(id);
                Err(FwsErr::RpcTimeout(method.to_string()))
            }
        }
    }

    pub(crate) fn current_conversation(&self) -> Option<String> {
        lock(&self.conversation).clone()
    }

    pub(crate) fn emit(&self, conversation_id: &str, msg: EventMsg) {
        let _ = self.events.send(Event {
            conversation_id: conversation_id.to_string(),
            msg,
        });
    }

    pub(crate) async fn transcribe(&self, conversation_id: &str, item: TranscriptItem) {
        if let Err(e) = self.store.append_transcript(conversation_id, item).await {
            tracing::warn!("transcript append failed: {e}");
        }
    }

    /// SSOT injection, thread-id fill-in and envelope wrapping for outbound
    /// requests. The meta is re-read on every call.
    pub(crate) async fn prepare_outbound(&self, method: &str, params: &mut Value) -> Result<()> {
        let Some(conversation_id) = self.current_conversation() else {
            return Ok(());
        };
        if !settings::INJECTED_METHODS.contains(&method) {
            return Ok(());
        }
        let meta = self.store.load_meta(&conversation_id).await?;
        settings::inject_settings(method, params, &meta.settings);

        if method == "thread/resume"
            && params.get("threadId").is_none_or(Value::is_null)
            && let Some(thread_id) = &meta.thread_id
        {
            params["threadId"] = Value::String(thread_id.clone());
        }

        if method == "turn/start" {
            self.inject_envelope(&conversation_id, params).await?;
        }
        Ok(())
    }

    /// Prefix the first text input with the sentinel-framed command-context
    /// envelope, then clear the buffer.
    async fn inject_envelope(&self, conversation_id: &str, params: &mut Value) -> Result<()> {
        let mut meta = self.store.load_meta(conversation_id).await?;
        let Some(buffer) = meta.pending_cmd_buffer.clone() else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }
        let Some(text) = params
            .get("input")
            .and_then(|input| input.get(0))
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };

        let shell_id = std::fs::read_to_string(
            self.store.agent_pty_dir(conversation_id).join("shell_id.txt"),
        )
        .ok()
        .map(|s| s.trim().to_string());
        let envelope = CmdContextEnvelope::from_buffer(conversation_id, shell_id, &buffer);
        let wrapped = envelope.wrap(text)?;
        params["input"][0]["text"] = Value::String(wrapped);

        meta.pending_cmd_buffer = None;
        self.store.save_meta(conversation_id, meta).await?;
        Ok(())
    }

    /// Post-processing of successful results (thread binding).
    pub(crate) async fn absorb_result(&self, method: &str, result: &Value) {
        if method != "thread/start" && method != "thread/resume" {
            return;
        }
        let Some(conversation_id) = self.current_conversation() else {
            return;
        };
        let thread_id = result
            .get("threadId")
            .and_then(Value::as_str)
            .or_else(|| {
                result
                    .get("thread")
                    .and_then(|t| t.get("id"))
                    .and_then(Value::as_str)
            });
        if let Some(thread_id) = thread_id {
            match self.store.bind_thread(&conversation_id, thread_id).await {
                Ok(_) => {}
                Err(FwsErr::ImmutableThreadId) => {
                    tracing::warn!("child returned a different thread id; keeping the bound one");
                }
                Err(e) => tracing::warn!("thread bind failed: {e}"),
            }
        }
    }

    /// Relay an approval decision to the child verbatim and retire the
    /// pending entry. Decisions for unknown ids are stale.
    pub(crate) async fn relay_approval_response(&self, body: Value) -> Result<Value> {
        let id: RequestId = serde_json::from_value(
            body.get("id")
                .cloned()
                .ok_or_else(|| FwsErr::Validation("missing id".to_string()))?,
        )?;
        let pending = lock(&self.pending_approvals).remove(&id);
        let Some(pending) = pending else {
            tracing::warn!("discarding stale approval response for {id}");
            return Err(FwsErr::ApprovalStale(id.to_string()));
        };

        self.send_line(serde_json::to_string(&body)?)?;

        if let Some(conversation_id) = self.current_conversation() {
            let decision = body
                .get("result")
                .and_then(|r| r.get("decision"))
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            self.transcribe(
                &conversation_id,
                TranscriptItem::Approval {
                    request_id: pending.request_id.clone(),
                    kind: pending.kind,
                    decision,
                },
            )
            .await;
        }
        Ok(json!({"ok": true}))
    }

    /// Child went away without a stop: fail in-flight RPCs, surface the
    /// crash, await explicit restart.
    pub(crate) async fn on_child_exit(&self) {
        let was_stopped = { *lock(&self.state) == ChildState::Stopped };
        if was_stopped {
            return;
        }
        *lock(&self.state) = ChildState::Crashed;
        *lock(&self.out_tx) = None;
        self.requests.fail_all(|| FwsErr::ChildCrashed);
        lock(&self.turns).clear();

        if let Some(conversation_id) = self.current_conversation() {
            self.emit(
                &conversation_id,
                EventMsg::Error {
                    kind: ErrorKind::ChildCrashed,
                    message: "child process crashed".to_string(),
                    request_id: None,
                },
            );
            self.transcribe(
                &conversation_id,
                TranscriptItem::Status {
                    status: "child_crashed".to_string(),
                    message: None,
                },
            )
            .await;
        }
    }
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
