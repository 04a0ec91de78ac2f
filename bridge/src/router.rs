//! The event router: every parsed line from the child goes through here.
//!
//! 1. Responses/errors with a known id resolve the matching request slot.
//! 2. Server-initiated requests that are approvals (modern
//!    `item/*/requestApproval` names and legacy `applyPatchApproval` /
//!    `execCommandApproval`, both accepted for the life of a connection)
//!    enqueue a pending approval and emit a normalized `approval` event.
//! 3. Notifications dispatch on `method`, or on the nested `msg.type` for
//!    wrapped envelopes.

use chrono::Utc;
use serde_json::Value;

use fws_protocol::ApprovalKind;
use fws_protocol::EnvelopeIngress;
use fws_protocol::ErrorKind;
use fws_protocol::EventMsg;
use fws_protocol::JsonRpcMessage;
use fws_protocol::JsonRpcRequest;
use fws_protocol::PlanStep;
use fws_protocol::RequestId;
use fws_protocol::TokenUsage;
use fws_protocol::TranscriptItem;
use fws_protocol::strip_meta_envelope;

use crate::bridge::BridgeInner;
use crate::bridge::PendingApproval;
use crate::bridge::lock;
use crate::diff::diff_signature;
use crate::turn::TurnState;

impl BridgeInner {
    pub(crate) async fn handle_line(&self, line: &str) {
        let msg: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("unparseable child frame: {e}");
                return;
            }
        };
        match msg {
            JsonRpcMessage::Response(response) => {
                let resolved = match &response.id {
                    RequestId::Integer(id) => self.requests.resolve(*id, response.result),
                    RequestId::String(_) => false,
                };
                if !resolved {
                    tracing::warn!("response for unknown request id");
                }
            }
            JsonRpcMessage::Error(error) => {
                let rejected = match &error.id {
                    RequestId::Integer(id) => self.requests.reject(*id, &error.error),
                    RequestId::String(_) => false,
                };
                if !rejected {
                    tracing::warn!("error for unknown request id: {}", error.error.message);
                }
            }
            JsonRpcMessage::Request(request) => self.handle_child_request(request).await,
            JsonRpcMessage::Notification(note) => {
                self.handle_notification(&note.method, note.params.unwrap_or(Value::Null))
                    .await;
            }
        }
    }

    async fn handle_child_request(&self, request: JsonRpcRequest) {
        let kind = match request.method.as_str() {
            "item/commandExecution/requestApproval" | "execCommandApproval" => {
                Some(ApprovalKind::Command)
            }
            "item/fileChange/requestApproval" | "applyPatchApproval" => {
                Some(ApprovalKind::FileChange)
            }
            _ => None,
        };
        let Some(kind) = kind else {
            tracing::warn!("unhandled server-initiated request: {}", request.method);
            return;
        };

        let payload = request.params.unwrap_or(Value::Null);
        lock(&self.pending_approvals).insert(
            request.id.clone(),
            PendingApproval {
                request_id: request.id.clone(),
                kind,
                payload: payload.clone(),
                ts: Utc::now(),
            },
        );

        let Some(conversation_id) = self.current_conversation() else {
            return;
        };
        self.emit(
            &conversation_id,
            EventMsg::Approval {
                request_id: request.id,
                kind,
                payload,
            },
        );
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        // Wrapped envelopes carry the real discriminator in msg.type.
        let wrapped = params.get("msg").and_then(|msg| {
            msg.get("type")
                .and_then(Value::as_str)
                .map(|t| (t.to_string(), msg.clone()))
        });
        let (method, params) = match wrapped {
            Some(unwrapped) => unwrapped,
            None => (method.to_string(), params),
        };

        let Some(conversation_id) = self.current_conversation() else {
            tracing::debug!("dropping {method}: no bound conversation");
            return;
        };

        match method.as_str() {
            "turn/started" | "turn_started" => {
                self.on_turn_started(&conversation_id, &params).await;
            }
            "item/started" | "item_started" => {
                self.on_item_started(&conversation_id, &params).await;
            }
            "item/agentMessage/delta" | "agent_message_delta" => {
                self.on_delta(&conversation_id, &params, false);
            }
            "item/reasoning/summaryTextDelta" | "agent_reasoning_delta" => {
                self.on_delta(&conversation_id, &params, true);
            }
            "item/completed" | "item_completed" => {
                self.on_item_completed(&conversation_id, &params).await;
            }
            "turn/diff/updated" | "turn_diff" => {
                self.on_turn_diff(&conversation_id, &params).await;
            }
            "turn/plan/updated" | "plan_update" => {
                self.on_plan(&conversation_id, &params);
            }
            "thread/tokenUsage/updated" | "token_count" => {
                self.on_token_usage(&conversation_id, &params).await;
            }
            "turn/completed" | "turn_completed" => {
                self.on_turn_completed(&conversation_id, &params, false).await;
            }
            "turn/failed" | "turn/errored" | "turn_failed" => {
                self.on_turn_completed(&conversation_id, &params, true).await;
            }
            "error" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                self.emit(
                    &conversation_id,
                    EventMsg::Error {
                        kind: ErrorKind::RpcError,
                        message: message.clone(),
                        request_id: None,
                    },
                );
                self.transcribe(
                    &conversation_id,
                    TranscriptItem::Error {
                        kind: ErrorKind::RpcError,
                        message,
                    },
                )
                .await;
            }
            other => {
                tracing::debug!("ignoring notification {other}");
            }
        }
    }

    async fn on_turn_started(&self, conversation_id: &str, params: &Value) {
        let turn_id = turn_id_of(params);
        lock(&self.turns).insert(turn_id.clone(), TurnState::default());
        self.emit(conversation_id, EventMsg::TurnStarted { turn_id });
    }

    /// The single ingress choke point for user message text: anything that
    /// begins with the meta-envelope prefix is stripped before it can reach
    /// the transcript or a subscriber.
    async fn on_item_started(&self, conversation_id: &str, params: &Value) {
        let item = params.get("item").unwrap_or(params);
        if item_type(item) != "userMessage" {
            return;
        }
        let raw = item.get("text").and_then(Value::as_str).unwrap_or_default();
        let text = match strip_meta_envelope(raw) {
            EnvelopeIngress::Absent => raw.to_string(),
            EnvelopeIngress::Stripped(rest) => rest.to_string(),
            EnvelopeIngress::Malformed => {
                tracing::warn!("user message has envelope prefix but no terminator");
                raw.to_string()
            }
        };
        self.emit(conversation_id, EventMsg::Message { text: text.clone() });
        self.transcribe(conversation_id, TranscriptItem::User { text })
            .await;
    }

    fn on_delta(&self, conversation_id: &str, params: &Value, reasoning: bool) {
        let turn_id = turn_id_of(params);
        let item_id = str_of(params, &["itemId", "item_id"]).unwrap_or_default();
        let delta = str_of(params, &["delta", "text"]).unwrap_or_default();

        let mut turns = lock(&self.turns);
        let turn = turns.entry(turn_id.clone()).or_default();
        if reasoning {
            turn.append_reasoning(&item_id, &delta);
        } else {
            turn.append_assistant(&item_id, &delta);
        }
        drop(turns);

        let msg = if reasoning {
            EventMsg::ReasoningDelta {
                turn_id,
                item_id,
                delta,
            }
        } else {
            EventMsg::AssistantDelta {
                turn_id,
                item_id,
                delta,
            }
        };
        self.emit(conversation_id, msg);
    }

    async fn on_item_completed(&self, conversation_id: &str, params: &Value) {
        let turn_id = turn_id_of(params);
        let item = params.get("item").unwrap_or(params);
        let item_id = item
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match item_type(item) {
            "agentMessage" => {
                let completed = item.get("text").and_then(Value::as_str);
                let (text, first) = {
                    let mut turns = lock(&self.turns);
                    let turn = turns.entry(turn_id.clone()).or_default();
                    let text = turn.take_assistant(&item_id, completed);
                    let first = !turn.assistant_transcribed && !text.is_empty();
                    if first {
                        turn.assistant_transcribed = true;
                    }
                    (text, first)
                };
                if first {
                    self.emit(
                        conversation_id,
                        EventMsg::AssistantFinalize {
                            turn_id: turn_id.clone(),
                            item_id,
                            text: text.clone(),
                        },
                    );
                    self.transcribe(conversation_id, TranscriptItem::Assistant { turn_id, text })
                        .await;
                }
            }
            "reasoning" => {
                let completed = item
                    .get("summary")
                    .and_then(Value::as_str)
                    .or_else(|| item.get("text").and_then(Value::as_str));
                let (text, first) = {
                    let mut turns = lock(&self.turns);
                    let turn = turns.entry(turn_id.clone()).or_default();
                    let text = turn.take_reasoning(&item_id, completed);
                    let first = !turn.reasoning_transcribed && !text.is_empty();
                    if first {
                        turn.reasoning_transcribed = true;
                    }
                    (text, first)
                };
                if first {
                    self.emit(
                        conversation_id,
                        EventMsg::ReasoningFinalize {
                            turn_id: turn_id.clone(),
                            item_id,
                            text: text.clone(),
                        },
                    );
                    self.transcribe(conversation_id, TranscriptItem::Reasoning { turn_id, text })
                        .await;
                }
            }
            "commandExecution" => {
                let command = str_of(item, &["command", "cmd"]).unwrap_or_default();
                let exit_code = item
                    .get("exitCode")
                    .or_else(|| item.get("exit_code"))
                    .and_then(Value::as_i64)
                    .map(|code| code as i32);
                let aggregated_output = str_of(item, &["aggregatedOutput", "aggregated_output"]);
                self.emit(
                    conversation_id,
                    EventMsg::CommandFinalize {
                        turn_id: turn_id.clone(),
                        command: command.clone(),
                        exit_code,
                    },
                );
                self.transcribe(
                    conversation_id,
                    TranscriptItem::Command {
                        turn_id,
                        command,
                        exit_code,
                        aggregated_output,
                    },
                )
                .await;
            }
            "fileChange" => {
                // Item-level short diff: held back in favor of the
                // contextual turn-level diff, flushed at turn end otherwise.
                let Some(diff) = str_of(item, &["diff", "unifiedDiff"]) else {
                    return;
                };
                let signature = diff_signature(&diff);
                let mut turns = lock(&self.turns);
                let turn = turns.entry(turn_id).or_default();
                if !turn.diff_signatures.contains(&signature)
                    && !turn.short_diffs.iter().any(|(sig, _)| sig == &signature)
                {
                    turn.short_diffs.push((signature, diff));
                }
            }
            "mcpToolCall" => {
                let server = str_of(item, &["server"]).unwrap_or_default();
                let tool = str_of(item, &["tool"]).unwrap_or_default();
                let succeeded = item
                    .get("status")
                    .and_then(Value::as_str)
                    .map(|s| s == "completed" || s == "success");
                self.transcribe(
                    conversation_id,
                    TranscriptItem::McpTool {
                        server,
                        tool,
                        succeeded,
                    },
                )
                .await;
            }
            "userMessage" => {
                // Transcribed at item/started; nothing further here. The
                // strip invariant is enforced there.
            }
            other => {
                tracing::debug!("ignoring completed item of type {other}");
            }
        }
    }

    /// Contextual turn-level diff. One canonical rendering per
    /// (turn, signature) is surfaced and transcribed.
    async fn on_turn_diff(&self, conversation_id: &str, params: &Value) {
        let turn_id = turn_id_of(params);
        let Some(diff) = str_of(params, &["diff", "unifiedDiff", "unified_diff"]) else {
            return;
        };
        let signature = diff_signature(&diff);

        let fresh = {
            let mut turns = lock(&self.turns);
            let turn = turns.entry(turn_id.clone()).or_default();
            if turn.diff_signatures.contains(&signature) {
                false
            } else {
                turn.diff_signatures.insert(signature.clone());
                // The contextual rendering supersedes any held short diff.
                turn.short_diffs.retain(|(sig, _)| sig != &signature);
                true
            }
        };
        if !fresh {
            return;
        }

        self.emit(
            conversation_id,
            EventMsg::Diff {
                turn_id: turn_id.clone(),
                signature: signature.clone(),
                diff: diff.clone(),
            },
        );
        self.transcribe(
            conversation_id,
            TranscriptItem::Diff {
                turn_id,
                signature,
                diff,
            },
        )
        .await;
    }

    fn on_plan(&self, conversation_id: &str, params: &Value) {
        let turn_id = turn_id_of(params);
        let steps = params
            .get("plan")
            .or_else(|| params.get("steps"))
            .and_then(|steps| serde_json::from_value::<Vec<PlanStep>>(steps.clone()).ok())
            .unwrap_or_default();

        {
            let mut turns = lock(&self.turns);
            let turn = turns.entry(turn_id.clone()).or_default();
            turn.plan_steps = steps.clone();
        }
        self.emit(conversation_id, EventMsg::Plan { turn_id, steps });
    }

    async fn on_token_usage(&self, conversation_id: &str, params: &Value) {
        let usage = params
            .get("usage")
            .cloned()
            .unwrap_or_else(|| params.clone());
        let usage: TokenUsage = serde_json::from_value(usage).unwrap_or_default();
        self.emit(
            conversation_id,
            EventMsg::TokenCount {
                usage: usage.clone(),
            },
        );
        self.transcribe(conversation_id, TranscriptItem::TokenUsage { usage })
            .await;
    }

    /// Close any streams the child left open, flush held diffs and the plan
    /// snapshot, then drop the turn state.
    async fn on_turn_completed(&self, conversation_id: &str, params: &Value, errored: bool) {
        let turn_id = turn_id_of(params);
        let state = lock(&self.turns).remove(&turn_id);
        if let Some(mut state) = state {
            if !state.assistant_transcribed {
                let leftover: String = state.assistant.drain().map(|(_, text)| text).collect();
                if !leftover.is_empty() {
                    self.emit(
                        conversation_id,
                        EventMsg::AssistantFinalize {
                            turn_id: turn_id.clone(),
                            item_id: String::new(),
                            text: leftover.clone(),
                        },
                    );
                    self.transcribe(
                        conversation_id,
                        TranscriptItem::Assistant {
                            turn_id: turn_id.clone(),
                            text: leftover,
                        },
                    )
                    .await;
                }
            }
            if !state.reasoning_transcribed {
                let leftover: String = state.reasoning.drain().map(|(_, text)| text).collect();
                if !leftover.is_empty() {
                    self.transcribe(
                        conversation_id,
                        TranscriptItem::Reasoning {
                            turn_id: turn_id.clone(),
                            text: leftover,
                        },
                    )
                    .await;
                }
            }

            // Short diffs that no contextual rendering superseded.
            for (signature, diff) in state.short_diffs.drain(..) {
                if state.diff_signatures.contains(&signature) {
                    continue;
                }
                state.diff_signatures.insert(signature.clone());
                self.emit(
                    conversation_id,
                    EventMsg::Diff {
                        turn_id: turn_id.clone(),
                        signature: signature.clone(),
                        diff: diff.clone(),
                    },
                );
                self.transcribe(
                    conversation_id,
                    TranscriptItem::Diff {
                        turn_id: turn_id.clone(),
                        signature,
                        diff,
                    },
                )
                .await;
            }

            if !state.plan_steps.is_empty() {
                self.transcribe(
                    conversation_id,
                    TranscriptItem::Plan {
                        turn_id: turn_id.clone(),
                        steps: state.plan_steps.clone(),
                    },
                )
                .await;
            }
        }

        self.emit(conversation_id, EventMsg::TurnCompleted { turn_id, errored });
    }
}

fn turn_id_of(params: &Value) -> String {
    str_of(params, &["turnId", "turn_id"])
        .or_else(|| {
            params
                .get("turn")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .unwrap_or_default()
}

fn str_of(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn item_type(item: &Value) -> &str {
    item.get("type")
        .or_else(|| item.get("item_type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use fws_protocol::Event;
    use fws_protocol::EventMsg;
    use fws_protocol::FwsErr;
    use fws_protocol::META_ENVELOPE_PREFIX;
    use fws_protocol::META_ENVELOPE_TERMINATOR;
    use fws_protocol::CommandPreview;
    use fws_protocol::CommandSummary;
    use fws_protocol::PendingCmdBuffer;
    use fws_protocol::RequestId;
    use fws_protocol::TranscriptItem;
    use fws_store::ConversationStore;

    use crate::bridge::CodexBridge;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<ConversationStore>,
        bridge: CodexBridge,
        out_rx: mpsc::UnboundedReceiver<String>,
        event_rx: mpsc::UnboundedReceiver<Event>,
        conversation_id: String,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
        let meta = store.create_conversation().await.unwrap();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (bridge, out_rx) = CodexBridge::new_detached(store.clone(), event_tx);
        bridge.bind_conversation(&meta.conversation_id);
        Harness {
            _dir: dir,
            store,
            bridge,
            out_rx,
            event_rx,
            conversation_id: meta.conversation_id,
        }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<EventMsg> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.msg);
        }
        out
    }

    const SHORT_DIFF: &str = "--- a/f.rs\n+++ b/f.rs\n@@ -1 +1 @@\n-a\n+b\n";

    /// The same diff arrives through three paths; exactly one `diff` event
    /// and one transcript entry survive, and they carry the contextual text.
    #[tokio::test]
    async fn diff_dedup_prefers_the_contextual_rendering() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        inner
            .handle_line(r#"{"jsonrpc":"2.0","method":"turn/started","params":{"turnId":"t1"}}"#)
            .await;
        // Item-level short diff.
        let item = json!({
            "jsonrpc": "2.0",
            "method": "item/completed",
            "params": {"turnId": "t1", "item": {"id": "i1", "type": "fileChange", "diff": SHORT_DIFF}}
        });
        inner.handle_line(&item.to_string()).await;
        // Contextual turn-level diff: same signature, noisier text.
        let contextual = format!("diff --git a/f.rs b/f.rs\nindex 111..222 100644\n{SHORT_DIFF}");
        let turn_diff = json!({
            "jsonrpc": "2.0",
            "method": "turn/diff/updated",
            "params": {"turnId": "t1", "diff": contextual}
        });
        inner.handle_line(&turn_diff.to_string()).await;
        // Approval embedding the same diff one more time.
        let approval = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "item/fileChange/requestApproval",
            "params": {"turnId": "t1", "diff": SHORT_DIFF}
        });
        inner.handle_line(&approval.to_string()).await;
        inner
            .handle_line(r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"turnId":"t1"}}"#)
            .await;

        let events = drain_events(&mut h.event_rx);
        let diffs: Vec<&EventMsg> = events
            .iter()
            .filter(|m| matches!(m, EventMsg::Diff { .. }))
            .collect();
        assert_eq!(diffs.len(), 1);
        let EventMsg::Diff { diff, .. } = diffs[0] else {
            unreachable!()
        };
        assert_eq!(diff, &contextual);

        let range = h.store.range(&h.conversation_id, 0, u64::MAX).await.unwrap();
        let transcript_diffs: Vec<_> = range
            .entries
            .iter()
            .filter_map(|e| match &e.item {
                TranscriptItem::Diff { diff, .. } => Some(diff.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(transcript_diffs, vec![contextual]);
    }

    /// Scenario: buffer three completed PTY blocks, send "hi"; the child
    /// sees the sentinel-framed envelope, the transcript and broadcast see
    /// exactly "hi".
    #[tokio::test]
    async fn meta_envelope_round_trip() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        let mut meta = h.store.load_meta(&h.conversation_id).await.unwrap();
        let mut buffer = PendingCmdBuffer::default();
        for i in 0..3 {
            buffer.push(CommandSummary {
                cmd: format!("make step{i}"),
                exit_code: Some(0),
                cwd: "/work".into(),
                block_id: format!("b{i}"),
                ts: i,
                preview: CommandPreview::default(),
            });
        }
        meta.pending_cmd_buffer = Some(buffer);
        h.store
            .save_meta(&h.conversation_id, meta)
            .await
            .unwrap();

        // Answer the outbound turn/start so rpc() can complete.
        let mut out_rx = h.out_rx;
        let responder = tokio::spawn({
            let inner = inner.clone();
            async move {
                let line = out_rx.recv().await.unwrap();
                let frame: serde_json::Value = serde_json::from_str(&line).unwrap();
                let id = frame["id"].clone();
                inner
                    .handle_line(&json!({"jsonrpc": "2.0", "id": id, "result": {}}).to_string())
                    .await;
                frame
            }
        });

        let body = json!({
            "method": "turn/start",
            "params": {"input": [{"type": "text", "text": "hi"}]}
        });
        h.bridge.rpc(body).await.unwrap();
        let frame = responder.await.unwrap();

        let sent_text = frame["params"]["input"][0]["text"].as_str().unwrap();
        assert!(sent_text.starts_with(&format!("{META_ENVELOPE_PREFIX}{{")));
        assert!(sent_text.contains("\"kept\":3"));
        assert!(sent_text.contains("\"dropped\":0"));
        assert!(sent_text.ends_with(&format!("{META_ENVELOPE_TERMINATOR}hi")));

        // Buffer cleared after the flush.
        let meta = h.store.load_meta(&h.conversation_id).await.unwrap();
        assert!(meta.pending_cmd_buffer.is_none());

        // The child echoes the user message back; ingress strips the
        // envelope at the choke point.
        let echo = json!({
            "jsonrpc": "2.0",
            "method": "item/started",
            "params": {"turnId": "t1", "item": {"id": "i0", "type": "userMessage", "text": sent_text}}
        });
        inner.handle_line(&echo.to_string()).await;

        let events = drain_events(&mut h.event_rx);
        let message = events
            .iter()
            .find_map(|m| match m {
                EventMsg::Message { text } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(message, "hi");

        let range = h.store.range(&h.conversation_id, 0, u64::MAX).await.unwrap();
        let user_text = range
            .entries
            .iter()
            .find_map(|e| match &e.item {
                TranscriptItem::User { text } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(user_text, "hi");
    }

    /// Scenario: approval request id 42 → normalized event → decision relayed
    /// verbatim → pending entry retired.
    #[tokio::test]
    async fn approval_handshake_relays_the_decision_verbatim() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        let request = json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "item/fileChange/requestApproval",
            "params": {"changes": ["f.rs"]}
        });
        inner.handle_line(&request.to_string()).await;

        let events = drain_events(&mut h.event_rx);
        let approval = events
            .iter()
            .find_map(|m| match m {
                EventMsg::Approval { request_id, .. } => Some(request_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(approval, RequestId::Integer(42));
        assert_eq!(h.bridge.pending_approval_count(), 1);

        let decision = json!({"id": 42, "result": {"decision": "accept"}});
        h.bridge.rpc(decision.clone()).await.unwrap();

        let written = h.out_rx.recv().await.unwrap();
        assert_eq!(written, serde_json::to_string(&decision).unwrap());
        assert_eq!(h.bridge.pending_approval_count(), 0);

        // A second decision for the same id is stale.
        let err = h
            .bridge
            .rpc(json!({"id": 42, "result": {"decision": "accept"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, FwsErr::ApprovalStale(_)));
    }

    /// Legacy approval names keep working alongside the modern ones.
    #[tokio::test]
    async fn legacy_approval_names_are_accepted() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        for (id, method) in [(1, "execCommandApproval"), (2, "applyPatchApproval")] {
            let line = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": {}});
            inner.handle_line(&line.to_string()).await;
        }
        let events = drain_events(&mut h.event_rx);
        let kinds: Vec<_> = events
            .iter()
            .filter_map(|m| match m {
                EventMsg::Approval { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds.len(), 2);
        assert_eq!(h.bridge.pending_approval_count(), 2);
    }

    /// Deltas assemble into exactly one transcribed assistant entry; deltas
    /// themselves never reach the transcript.
    #[tokio::test]
    async fn deltas_assemble_and_transcribe_once() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        inner
            .handle_line(r#"{"jsonrpc":"2.0","method":"turn/started","params":{"turnId":"t1"}}"#)
            .await;
        for delta in ["Hel", "lo ", "world"] {
            let line = json!({
                "jsonrpc": "2.0",
                "method": "item/agentMessage/delta",
                "params": {"turnId": "t1", "itemId": "i1", "delta": delta}
            });
            inner.handle_line(&line.to_string()).await;
        }
        let completed = json!({
            "jsonrpc": "2.0",
            "method": "item/completed",
            "params": {"turnId": "t1", "item": {"id": "i1", "type": "agentMessage"}}
        });
        inner.handle_line(&completed.to_string()).await;
        inner
            .handle_line(r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"turnId":"t1"}}"#)
            .await;

        let range = h.store.range(&h.conversation_id, 0, u64::MAX).await.unwrap();
        let assistant: Vec<_> = range
            .entries
            .iter()
            .filter_map(|e| match &e.item {
                TranscriptItem::Assistant { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(assistant, vec!["Hello world".to_string()]);

        // Sequence numbers stay dense.
        let nums: Vec<u64> = range.entries.iter().map(|e| e.msg_num).collect();
        let expected: Vec<u64> = (0..nums.len() as u64).collect();
        assert_eq!(nums, expected);

        let events = drain_events(&mut h.event_rx);
        assert!(events.iter().any(|m| matches!(m, EventMsg::TurnCompleted { errored: false, .. })));
        assert_eq!(
            events
                .iter()
                .filter(|m| matches!(m, EventMsg::AssistantDelta { .. }))
                .count(),
            3
        );
    }

    /// A crash fails every in-flight RPC with `child_crashed` and leaves a
    /// status entry in the transcript.
    #[tokio::test]
    async fn crash_fails_outstanding_rpcs() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        let call = tokio::spawn({
            let inner = inner.clone();
            async move { inner.call_raw("thread/list", None).await }
        });
        // Wait for the request to hit the wire, then crash the child.
        let _ = h.out_rx.recv().await.unwrap();
        inner.on_child_exit().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, FwsErr::ChildCrashed));

        let range = h.store.range(&h.conversation_id, 0, u64::MAX).await.unwrap();
        assert!(range.entries.iter().any(|e| matches!(
            &e.item,
            TranscriptItem::Status { status, .. } if status == "child_crashed"
        )));
    }

    /// Malformed envelope (prefix, no terminator): text passes through
    /// untouched.
    #[tokio::test]
    async fn malformed_envelope_is_left_as_is() {
        let mut h = harness().await;
        let inner = h.bridge.inner().clone();

        let broken = format!("{META_ENVELOPE_PREFIX}{{\"v\":1}} no terminator");
        let line = json!({
            "jsonrpc": "2.0",
            "method": "item/started",
            "params": {"turnId": "t1", "item": {"id": "i0", "type": "userMessage", "text": broken}}
        });
        inner.handle_line(&line.to_string()).await;

        let events = drain_events(&mut h.event_rx);
        let message = events
            .iter()
            .find_map(|m| match m {
                EventMsg::Message { text } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(message, broken);
    }
}
