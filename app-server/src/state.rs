use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use fws_agent_pty::AgentPty;
use fws_agent_pty::PtyConfig;
use fws_bridge::AcpBridge;
use fws_bridge::AcpConfig;
use fws_bridge::BridgeConfig;
use fws_bridge::CodexBridge;
use fws_protocol::CommandSummary;
use fws_protocol::FwsErr;
use fws_protocol::PendingCmdBuffer;
use fws_protocol::Result;
use fws_protocol::TranscriptItem;
use fws_shell_runtime::RuntimeDir;
use fws_shell_runtime::ShellRuntime;
use fws_store::ConversationStore;

use crate::agent_log::AgentLog;
use crate::fanout::EventHub;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cache_root: PathBuf,
    pub install_root: PathBuf,
    pub codex_argv: Vec<String>,
    pub acp_argv: Option<Vec<String>>,
    pub acp_eager_session_init: bool,
}

pub struct AppState {
    pub store: Arc<ConversationStore>,
    pub runtime: ShellRuntime,
    pub runtime_dir: RuntimeDir,
    pub bridge: CodexBridge,
    pub acp: Option<AcpBridge>,
    pub hub: EventHub,
    pub agent_log: AgentLog,
    ptys: Mutex<HashMap<String, AgentPty>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let runtime_dir =
            fws_shell_runtime::resolve_runtime_dir(&config.cache_root, &config.install_root)?;
        let store = Arc::new(ConversationStore::new(&config.cache_root)?);
        let runtime = ShellRuntime::new();
        let hub = EventHub::new();

        let (bridge_events, bridge_rx) = mpsc::unbounded_channel();
        hub.spawn_router(bridge_rx);
        let bridge = CodexBridge::new(
            store.clone(),
            runtime.clone(),
            BridgeConfig {
                child_argv: config.codex_argv.clone(),
            },
            bridge_events,
        );

        let acp = config.acp_argv.as_ref().map(|argv| {
            let (acp_events, acp_rx) = mpsc::unbounded_channel();
            hub.spawn_router(acp_rx);
            AcpBridge::new(
                store.clone(),
                runtime.clone(),
                AcpConfig {
                    child_argv: argv.clone(),
                    eager_session_init: config.acp_eager_session_init,
                },
                acp_events,
            )
        });

        let agent_log = AgentLog::new(store.root().join("agent_chat.log.jsonl"));

        Ok(Arc::new(Self {
            store,
            runtime,
            runtime_dir,
            bridge,
            acp,
            hub,
            agent_log,
            ptys: Mutex::new(HashMap::new()),
        }))
    }

    /// The conversation a request targets: an explicit id, else the active
    /// pointer.
    pub async fn resolve_conversation(&self, explicit: Option<String>) -> Result<String> {
        if let Some(id) = explicit {
            return Ok(id);
        }
        let config = self.store.load_config().await?;
        config
            .active_conversation_id
            .ok_or_else(|| FwsErr::Validation("no active conversation".to_string()))
    }

    /// Get or create the PTY subsystem for a conversation. The first call
    /// also wires up the block-summary consumer that feeds the envelope
    /// buffer and the shell_output transcript entries.
    pub async fn pty(&self, conversation_id: &str) -> Result<AgentPty> {
        let mut ptys = self.ptys.lock().await;
        if let Some(existing) = ptys.get(conversation_id) {
            return Ok(existing.clone());
        }

        self.store.load_meta(conversation_id).await?;
        let (summary_tx, summary_rx) = mpsc::unbounded_channel();
        let mut config = PtyConfig::new(
            conversation_id,
            self.store.agent_pty_dir(conversation_id),
        );
        config.events = Some(self.hub.sender(conversation_id));
        config.summaries = Some(summary_tx);

        let pty = AgentPty::open(self.runtime.clone(), config)?;
        ptys.insert(conversation_id.to_string(), pty.clone());
        drop(ptys);

        spawn_summary_consumer(self.store.clone(), conversation_id.to_string(), summary_rx);
        Ok(pty)
    }
}

/// Every finalized user-PTY block lands in `meta.pending_cmd_buffer` (cap 10,
/// oldest dropped) and as a `shell_output` transcript entry.
fn spawn_summary_consumer(
    store: Arc<ConversationStore>,
    conversation_id: String,
    mut rx: mpsc::UnboundedReceiver<CommandSummary>,
) {
    tokio::spawn(async move {
        while let Some(summary) = rx.recv().await {
            let preview_text = summary.preview.lines.join("\n");
            match store.load_meta(&conversation_id).await {
                Ok(mut meta) => {
                    meta.pending_cmd_buffer
                        .get_or_insert_with(PendingCmdBuffer::default)
                        .push(summary.clone());
                    if let Err(e) = store.save_meta(&conversation_id, meta).await {
                        tracing::warn!("pending_cmd_buffer save failed: {e}");
                    }
                }
                Err(e) => tracing::warn!("meta load failed for block summary: {e}"),
            }
            if let Err(e) = store
                .append_transcript(
                    &conversation_id,
                    TranscriptItem::ShellOutput {
                        block_id: Some(summary.block_id.clone()),
                        text: preview_text,
                    },
                )
                .await
            {
                tracing::warn!("shell_output transcript append failed: {e}");
            }
        }
    });
}
