use serde::Deserialize;
use serde::Serialize;

/// `app_server_config.json`: the process-wide active pointer. Persisted so a
/// restart restores the prior active view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_view: Option<String>,
}
