//! Conversation store: per-conversation SSOT meta, curated transcript and
//! the process-wide active-conversation pointer.
//!
//! Layout under `<cache_root>/app_server/`:
//!
//! ```text
//! app_server_config.json                # active conversation id, active view
//! conversations/<conversation_id>/
//!   conversation_meta.json              # SSOT
//!   transcript.jsonl                    # curated entries
//!   agent_pty/…                         # owned by fws-agent-pty
//! ```
//!
//! A conversation directory is exclusively owned by this process; meta writes
//! are atomic (temp + rename) and serialize through a per-conversation lock.

mod config;
mod paths;
mod store;
mod transcript;

pub use config::AppServerConfig;
pub use paths::default_cache_root;
pub use store::ConversationStore;
pub use transcript::TranscriptRange;
