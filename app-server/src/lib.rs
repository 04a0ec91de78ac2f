//! The service surface: REST actions, WebSocket event streams and the
//! per-conversation event fan-out, wired over the store, the bridges and the
//! agent PTY core.

mod agent_log;
mod error;
mod fanout;
mod routes;
mod state;
mod ws;

pub use error::ApiError;
pub use fanout::EventHub;
pub use state::AppState;
pub use state::ServerConfig;

use std::sync::Arc;

use axum::Router;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        // Conversation CRUD + active pointer.
        .route(
            "/api/appserver/conversations",
            get(routes::list_conversations).post(routes::create_conversation),
        )
        .route(
            "/api/appserver/conversations/{id}",
            delete(routes::delete_conversation),
        )
        .route("/api/appserver/conversations/select", post(routes::select))
        .route(
            "/api/appserver/conversation",
            get(routes::active_meta).post(routes::update_active_meta),
        )
        // Transcript.
        .route("/api/appserver/transcript/range", get(routes::transcript_range))
        .route(
            "/api/appserver/transcript/append",
            post(routes::transcript_append),
        )
        // Child agent lifecycle + passthrough.
        .route("/api/appserver/rpc", post(routes::rpc_passthrough))
        .route("/api/appserver/start", post(routes::start_child))
        .route("/api/appserver/stop", post(routes::stop_child))
        .route("/api/appserver/status", get(routes::child_status))
        .route("/api/appserver/interrupt", post(routes::interrupt))
        .route(
            "/api/appserver/approval_record",
            post(routes::approval_record),
        )
        // Agent PTY.
        .route("/api/mcp/agent-pty/exec", post(routes::pty_exec))
        .route(
            "/api/mcp/agent-pty/exec_interactive",
            post(routes::pty_exec_interactive),
        )
        .route("/api/mcp/agent-pty/send", post(routes::pty_send))
        .route("/api/mcp/agent-pty/wait_for", post(routes::pty_wait_for))
        .route("/api/mcp/agent-pty/expect_send", post(routes::pty_expect_send))
        .route("/api/mcp/agent-pty/read_spool", post(routes::pty_read_spool))
        .route("/api/mcp/agent-pty/read_raw", post(routes::pty_read_raw))
        .route("/api/mcp/agent-pty/read_screen", get(routes::pty_read_screen))
        .route(
            "/api/mcp/agent-pty/read_screen_deltas",
            get(routes::pty_read_screen_deltas),
        )
        .route("/api/mcp/agent-pty/status", get(routes::pty_status))
        .route("/api/mcp/agent-pty/end_session", post(routes::pty_end_session))
        .route("/api/mcp/agent-pty/reset", post(routes::pty_reset))
        // Block queries.
        .route("/api/mcp/agent-pty/blocks/since", get(routes::blocks_since))
        .route("/api/mcp/agent-pty/blocks/{block_id}", get(routes::blocks_get))
        .route(
            "/api/mcp/agent-pty/blocks/{block_id}/read",
            get(routes::blocks_read),
        )
        .route("/api/mcp/agent-pty/blocks/search", get(routes::blocks_search))
        // Filesystem helpers.
        .route("/api/fs/list", get(routes::fs_list))
        .route("/api/search/files", get(routes::search_files))
        // Agent log message board.
        .route(
            "/api/messages",
            get(agent_log::get_messages).post(agent_log::post_message),
        )
        // WebSockets.
        .route("/ws/appserver", get(ws::appserver_ws))
        .route("/ws/pty/{conversation_id}", get(ws::pty_ws))
        .with_state(state)
        .layer(cors)
}
