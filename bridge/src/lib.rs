//! Bridges between the service and long-running coding-agent children
//! speaking line-delimited JSON-RPC over stdio.
//!
//! Two protocol variants share the plumbing: the codex-style app-server
//! protocol (`thread/*`, `turn/*`, `item/*`) and the Agent Client Protocol
//! (`session/*`). Raw child traffic is translated into the normalized event
//! stream, finalized items are transcribed, approval round-trips are relayed
//! and per-conversation settings are injected from the SSOT meta.

mod acp;
mod bridge;
mod diff;
mod outgoing;
mod router;
mod settings;
mod turn;

pub use acp::AcpBridge;
pub use acp::AcpConfig;
pub use bridge::BridgeConfig;
pub use bridge::ChildState;
pub use bridge::CodexBridge;
pub use diff::diff_signature;
