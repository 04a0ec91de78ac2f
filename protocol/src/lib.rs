//! Shared wire and domain types for the framework-shells bridge.
//!
//! Everything that crosses a process or task boundary lives here: the
//! line-delimited JSON-RPC frames spoken with child agents, the normalized
//! event stream fanned out to subscribers, the curated transcript entries,
//! the per-conversation SSOT meta, PTY block records, the terminal marker
//! grammar and the command-context envelope sentinels.

mod blocks;
mod envelope;
mod error;
mod events;
mod jsonrpc;
mod markers;
mod meta;
mod transcript;

pub use blocks::BlockEvent;
pub use blocks::BlockMeta;
pub use blocks::BlockStatus;
pub use envelope::CmdContextEnvelope;
pub use envelope::EnvelopeIngress;
pub use envelope::META_ENVELOPE_PREFIX;
pub use envelope::META_ENVELOPE_TERMINATOR;
pub use envelope::strip_meta_envelope;
pub use error::ErrorKind;
pub use error::FwsErr;
pub use error::Result;
pub use events::ApprovalKind;
pub use events::Event;
pub use events::EventMsg;
pub use events::PlanStep;
pub use events::PlanStepStatus;
pub use events::ScreenCursor;
pub use events::ScreenRowUpdate;
pub use events::TokenUsage;
pub use jsonrpc::JSONRPC_VERSION;
pub use jsonrpc::JsonRpcError;
pub use jsonrpc::JsonRpcErrorDetail;
pub use jsonrpc::JsonRpcMessage;
pub use jsonrpc::JsonRpcNotification;
pub use jsonrpc::JsonRpcRequest;
pub use jsonrpc::JsonRpcResponse;
pub use jsonrpc::RequestId;
pub use markers::MARKER_BLOCK_BEGIN;
pub use markers::MARKER_BLOCK_END;
pub use markers::MARKER_PROMPT;
pub use markers::Marker;
pub use meta::CommandPreview;
pub use meta::CommandSummary;
pub use meta::ConversationMeta;
pub use meta::ConversationSettings;
pub use meta::ConversationStatus;
pub use meta::PendingCmdBuffer;
pub use transcript::TranscriptEntry;
pub use transcript::TranscriptItem;
