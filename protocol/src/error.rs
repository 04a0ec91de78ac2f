use serde::Deserialize;
use serde::Serialize;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FwsErr>;

/// Stable machine-readable failure kinds. These are the `error.kind` strings
/// surfaced over REST and WebSocket; renaming one is a breaking wire change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    Busy,
    ModeInteractive,
    Timeout,
    RpcTimeout,
    RpcError,
    ChildCrashed,
    ShellGone,
    ImmutableThreadId,
    ApprovalStale,
    InitializeFailed,
    EnvelopeMalformed,
    NotFound,
    Io,
}

#[derive(Error, Debug)]
pub enum FwsErr {
    #[error("invalid request: {0}")]
    Validation(String),

    /// A block is already running on this PTY.
    #[error("a command is already running")]
    Busy,

    /// `exec_block` was called while an interactive session is active.
    #[error("session is in interactive mode")]
    ModeInteractive,

    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// An outbound RPC's single-shot response slot expired.
    #[error("rpc timed out: {0}")]
    RpcTimeout(String),

    /// The child answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("child process crashed")]
    ChildCrashed,

    /// Write/send attempted on a terminated backend.
    #[error("shell is gone")]
    ShellGone,

    /// Meta write attempted to overwrite a bound thread id.
    #[error("thread_id is already bound and cannot change")]
    ImmutableThreadId,

    /// Approval decision arrived after the child gave up on the request.
    #[error("approval response for {0} is stale")]
    ApprovalStale(String),

    #[error("initialize failed: {0}")]
    InitializeFailed(String),

    #[error("meta envelope prefix without terminator")]
    EnvelopeMalformed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FwsErr {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FwsErr::Validation(_) => ErrorKind::ValidationError,
            FwsErr::Busy => ErrorKind::Busy,
            FwsErr::ModeInteractive => ErrorKind::ModeInteractive,
            FwsErr::Timeout(_) => ErrorKind::Timeout,
            FwsErr::RpcTimeout(_) => ErrorKind::RpcTimeout,
            FwsErr::Rpc { .. } => ErrorKind::RpcError,
            FwsErr::ChildCrashed => ErrorKind::ChildCrashed,
            FwsErr::ShellGone => ErrorKind::ShellGone,
            FwsErr::ImmutableThreadId => ErrorKind::ImmutableThreadId,
            FwsErr::ApprovalStale(_) => ErrorKind::ApprovalStale,
            FwsErr::InitializeFailed(_) => ErrorKind::InitializeFailed,
            FwsErr::EnvelopeMalformed => ErrorKind::EnvelopeMalformed,
            FwsErr::NotFound(_) => ErrorKind::NotFound,
            FwsErr::Io(_) => ErrorKind::Io,
            FwsErr::Json(_) => ErrorKind::ValidationError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kinds_serialize_to_stable_snake_case() {
        let kinds = [
            (ErrorKind::RpcTimeout, "rpc_timeout"),
            (ErrorKind::ImmutableThreadId, "immutable_thread_id"),
            (ErrorKind::ModeInteractive, "mode_interactive"),
            (ErrorKind::EnvelopeMalformed, "envelope_malformed"),
        ];
        for (kind, wire) in kinds {
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{wire}\""));
            assert_eq!(kind.to_string(), wire);
        }
    }

    #[test]
    fn err_maps_to_kind() {
        assert_eq!(FwsErr::Busy.kind(), ErrorKind::Busy);
        assert_eq!(
            FwsErr::Rpc {
                code: -32000,
                message: "boom".into()
            }
            .kind(),
            ErrorKind::RpcError
        );
    }
}
