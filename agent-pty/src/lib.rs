//! Per-conversation agent PTY: deterministic block boundaries, an append-only
//! normalized spool, a rendered screen model, an awaitable cursor-based
//! `wait_for` and a queryable block store.
//!
//! The managed shell is a bash owned entirely by this crate (its rcfile is
//! generated here), which makes the marker stream robust to user rc
//! customizations. Raw bytes are preserved losslessly in `output.raw`; the
//! normalized spool is LF-only with marker lines stripped.

mod block_store;
mod hook;
mod screen;
mod session;
mod spool;
mod wait;

pub use block_store::BlockSearchHit;
pub use block_store::replay_blocks;
pub use screen::ScreenSnapshot;
pub use session::AgentPty;
pub use session::ExecReceipt;
pub use session::PtyConfig;
pub use session::PtyMode;
pub use session::PtyStatus;
pub use wait::MatchSpan;
pub use wait::MatchSpec;
pub use wait::WaitResult;
