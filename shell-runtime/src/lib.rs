//! Uniform spawn/subscribe/write/terminate over pipe and PTY backends.
//!
//! Every child process owned by the service goes through this crate: the
//! agent bridge uses the pipe backend, the agent PTY core uses the PTY
//! backend. Subscribers receive every byte from subscription forward via a
//! broadcast channel; a closed channel is the terminal eof signal.

mod pipe;
mod pty;
mod registry;
mod secret;
mod spec;

pub use registry::ShellId;
pub use registry::ShellRuntime;
pub use registry::ShellStatus;
pub use secret::RuntimeDir;
pub use secret::resolve_runtime_dir;
pub use spec::ShellSpec;
