//! PTY (Pseudoterminal) handling
//!
//! Allocation of the master/subordinate pair, the fork into a shell that owns
//! the subordinate as its controlling terminal, and the window size ioctls.

mod session;
mod winsize;

pub use session::{
    open_session, open_session_with, ChildStatus, PosixAllocator, PtyAllocator, PtyPair,
    PtySession, ShellCommand, EXIT_DUP_FAILED, EXIT_EXEC_FAILED, EXIT_OPEN_FAILED,
    EXIT_SETSID_FAILED,
};
pub use winsize::{get_window_size, set_window_size, WindowSize};

use nix::errno::Errno;

/// Error type for PTY session setup
///
/// Every variant except `InvalidCommand` carries the errno reported by the
/// failing call. None of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Failed to allocate PTY master: {0}")]
    AllocationFailed(#[source] Errno),

    #[error("Failed to grant PTY access: {0}")]
    GrantFailed(#[source] Errno),

    #[error("Failed to unlock PTY: {0}")]
    UnlockFailed(#[source] Errno),

    #[error("Failed to resolve PTY subordinate name: {0}")]
    NameResolutionFailed(#[source] Errno),

    #[error("Failed to open PTY subordinate: {0}")]
    SubordinateOpenFailed(#[source] Errno),

    #[error("Failed to fork: {0}")]
    ForkFailed(#[source] Errno),

    #[error("Invalid shell command: {0}")]
    InvalidCommand(String),
}

/// Result type for PTY setup
pub type SetupResult<T> = Result<T, SetupError>;
