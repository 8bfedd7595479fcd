//! Application driver
//!
//! Opens the session, relays the process's own stdin/stdout to it and turns
//! the outcome into an exit status.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::process::ExitCode;

use crate::config::Config;
use crate::pty::{self, open_session, PtySession, WindowSize};
use crate::relay::{run_relay, RelayResult};

/// Spawn the configured shell and relay to it until it goes away
pub fn run(config: &Config) -> ExitCode {
    let shell = match config.shell_command() {
        Ok(shell) => shell,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        },
    };

    let session = match open_session(&shell) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("PTY setup failed: {}", e);
            return ExitCode::FAILURE;
        },
    };

    run_as_parent(session, config)
}

/// Parent side of the fork: relay, reap the child, report
pub fn run_as_parent(session: PtySession, config: &Config) -> ExitCode {
    let stdin = io::stdin();
    let stdout = io::stdout();

    if config.inherit_window_size {
        if let Some(size) = inherit_window_size(stdout.as_fd(), session.master()) {
            tracing::debug!("PTY size set to {}x{}", size.cols, size.rows);
        }
    }

    let result = run_relay(
        stdin.as_fd(),
        stdout.as_fd(),
        session.master(),
        config.write_policy,
    );

    match session.finish(config.hangup_grace()) {
        Ok(status) => tracing::info!("Shell {}", status),
        Err(e) => tracing::warn!("Failed to reap shell: {}", e),
    }

    log_outcome(&result);
    if ended_normally(&result) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn log_outcome(result: &RelayResult) {
    match result {
        Ok(end) => tracing::debug!("Relay finished: {:?}", end),
        Err(e) if e.is_hangup() => tracing::debug!("Relay finished: {}", e),
        Err(e) => tracing::error!("Relay failed: {}", e),
    }
}

/// Copy the window size of `terminal` onto `master`
///
/// Returns the size that was applied, or None when either side is not a
/// terminal or the ioctl failed.
pub fn inherit_window_size(terminal: BorrowedFd<'_>, master: BorrowedFd<'_>) -> Option<WindowSize> {
    let size = match pty::get_window_size(terminal) {
        Ok(size) if size.rows > 0 && size.cols > 0 => size,
        Ok(_) => return None,
        Err(e) => {
            tracing::debug!("Not inheriting window size: {}", e);
            return None;
        },
    };

    match pty::set_window_size(master, size) {
        Ok(()) => Some(size),
        Err(e) => {
            tracing::debug!("Failed to set PTY window size: {}", e);
            None
        },
    }
}

/// Whether a relay outcome counts as a successful session
///
/// End-of-file and hang-ups are how sessions normally end. Terminal mode
/// failures and genuine I/O errors are not.
pub fn ended_normally(result: &RelayResult) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => e.is_hangup(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Endpoint, RelayEnd, RelayError};
    use nix::errno::Errno;
    use nix::pty::openpty;

    #[test]
    fn test_end_of_file_is_success() {
        assert!(ended_normally(&Ok(RelayEnd::EndOfFile(Endpoint::Terminal))));
        assert!(ended_normally(&Ok(RelayEnd::EndOfFile(Endpoint::Master))));
    }

    #[test]
    fn test_hangup_is_success() {
        assert!(ended_normally(&Err(RelayError::DescriptorClosed(Endpoint::Master))));
        assert!(ended_normally(&Err(RelayError::ReadFailed {
            endpoint: Endpoint::Master,
            errno: Errno::EIO,
        })));
    }

    #[test]
    fn test_failures_are_failures() {
        assert!(!ended_normally(&Err(RelayError::TermiosGetFailed(Errno::ENOTTY))));
        assert!(!ended_normally(&Err(RelayError::TermiosSetFailed(Errno::EINVAL))));
        assert!(!ended_normally(&Err(RelayError::PollFailed(Errno::ENOMEM))));
        assert!(!ended_normally(&Err(RelayError::WriteFailed {
            endpoint: Endpoint::Terminal,
            errno: Errno::EBADF,
        })));
    }

    #[test]
    fn test_inherit_window_size() {
        let terminal = openpty(None, None).expect("Failed to open pty pair");
        let child = openpty(None, None).expect("Failed to open pty pair");

        pty::set_window_size(terminal.master.as_fd(), WindowSize::new(50, 132))
            .expect("Failed to set size");

        let applied = inherit_window_size(terminal.slave.as_fd(), child.master.as_fd());
        assert_eq!(applied, Some(WindowSize::new(50, 132)));
        assert_eq!(
            pty::get_window_size(child.slave.as_fd()),
            Ok(WindowSize::new(50, 132))
        );
    }

    #[test]
    fn test_inherit_window_size_from_non_terminal() {
        let child = openpty(None, None).expect("Failed to open pty pair");
        let file = tempfile::tempfile().expect("Failed to create temp file");
        assert_eq!(inherit_window_size(file.as_fd(), child.master.as_fd()), None);
    }
}
