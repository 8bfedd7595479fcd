//! Raw mode guard for the invoking terminal

use std::os::fd::BorrowedFd;

use nix::sys::termios::{self, SetArg, Termios};

use super::RelayError;

/// RAII guard for raw terminal mode
///
/// Created by switching the terminal to raw mode; dropping it puts the
/// original attributes back. There is no other way to leave raw mode, so the
/// restore happens exactly once on every exit path.
pub struct TerminalModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    original: Termios,
}

impl<'fd> TerminalModeGuard<'fd> {
    /// Capture the current attributes of `fd` and switch it to raw mode
    ///
    /// On error nothing has been changed and there is nothing to restore.
    pub fn enter_raw(fd: BorrowedFd<'fd>) -> Result<Self, RelayError> {
        let original = termios::tcgetattr(fd).map_err(RelayError::TermiosGetFailed)?;

        // No canonical processing, echo, signal characters or translation
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);

        termios::tcsetattr(fd, SetArg::TCSANOW, &raw).map_err(RelayError::TermiosSetFailed)?;
        tracing::debug!("Invoking terminal switched to raw mode");

        Ok(Self { fd, original })
    }

    /// The attributes that will be restored
    pub fn original(&self) -> &Termios {
        &self.original
    }
}

impl Drop for TerminalModeGuard<'_> {
    fn drop(&mut self) {
        match termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.original) {
            Ok(()) => tracing::debug!("Invoking terminal attributes restored"),
            Err(e) => tracing::warn!("Failed to restore terminal attributes: {}", e),
        }
    }
}
