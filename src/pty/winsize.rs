//! Window size query/update for terminal descriptors

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::libc;

/// Terminal size in character cells
///
/// Pixel dimensions are not tracked; they are always written as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// Get the window size of a terminal descriptor
pub fn get_window_size(fd: BorrowedFd<'_>) -> Result<WindowSize, Errno> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ writes a winsize into the pointed-to struct
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut winsize) };

    if result < 0 {
        Err(Errno::last())
    } else {
        Ok(WindowSize::new(winsize.ws_row, winsize.ws_col))
    }
}

/// Set the window size on a terminal descriptor (usually the PTY master)
pub fn set_window_size(fd: BorrowedFd<'_>, size: WindowSize) -> Result<(), Errno> {
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ only reads the pointed-to struct
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };

    if result < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}
