//! Terminal relay loop
//!
//! Shuttles bytes between the invoking terminal and the PTY master with a
//! single-threaded `poll` loop over exactly two descriptors. At most one
//! buffer's worth of data moves per wake-up, input side first.

mod mode;

pub use mode::TerminalModeGuard;

use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};
use serde::{Deserialize, Serialize};

/// Capacity of the relay buffer in bytes
pub const RELAY_BUFFER_SIZE: usize = 512;

/// One side of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The invoking terminal (input and output descriptors)
    Terminal,
    /// The PTY master
    Master,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Terminal => write!(f, "invoking terminal"),
            Endpoint::Master => write!(f, "PTY master"),
        }
    }
}

/// What to do when a write accepts fewer bytes than were read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// One write per chunk; a short write drops the remainder
    #[default]
    BestEffort,
    /// Keep writing until the whole chunk is delivered
    WriteAll,
}

impl WritePolicy {
    /// Parse a policy name as used in config files and on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "best-effort" | "besteffort" => Some(WritePolicy::BestEffort),
            "write-all" | "writeall" => Some(WritePolicy::WriteAll),
            _ => None,
        }
    }
}

/// Successful end of relaying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// A read returned zero bytes
    EndOfFile(Endpoint),
}

/// Error type for the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to get terminal attributes: {0}")]
    TermiosGetFailed(#[source] Errno),

    #[error("Failed to set terminal attributes: {0}")]
    TermiosSetFailed(#[source] Errno),

    #[error("Failed to poll: {0}")]
    PollFailed(#[source] Errno),

    #[error("Failed to read from {endpoint}: {errno}")]
    ReadFailed {
        endpoint: Endpoint,
        #[source]
        errno: Errno,
    },

    #[error("Failed to write to {endpoint}: {errno}")]
    WriteFailed {
        endpoint: Endpoint,
        #[source]
        errno: Errno,
    },

    #[error("{0} reported hang-up or error without data")]
    DescriptorClosed(Endpoint),
}

impl RelayError {
    /// True when the error is the other side going away rather than a failure
    ///
    /// Linux reports reads from a master whose subordinate has been closed
    /// as `EIO`.
    pub fn is_hangup(&self) -> bool {
        matches!(
            self,
            RelayError::DescriptorClosed(_)
                | RelayError::ReadFailed {
                    endpoint: Endpoint::Master,
                    errno: Errno::EIO,
                }
        )
    }
}

/// Result of a relay session
pub type RelayResult = Result<RelayEnd, RelayError>;

/// Fixed-size transfer buffer, reused for every read/write cycle
pub struct RelayBuffer {
    bytes: [u8; RELAY_BUFFER_SIZE],
}

enum Transfer {
    Relayed(usize),
    EndOfFile,
    Interrupted,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self {
            bytes: [0; RELAY_BUFFER_SIZE],
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// One read from `from`, then write whatever arrived to `to`
    fn transfer(
        &mut self,
        from: BorrowedFd<'_>,
        source: Endpoint,
        to: BorrowedFd<'_>,
        destination: Endpoint,
        policy: WritePolicy,
    ) -> Result<Transfer, RelayError> {
        let n = match read(from.as_raw_fd(), &mut self.bytes) {
            Ok(0) => return Ok(Transfer::EndOfFile),
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(Transfer::Interrupted),
            Err(errno) => {
                return Err(RelayError::ReadFailed {
                    endpoint: source,
                    errno,
                })
            },
        };

        write_chunk(to, destination, &self.bytes[..n], policy)?;
        Ok(Transfer::Relayed(n))
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn write_chunk(
    to: BorrowedFd<'_>,
    destination: Endpoint,
    chunk: &[u8],
    policy: WritePolicy,
) -> Result<(), RelayError> {
    let failed = |errno: Errno| RelayError::WriteFailed {
        endpoint: destination,
        errno,
    };

    match policy {
        WritePolicy::BestEffort => match write(to, chunk) {
            Ok(n) if n < chunk.len() => {
                tracing::debug!(
                    "Short write to {}: dropped {} of {} bytes",
                    destination,
                    chunk.len() - n,
                    chunk.len()
                );
                Ok(())
            },
            Ok(_) => Ok(()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {
                tracing::warn!("Write to {} interrupted, dropped {} bytes", destination, chunk.len());
                Ok(())
            },
            Err(errno) => Err(failed(errno)),
        },
        WritePolicy::WriteAll => {
            let mut rest = chunk;
            while !rest.is_empty() {
                match write(to, rest) {
                    Ok(0) => return Err(failed(Errno::EIO)),
                    Ok(n) => rest = &rest[n..],
                    Err(Errno::EINTR) => {},
                    Err(Errno::EAGAIN) => wait_writable(to)?,
                    Err(errno) => return Err(failed(errno)),
                }
            }
            Ok(())
        },
    }
}

fn wait_writable(fd: BorrowedFd<'_>) -> Result<(), RelayError> {
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(RelayError::PollFailed(errno)),
        }
    }
}

/// Relay between the invoking terminal and the PTY master in raw mode
///
/// The terminal behind `input` is switched to raw mode for the duration of
/// the loop and restored afterwards however the loop ends.
pub fn run_relay(
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
    master: BorrowedFd<'_>,
    policy: WritePolicy,
) -> RelayResult {
    let _guard = TerminalModeGuard::enter_raw(input)?;
    relay_loop(input, output, master, policy)
}

/// The relay loop proper, without touching terminal attributes
///
/// Blocks until one of the descriptors is ready. Returns on end-of-file from
/// either side, on a hang-up reported without data, or on the first I/O
/// error.
pub fn relay_loop(
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
    master: BorrowedFd<'_>,
    policy: WritePolicy,
) -> RelayResult {
    let mut buffer = RelayBuffer::new();

    loop {
        let mut fds = [
            PollFd::new(input, PollFlags::POLLIN),
            PollFd::new(master, PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {},
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(RelayError::PollFailed(errno)),
        }

        let input_events = fds[0].revents().unwrap_or(PollFlags::empty());
        let master_events = fds[1].revents().unwrap_or(PollFlags::empty());

        let (from, source, to, destination) = if input_events.contains(PollFlags::POLLIN) {
            (input, Endpoint::Terminal, master, Endpoint::Master)
        } else if master_events.contains(PollFlags::POLLIN) {
            (master, Endpoint::Master, output, Endpoint::Terminal)
        } else {
            let closed = PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
            let endpoint = if master_events.intersects(closed) {
                Endpoint::Master
            } else {
                Endpoint::Terminal
            };
            tracing::debug!(
                ?input_events,
                ?master_events,
                "{} closed without pending data",
                endpoint
            );
            return Err(RelayError::DescriptorClosed(endpoint));
        };

        match buffer.transfer(from, source, to, destination, policy)? {
            Transfer::Relayed(n) => tracing::trace!("Relayed {} bytes from {}", n, source),
            Transfer::EndOfFile => {
                tracing::debug!("End of file on {}", source);
                return Ok(RelayEnd::EndOfFile(source));
            },
            Transfer::Interrupted => {},
        }
    }
}
