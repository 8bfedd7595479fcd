//! PTY session setup
//!
//! Allocates a PTY pair with the POSIX API, forks, and turns the child into a
//! session leader whose controlling terminal is the subordinate side:
//! - posix_openpt() to open the master
//! - grantpt() / unlockpt() to make the subordinate openable
//! - ptsname() to get the subordinate device path
//! - setsid() + open() in the child to acquire the controlling terminal

use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt, PtyMaster};
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, setsid, ForkResult, Pid};

use super::{SetupError, SetupResult};

/// Child exit status when `setsid` fails
pub const EXIT_SETSID_FAILED: i32 = 121;
/// Child exit status when the subordinate cannot be opened
pub const EXIT_OPEN_FAILED: i32 = 122;
/// Child exit status when the subordinate cannot be bound to stdio
pub const EXIT_DUP_FAILED: i32 = 123;
/// Child exit status when the shell cannot be executed
pub const EXIT_EXEC_FAILED: i32 = 127;

const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Program and argv for the child, prepared before the fork
#[derive(Debug, Clone)]
pub struct ShellCommand {
    program: CString,
    argv: Vec<CString>,
}

impl ShellCommand {
    /// Command running `program` with its file name as argv[0]
    pub fn new(program: &str) -> SetupResult<Self> {
        if program.is_empty() {
            return Err(SetupError::InvalidCommand("empty program path".to_string()));
        }

        let argv0 = Path::new(program)
            .file_name()
            .map(|name| name.as_bytes())
            .unwrap_or(program.as_bytes());

        Ok(Self {
            program: to_cstring(program.as_bytes())?,
            argv: vec![to_cstring(argv0)?],
        })
    }

    /// The plain `/bin/sh` with no arguments
    pub fn default_shell() -> Self {
        Self {
            program: c"/bin/sh".to_owned(),
            argv: vec![c"sh".to_owned()],
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: &str) -> SetupResult<Self> {
        self.argv.push(to_cstring(arg.as_bytes())?);
        Ok(self)
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> SetupResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg.as_ref())?;
        }
        Ok(self)
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::default_shell()
    }
}

fn to_cstring(bytes: &[u8]) -> SetupResult<CString> {
    CString::new(bytes).map_err(|_| {
        SetupError::InvalidCommand(format!(
            "{:?} contains a NUL byte",
            String::from_utf8_lossy(bytes)
        ))
    })
}

/// A freshly allocated, unlocked PTY pair
pub struct PtyPair {
    pub master: PtyMaster,
    pub subordinate: PathBuf,
}

/// Source of PTY pairs
pub trait PtyAllocator {
    fn allocate(&self) -> SetupResult<PtyPair>;
}

/// Allocates through posix_openpt/grantpt/unlockpt/ptsname
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixAllocator;

impl PtyAllocator for PosixAllocator {
    fn allocate(&self) -> SetupResult<PtyPair> {
        let master =
            posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(SetupError::AllocationFailed)?;

        // Children spawned by anyone else must not inherit the master
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(SetupError::AllocationFailed)?;

        grantpt(&master).map_err(SetupError::GrantFailed)?;
        unlockpt(&master).map_err(SetupError::UnlockFailed)?;

        // SAFETY: ptsname is not thread-safe; the returned name is copied
        // into an owned String before anything else can call it again
        let name = unsafe { ptsname(&master) }.map_err(SetupError::NameResolutionFailed)?;

        Ok(PtyPair {
            master,
            subordinate: PathBuf::from(name),
        })
    }
}

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ChildStatus {
    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ChildStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ChildStatus::Signaled(signal)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exited with status {}", code),
            ChildStatus::Signaled(signal) => write!(f, "killed by {}", signal),
        }
    }
}

/// Parent side of a running session: the PTY master and the shell's pid
pub struct PtySession {
    master: PtyMaster,
    child: Pid,
    subordinate: PathBuf,
    status: Option<ChildStatus>,
}

impl PtySession {
    /// Borrow the PTY master descriptor
    pub fn master(&self) -> BorrowedFd<'_> {
        // SAFETY: the master stays open for as long as `self` is borrowed
        unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) }
    }

    pub fn child_pid(&self) -> Pid {
        self.child
    }

    pub fn subordinate_path(&self) -> &Path {
        &self.subordinate
    }

    /// Reap the child if it has exited, without blocking
    pub fn try_wait(&mut self) -> nix::Result<Option<ChildStatus>> {
        if self.status.is_none() {
            self.status = ChildStatus::from_wait(waitpid(self.child, Some(WaitPidFlag::WNOHANG))?);
        }
        Ok(self.status)
    }

    /// Close the master and reap the child
    ///
    /// Closing the master hangs up the subordinate, which is normally enough
    /// for the shell to exit. A child still alive after `grace` is killed.
    pub fn finish(self, grace: Duration) -> nix::Result<ChildStatus> {
        let PtySession {
            master,
            child,
            status,
            ..
        } = self;
        drop(master);

        if let Some(status) = status {
            return Ok(status);
        }

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) =
                ChildStatus::from_wait(waitpid(child, Some(WaitPidFlag::WNOHANG))?)
            {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(REAP_INTERVAL);
        }

        tracing::warn!(pid = child.as_raw(), "Child still running after hang-up, killing it");
        match signal::kill(child, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(e) => return Err(e),
        }

        loop {
            if let Some(status) = ChildStatus::from_wait(waitpid(child, None)?) {
                return Ok(status);
            }
        }
    }
}

/// Allocate a PTY and spawn `shell` on it
pub fn open_session(shell: &ShellCommand) -> SetupResult<PtySession> {
    open_session_with(&PosixAllocator, shell)
}

/// Like [`open_session`], with the PTY pair coming from `allocator`
pub fn open_session_with<A>(allocator: &A, shell: &ShellCommand) -> SetupResult<PtySession>
where
    A: PtyAllocator + ?Sized,
{
    let PtyPair {
        master,
        subordinate,
    } = allocator.allocate()?;

    let subordinate_c = CString::new(subordinate.as_os_str().as_bytes())
        .map_err(|_| SetupError::NameResolutionFailed(Errno::EINVAL))?;

    // Held across the fork so the master never sees a hang-up before the
    // child has opened the subordinate on its own
    let hold = open(
        subordinate_c.as_c_str(),
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(SetupError::SubordinateOpenFailed)?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it
    let hold = unsafe { OwnedFd::from_raw_fd(hold) };

    tracing::debug!(subordinate = %subordinate.display(), "Allocated PTY");

    // SAFETY: the child branch only performs async-signal-safe calls on
    // data prepared before the fork, then execs or exits
    match unsafe { fork() }.map_err(SetupError::ForkFailed)? {
        ForkResult::Child => run_as_child(master, hold, &subordinate_c, shell),
        ForkResult::Parent { child } => {
            drop(hold);
            tracing::info!(pid = child.as_raw(), "Spawned shell");
            Ok(PtySession {
                master,
                child,
                subordinate,
                status: None,
            })
        },
    }
}

/// Child branch of the fork. Never returns.
fn run_as_child(master: PtyMaster, hold: OwnedFd, subordinate: &CStr, shell: &ShellCommand) -> ! {
    // A retained master would keep the relay from ever seeing end-of-file
    drop(master);
    let hold = hold.into_raw_fd();

    if setsid().is_err() {
        child_exit(b"pty-relay: setsid failed\n", EXIT_SETSID_FAILED);
    }

    // Opened by a session leader without a controlling terminal, this open
    // makes the subordinate the controlling terminal
    let fd = match open(subordinate, OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => child_exit(b"pty-relay: cannot open pty subordinate\n", EXIT_OPEN_FAILED),
    };

    // Needed on the BSDs, a no-op where open already did it
    // SAFETY: TIOCSCTTY on a terminal descriptor we own
    unsafe {
        libc::ioctl(fd, libc::TIOCSCTTY as _, 0);
    }

    for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        if dup2(fd, target).is_err() {
            child_exit(b"pty-relay: dup2 failed\n", EXIT_DUP_FAILED);
        }
    }
    close_extra(fd);
    close_extra(hold);

    reset_signals();

    let _ = execvp(shell.program(), shell.argv());
    child_exit(b"pty-relay: exec failed\n", EXIT_EXEC_FAILED)
}

fn close_extra(fd: RawFd) {
    if fd > STDERR_FILENO {
        let _ = close(fd);
    }
}

/// Undo the dispositions and mask inherited from the parent
fn reset_signals() {
    for sig in [
        Signal::SIGCHLD,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGALRM,
        Signal::SIGPIPE,
    ] {
        // SAFETY: installing SIG_DFL runs no handler code
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

fn child_exit(message: &[u8], status: i32) -> ! {
    // SAFETY: fd 2 is either the inherited stderr or the subordinate
    let stderr = unsafe { BorrowedFd::borrow_raw(STDERR_FILENO) };
    let _ = nix::unistd::write(stderr, message);
    // SAFETY: _exit skips atexit handlers and stdio flushing, which must not
    // run in a forked child of a multi-threaded parent
    unsafe { libc::_exit(status) }
}
