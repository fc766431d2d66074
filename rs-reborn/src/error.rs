use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Errors returned by the handoff, spawn, kill and coordination operations.
///
/// Every restart failure leaves the calling process as the sole owner of the
/// listening socket.
#[derive(Debug, Error)]
pub enum Error {
    /// A handoff variable is absent or cannot be parsed.
    #[error("handoff variable {name} is missing or malformed: {reason}")]
    EnvironmentMissingOrMalformed { name: &'static str, reason: String },

    /// The socket is neither a listening TCP socket nor a listening unix socket.
    #[error("unsupported listener type: {0}")]
    UnsupportedListenerType(String),

    /// The inherited descriptor does not hold the kind of listener the envelope describes.
    #[error("inherited descriptor {fd} does not match {name:?}: {reason}")]
    TypeMismatch {
        fd: RawFd,
        name: String,
        reason: String,
    },

    /// The running executable could not be found or is no longer accessible.
    #[error("cannot resolve the current executable: {0}")]
    ExecutableResolution(#[source] io::Error),

    /// The OS refused to start the successor.
    #[error("failed to start successor process: {0}")]
    ProcessStart(#[source] io::Error),

    /// The successor did not send its handshake signal in time and was killed.
    #[error("successor {pid} did not confirm within {timeout:?}")]
    HandshakeTimeout { pid: Pid, timeout: Duration },

    /// In-place re-exec requested by a process that is itself a spawned successor.
    #[error("refusing to re-exec: parent {0} is the recorded predecessor")]
    SelfReexecGuard(Pid),

    /// Neither a successor nor a predecessor pid is known.
    #[error("no process id recorded to signal")]
    NoTargetPid,

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn malformed(name: &'static str, reason: impl Into<String>) -> Self {
        Error::EnvironmentMissingOrMalformed {
            name,
            reason: reason.into(),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Io(io::Error::from(errno))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
