//! The handoff record passed to a successor through its environment.
//!
//! These variable names and formats are the contract between two builds of
//! the same server; changing them breaks restarts across versions.

use std::env;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::strategy::GRACEFUL_EXIT;

/// Inherited listener descriptor, decimal.
pub const FD_VAR: &str = "REBORN_FD";
/// `"<network>:<address>->"` describing the descriptor.
pub const NAME_VAR: &str = "REBORN_NAME";
/// Successor pid, empty until a successor has been spawned.
pub const PID_VAR: &str = "REBORN_PID";
/// Pid of the process that performed the spawn.
pub const PPID_VAR: &str = "REBORN_PPID";
/// Signal number the successor sends to confirm it is serving.
pub const SIGNAL_VAR: &str = "REBORN_SIGNAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    fd: RawFd,
    name: String,
    successor: Option<Pid>,
    predecessor: Pid,
    handshake: Signal,
}

impl Envelope {
    pub fn new(
        fd: RawFd,
        name: String,
        successor: Option<Pid>,
        predecessor: Pid,
        handshake: Signal,
    ) -> Self {
        Envelope {
            fd,
            name,
            successor,
            predecessor,
            handshake,
        }
    }

    /// Encode `listener` for a process about to be started.
    pub fn for_spawn(
        listener: &Listener,
        successor: Option<Pid>,
        predecessor: Pid,
        handshake: Signal,
    ) -> io::Result<Self> {
        Ok(Envelope::new(
            listener.as_raw_fd(),
            listener.name()?,
            successor,
            predecessor,
            handshake,
        ))
    }

    /// Read the envelope a predecessor left in this process's environment.
    ///
    /// `Ok(None)` means no handoff is in progress: this is a fresh server.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(fd) = lookup(FD_VAR) else {
            return Ok(None);
        };
        let fd: RawFd = fd
            .trim()
            .parse()
            .map_err(|e| Error::malformed(FD_VAR, format!("{fd:?}: {e}")))?;
        if fd < 0 {
            return Err(Error::malformed(FD_VAR, format!("negative descriptor {fd}")));
        }

        let name = lookup(NAME_VAR).ok_or_else(|| Error::malformed(NAME_VAR, "not set"))?;

        let predecessor = lookup(PPID_VAR)
            .ok_or_else(|| Error::malformed(PPID_VAR, "not set"))
            .and_then(|raw| parse_pid(PPID_VAR, &raw))?;

        let successor = match lookup(PID_VAR) {
            Some(raw) if !raw.trim().is_empty() => Some(parse_pid(PID_VAR, &raw)?),
            _ => None,
        };

        let handshake = lookup(SIGNAL_VAR)
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .and_then(|n| Signal::try_from(n).ok())
            .unwrap_or(GRACEFUL_EXIT);

        Ok(Some(Envelope {
            fd,
            name,
            successor,
            predecessor,
            handshake,
        }))
    }

    /// Variables to set in the successor's environment.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (FD_VAR, self.fd.to_string()),
            (NAME_VAR, self.name.clone()),
            (PID_VAR, self.successor.map(|p| p.to_string()).unwrap_or_default()),
            (PPID_VAR, self.predecessor.to_string()),
            (SIGNAL_VAR, (self.handshake as i32).to_string()),
        ]
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> Option<&str> {
        self.name.split_once(':').map(|(network, _)| network)
    }

    pub fn address(&self) -> Option<&str> {
        self.name
            .split_once(':')
            .map(|(_, rest)| rest.strip_suffix("->").unwrap_or(rest))
    }

    pub fn successor(&self) -> Option<Pid> {
        self.successor
    }

    pub fn predecessor(&self) -> Pid {
        self.predecessor
    }

    pub fn handshake(&self) -> Signal {
        self.handshake
    }
}

fn parse_pid(name: &'static str, raw: &str) -> Result<Pid> {
    match raw.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
        Ok(pid) => Err(Error::malformed(name, format!("invalid pid {pid}"))),
        Err(e) => Err(Error::malformed(name, format!("{raw:?}: {e}"))),
    }
}
