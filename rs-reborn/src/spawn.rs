//! Starting a successor: either a new child process or the current image
//! re-executed in place.

use std::env;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{info, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{getppid, Pid};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::handoff::Handoff;
use crate::listener::Listener;
use crate::strategy::GRACEFUL_EXIT;

/// Absolute path of the running binary, verified to still exist.
///
/// A binary that was moved or deleted since startup is refused rather than
/// restarting whatever now lives at the old path.
pub fn current_executable() -> Result<PathBuf> {
    let exe = env::current_exe().map_err(Error::ExecutableResolution)?;
    fs::metadata(&exe).map_err(Error::ExecutableResolution)?;
    Ok(exe)
}

/// Build a command re-running this program with its own arguments, working
/// directory and environment plus the envelope. Only stdio and the listener
/// descriptor survive into the new image.
fn restart_command(exe: &Path, listener: &Listener, envelope: &Envelope) -> Result<Command> {
    let cwd = env::current_dir()?;
    let mut args = env::args_os();

    let mut command = Command::new(exe);
    if let Some(arg0) = args.next() {
        command.arg0(arg0);
    }
    command
        .args(args)
        .current_dir(cwd)
        .envs(envelope.vars())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let fd = listener.as_raw_fd();
    // SAFETY: the hook only calls fcntl(2), which is async-signal-safe.
    unsafe {
        command.pre_exec(move || set_cloexec(fd, false));
    }
    Ok(command)
}

fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = if cloexec {
        FdFlag::FD_CLOEXEC
    } else {
        FdFlag::empty()
    };
    fcntl(fd, FcntlArg::F_SETFD(flags))
        .map(drop)
        .map_err(io::Error::from)
}

/// Replacement of the current image, prepared but not yet performed.
#[derive(Debug)]
pub struct Reexec {
    exe: PathBuf,
    envelope: Envelope,
    command: Command,
}

impl Reexec {
    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Replace the process image. Returns only if that failed.
    pub fn exec(mut self) -> Error {
        info!("re-executing {}", self.exe.display());
        let err = self.command.exec();
        if let Err(e) = set_cloexec(self.envelope.fd(), true) {
            warn!("could not restore close-on-exec on fd {}: {e}", self.envelope.fd());
        }
        Error::ProcessStart(err)
    }
}

impl Handoff {
    /// Start a successor process that inherits `listener`.
    ///
    /// On success the successor's pid is recorded for [`Handoff::kill`]. On
    /// failure nothing changes and this process keeps serving.
    pub fn fork_exec(&mut self, listener: &Listener) -> Result<Pid> {
        let exe = current_executable()?;
        let handshake = self.strategy.handshake_signal();
        let envelope = Envelope::for_spawn(listener, None, Pid::this(), handshake)?;
        let mut command = restart_command(&exe, listener, &envelope)?;

        let child = command.spawn().map_err(Error::ProcessStart)?;
        let pid = Pid::from_raw(child.id() as i32);
        info!(
            "spawned successor {pid} ({}, handshake {})",
            envelope.name(),
            envelope.handshake()
        );
        self.successor = Some(pid);
        Ok(pid)
    }

    /// Prepare to replace this process's image with a fresh copy of the
    /// binary, keeping the listener and the recorded successor.
    ///
    /// Refused when this process is itself a successor whose spawning parent
    /// is still alive: such a process re-executing would look like a fresh
    /// top-level server and restart forever.
    pub fn exec_in_place(&self, listener: &Listener) -> Result<Reexec> {
        if let Some(inherited) = &self.inherited {
            let parent = getppid();
            if parent == inherited.predecessor() {
                return Err(Error::SelfReexecGuard(parent));
            }
        }

        let exe = current_executable()?;
        let envelope = Envelope::for_spawn(listener, self.successor, Pid::this(), GRACEFUL_EXIT)?;
        let command = restart_command(&exe, listener, &envelope)?;
        Ok(Reexec {
            exe,
            envelope,
            command,
        })
    }
}
