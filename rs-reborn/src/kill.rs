use std::thread;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::handoff::Handoff;
use crate::strategy::{Strategy, GRACEFUL_EXIT};

impl Handoff {
    /// The process [`Handoff::kill`] would signal, and with what.
    ///
    /// Prefers the successor (this process spawned one, or inherited one
    /// through a re-exec), otherwise the predecessor that spawned us. The
    /// signal is the inherited handshake signal, `SIGQUIT` when there is none.
    pub fn kill_target(&self) -> Result<(Pid, Signal)> {
        let pid = self
            .successor
            .or_else(|| self.inherited.as_ref().map(|e| e.predecessor()))
            .ok_or(Error::NoTargetPid)?;
        let signal = self
            .inherited
            .as_ref()
            .map(|e| e.handshake())
            .unwrap_or(GRACEFUL_EXIT);
        Ok((pid, signal))
    }

    /// Send the handshake or exit signal to the other side of the handoff.
    pub fn kill(&self) -> Result<()> {
        let (pid, signal) = self.kill_target()?;
        if self.strategy == Strategy::Double && signal == GRACEFUL_EXIT {
            // The target is our own child here; collect it once it exits.
            reap_in_background(pid);
        }
        info!("sending {signal} to process {pid}");
        signal::kill(pid, signal).map_err(|source| Error::Signal { pid, source })
    }
}

/// Wait for `pid` on a background thread so it does not linger as a zombie.
pub(crate) fn reap_in_background(pid: Pid) {
    let spawned = thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match waitpid(pid, None) {
            Ok(status) => info!("process {pid} exited: {status:?}"),
            Err(Errno::ECHILD) => debug!("process {pid} is not our child, nothing to reap"),
            Err(e) => warn!("waiting for process {pid} failed: {e}"),
        });
    if let Err(e) = spawned {
        warn!("could not start reaper for process {pid}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    use crate::envelope::Envelope;

    fn envelope(successor: Option<Pid>, predecessor: Pid, handshake: Signal) -> Envelope {
        Envelope::new(3, "tcp:127.0.0.1:1->".to_string(), successor, predecessor, handshake)
    }

    #[test]
    fn fresh_server_has_nobody_to_signal() {
        let handoff = Handoff::new(Strategy::Single);
        assert!(matches!(handoff.kill_target(), Err(Error::NoTargetPid)));
        assert!(matches!(handoff.kill(), Err(Error::NoTargetPid)));
    }

    #[test]
    fn successor_signals_its_predecessor_with_handshake() {
        let handoff = Handoff::with_inherited(
            Strategy::Double,
            Some(envelope(None, Pid::from_raw(100), Signal::SIGUSR2)),
        );
        assert_eq!(handoff.kill_target().unwrap(), (Pid::from_raw(100), Signal::SIGUSR2));
    }

    #[test]
    fn recorded_successor_is_preferred() {
        let mut handoff = Handoff::with_inherited(
            Strategy::Double,
            Some(envelope(Some(Pid::from_raw(200)), Pid::from_raw(100), GRACEFUL_EXIT)),
        );
        assert_eq!(handoff.kill_target().unwrap(), (Pid::from_raw(200), GRACEFUL_EXIT));

        handoff.successor = Some(Pid::from_raw(300));
        assert_eq!(handoff.kill_target().unwrap().0, Pid::from_raw(300));
    }

    #[test]
    fn predecessor_without_envelope_uses_graceful_exit() {
        let mut handoff = Handoff::new(Strategy::Single);
        handoff.successor = Some(Pid::from_raw(400));
        assert_eq!(handoff.kill_target().unwrap(), (Pid::from_raw(400), GRACEFUL_EXIT));
    }

    #[test]
    fn double_strategy_kill_reaps_the_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let mut handoff = Handoff::new(Strategy::Double);
        handoff.successor = Some(pid);

        handoff.kill().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while signal::kill(pid, None).is_ok() {
            assert!(Instant::now() < deadline, "process {pid} still present");
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));
    }
}
