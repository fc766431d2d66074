//! The restart loop.
//!
//! A process spends its life blocked in [`Coordinator::wait`]. Signals are
//! funnelled into an [`EventQueue`] and consumed one at a time:
//!
//! | signal    | effect                                                      |
//! |-----------|-------------------------------------------------------------|
//! | `SIGHUP`  | run the reload hook                                         |
//! | `SIGUSR1` | run the log-reopen hook                                     |
//! | `SIGINT`, `SIGTERM`, `SIGQUIT` | return the signal                      |
//! | `SIGUSR2` | first time: spawn a successor; second time: return it       |
//!
//! `SIGQUIT` doubles as the Single strategy handshake and `SIGUSR2` as the
//! Double strategy one, so a confirmed successor ends the loop too.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};

use crate::error::{Error, Result};
use crate::handoff::Handoff;
use crate::listener::Listener;

/// Signals the loop listens for.
pub const HANDLED: [i32; 6] = [SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2];

/// How long a successor killed after a missed deadline gets to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

pub type HookResult = std::result::Result<(), Box<dyn StdError + Send + Sync>>;

type ReloadHook = Box<dyn FnMut(&Listener) -> HookResult>;
type ReopenLogsHook = Box<dyn FnMut() -> HookResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AwaitingSuccessor,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Signal(Signal),
    SuccessorExited(Pid),
    DeadlineElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Reload,
    ReopenLogs,
    Spawn,
    /// The unconfirmed successor died; keep serving and allow another restart.
    Abandon,
    /// The successor missed its deadline; kill it and report a timeout.
    KillSuccessor,
    Finish(Signal),
}

/// The restart state machine, free of any I/O.
pub fn transition(state: State, event: &Event) -> (State, Action) {
    use State::*;

    match (state, *event) {
        (Done, _) => (Done, Action::Ignore),
        (_, Event::Signal(sig)) => match sig {
            Signal::SIGHUP => (state, Action::Reload),
            Signal::SIGUSR1 => (state, Action::ReopenLogs),
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT => (Done, Action::Finish(sig)),
            Signal::SIGUSR2 if state == Idle => (AwaitingSuccessor, Action::Spawn),
            Signal::SIGUSR2 => (Done, Action::Finish(sig)),
            _ => (state, Action::Ignore),
        },
        (AwaitingSuccessor, Event::SuccessorExited(_)) => (Idle, Action::Abandon),
        (AwaitingSuccessor, Event::DeadlineElapsed) => (Done, Action::KillSuccessor),
        (Idle, _) => (Idle, Action::Ignore),
    }
}

/// One restart attempt in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSession {
    pub successor: Pid,
    pub deadline: Option<Instant>,
}

/// Serial queue of everything the loop reacts to.
///
/// OS signals arrive through a `signal-hook` iterator thread; successor exits
/// through one `waitpid` thread per watched process.
pub struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    pending: VecDeque<Event>,
    signals: Option<Handle>,
}

impl EventQueue {
    /// Register [`HANDLED`] and start forwarding them.
    pub fn os() -> io::Result<Self> {
        let mut signals = Signals::new(HANDLED)?;
        let handle = signals.handle();
        let (tx, rx) = mpsc::channel();
        let forward = tx.clone();
        thread::Builder::new()
            .name("reborn-signals".to_string())
            .spawn(move || {
                for raw in signals.forever() {
                    let Ok(sig) = Signal::try_from(raw) else {
                        continue;
                    };
                    if forward.send(Event::Signal(sig)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(EventQueue {
            tx,
            rx,
            pending: VecDeque::new(),
            signals: Some(handle),
        })
    }

    /// A queue fed only through the returned sender.
    pub fn manual() -> (Self, Sender<Event>) {
        let (tx, rx) = mpsc::channel();
        let queue = EventQueue {
            tx: tx.clone(),
            rx,
            pending: VecDeque::new(),
            signals: None,
        };
        (queue, tx)
    }

    /// Post [`Event::SuccessorExited`] once `pid` exits, reaping it.
    pub fn watch(&self, pid: Pid) {
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("watch-{pid}"))
            .spawn(move || match waitpid(pid, None) {
                Ok(status) => {
                    debug!("successor {pid} exited: {status:?}");
                    let _ = tx.send(Event::SuccessorExited(pid));
                }
                Err(Errno::ECHILD) => debug!("process {pid} is not our child, not watching"),
                Err(e) => warn!("waiting for successor {pid} failed: {e}"),
            });
        if let Err(e) = spawned {
            warn!("could not watch successor {pid}: {e}");
        }
    }

    fn next(&mut self, deadline: Option<Instant>) -> Result<Event> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        let received = match deadline {
            Some(deadline) => self
                .rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Ok(Event::DeadlineElapsed),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "event queue closed").into())
            }
        }
    }

    /// Wait up to `grace` for `pid` to be reaped, keeping other events for later.
    fn await_exit(&mut self, pid: Pid, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match self.rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Event::SuccessorExited(exited)) if exited == pid => return true,
                Ok(event) => self.pending.push_back(event),
                Err(_) => return false,
            }
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if let Some(handle) = &self.signals {
            handle.close();
        }
    }
}

/// Starts a successor on behalf of the loop.
pub trait Spawn {
    fn spawn_successor(&mut self, listener: &Listener) -> Result<Pid>;
}

impl Spawn for Handoff {
    fn spawn_successor(&mut self, listener: &Listener) -> Result<Pid> {
        self.fork_exec(listener)
    }
}

pub struct Builder<P> {
    spawner: P,
    handshake_timeout: Option<Duration>,
    on_reload: Option<ReloadHook>,
    on_reopen_logs: Option<ReopenLogsHook>,
}

impl<P: Spawn> Builder<P> {
    /// Bound the wait for a successor's handshake. `None` waits forever.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Run on `SIGHUP` with the live listener. Errors are logged.
    pub fn on_reload<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Listener) -> HookResult + 'static,
    {
        self.on_reload = Some(Box::new(hook));
        self
    }

    /// Run on `SIGUSR1`. Errors are logged.
    pub fn on_reopen_logs<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> HookResult + 'static,
    {
        self.on_reopen_logs = Some(Box::new(hook));
        self
    }

    /// Register the OS signal handlers. Do this before signalling a
    /// predecessor, so its reply cannot hit the default disposition.
    pub fn build(self) -> io::Result<Coordinator<P>> {
        Ok(self.build_with(EventQueue::os()?))
    }

    pub fn build_with(self, queue: EventQueue) -> Coordinator<P> {
        Coordinator {
            spawner: self.spawner,
            queue,
            handshake_timeout: self.handshake_timeout,
            on_reload: self.on_reload,
            on_reopen_logs: self.on_reopen_logs,
            state: State::Idle,
        }
    }
}

pub struct Coordinator<P = Handoff> {
    spawner: P,
    queue: EventQueue,
    handshake_timeout: Option<Duration>,
    on_reload: Option<ReloadHook>,
    on_reopen_logs: Option<ReopenLogsHook>,
    state: State,
}

impl<P: Spawn> Coordinator<P> {
    pub fn builder(spawner: P) -> Builder<P> {
        Builder {
            spawner,
            handshake_timeout: None,
            on_reload: None,
            on_reopen_logs: None,
        }
    }

    pub fn spawner(&self) -> &P {
        &self.spawner
    }

    pub fn spawner_mut(&mut self) -> &mut P {
        &mut self.spawner
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Block until the process should stop serving `listener`.
    ///
    /// Returns the signal that ended the loop. A failed spawn or a successor
    /// that missed its deadline is returned as an error; in both cases this
    /// process is still the only one serving.
    pub fn wait(&mut self, listener: &Listener) -> Result<Signal> {
        self.state = State::Idle;
        let mut session: Option<RestartSession> = None;

        loop {
            let event = self.queue.next(session.and_then(|s| s.deadline))?;
            if let Event::SuccessorExited(pid) = event {
                if session.map(|s| s.successor) != Some(pid) {
                    debug!("ignoring exit of stale process {pid}");
                    continue;
                }
            }

            let (next, action) = transition(self.state, &event);
            debug!("{:?} + {event:?} -> {next:?} ({action:?})", self.state);
            self.state = next;

            match action {
                Action::Ignore => {}
                Action::Reload => {
                    if let Some(hook) = self.on_reload.as_mut() {
                        if let Err(e) = hook(listener) {
                            error!("reload hook failed: {e}");
                        }
                    }
                }
                Action::ReopenLogs => {
                    if let Some(hook) = self.on_reopen_logs.as_mut() {
                        if let Err(e) = hook() {
                            error!("log reopen hook failed: {e}");
                        }
                    }
                }
                Action::Spawn => match self.spawner.spawn_successor(listener) {
                    Ok(pid) => {
                        self.queue.watch(pid);
                        let deadline = self.handshake_timeout.map(|t| Instant::now() + t);
                        session = Some(RestartSession {
                            successor: pid,
                            deadline,
                        });
                        info!("waiting for successor {pid} to confirm");
                    }
                    Err(e) => {
                        error!("restart aborted: {e}");
                        self.state = State::Done;
                        return Err(e);
                    }
                },
                Action::Abandon => {
                    if let Some(s) = session.take() {
                        warn!(
                            "successor {} exited before confirming, still serving",
                            s.successor
                        );
                    }
                }
                Action::KillSuccessor => match session.take() {
                    Some(s) => {
                        self.kill_unconfirmed(s.successor);
                        return Err(Error::HandshakeTimeout {
                            pid: s.successor,
                            timeout: self.handshake_timeout.unwrap_or_default(),
                        });
                    }
                    None => self.state = State::Idle,
                },
                Action::Finish(sig) => {
                    info!("received {sig}, leaving restart loop");
                    return Ok(sig);
                }
            }
        }
    }

    fn kill_unconfirmed(&mut self, pid: Pid) {
        warn!("successor {pid} did not confirm in time, killing it");
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                error!("failed to kill successor {pid}: {e}");
                return;
            }
        }
        if !self.queue.await_exit(pid, REAP_GRACE) {
            warn!("successor {pid} was not reaped within {REAP_GRACE:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::process::Command;
    use std::rc::Rc;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn listener() -> Listener {
        Listener::bind("127.0.0.1:0").unwrap()
    }

    /// Hands out a fixed pid, or fails, without starting anything.
    struct FakeSpawner {
        pid: Option<Pid>,
        calls: usize,
    }

    impl Spawn for FakeSpawner {
        fn spawn_successor(&mut self, _listener: &Listener) -> Result<Pid> {
            self.calls += 1;
            self.pid.ok_or_else(|| {
                Error::ProcessStart(io::Error::new(io::ErrorKind::NotFound, "no binary"))
            })
        }
    }

    fn not_our_child() -> Pid {
        Pid::from_raw(1)
    }

    fn queue_with(events: &[Event]) -> EventQueue {
        let (queue, tx) = EventQueue::manual();
        for event in events {
            tx.send(*event).unwrap();
        }
        queue
    }

    #[test]
    fn transitions_follow_the_signal_table() {
        use State::*;

        let sig = |s| Event::Signal(s);
        assert_eq!(transition(Idle, &sig(Signal::SIGHUP)), (Idle, Action::Reload));
        assert_eq!(
            transition(AwaitingSuccessor, &sig(Signal::SIGUSR1)),
            (AwaitingSuccessor, Action::ReopenLogs)
        );
        assert_eq!(
            transition(Idle, &sig(Signal::SIGTERM)),
            (Done, Action::Finish(Signal::SIGTERM))
        );
        assert_eq!(
            transition(Idle, &sig(Signal::SIGINT)),
            (Done, Action::Finish(Signal::SIGINT))
        );
        assert_eq!(
            transition(AwaitingSuccessor, &sig(Signal::SIGQUIT)),
            (Done, Action::Finish(Signal::SIGQUIT))
        );
        assert_eq!(
            transition(Idle, &sig(Signal::SIGUSR2)),
            (AwaitingSuccessor, Action::Spawn)
        );
        assert_eq!(
            transition(AwaitingSuccessor, &sig(Signal::SIGUSR2)),
            (Done, Action::Finish(Signal::SIGUSR2))
        );
        assert_eq!(
            transition(AwaitingSuccessor, &Event::DeadlineElapsed),
            (Done, Action::KillSuccessor)
        );
        assert_eq!(
            transition(AwaitingSuccessor, &Event::SuccessorExited(Pid::from_raw(9))),
            (Idle, Action::Abandon)
        );
        assert_eq!(transition(Idle, &Event::DeadlineElapsed), (Idle, Action::Ignore));
        assert_eq!(transition(Done, &sig(Signal::SIGHUP)), (Done, Action::Ignore));
    }

    #[test]
    fn reload_hook_runs_once_per_signal_and_errors_are_swallowed() {
        init_logging();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let mut coordinator = Coordinator::builder(FakeSpawner { pid: None, calls: 0 })
            .on_reload(move |_| {
                seen.set(seen.get() + 1);
                if seen.get() == 1 {
                    Err("config file unreadable".into())
                } else {
                    Ok(())
                }
            })
            .build_with(queue_with(&[
                Event::Signal(Signal::SIGHUP),
                Event::Signal(Signal::SIGHUP),
                Event::Signal(Signal::SIGTERM),
            ]));

        assert_eq!(coordinator.wait(&listener()).unwrap(), Signal::SIGTERM);
        assert_eq!(calls.get(), 2);
        assert_eq!(coordinator.state(), State::Done);
        assert_eq!(coordinator.spawner().calls, 0);
    }

    #[test]
    fn reopen_logs_hook_does_not_end_the_loop() {
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let mut coordinator = Coordinator::builder(FakeSpawner { pid: None, calls: 0 })
            .on_reopen_logs(move || {
                seen.set(seen.get() + 1);
                Err("disk full".into())
            })
            .build_with(queue_with(&[
                Event::Signal(Signal::SIGUSR1),
                Event::Signal(Signal::SIGINT),
            ]));

        assert_eq!(coordinator.wait(&listener()).unwrap(), Signal::SIGINT);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn second_restart_trigger_ends_the_loop() {
        let mut coordinator = Coordinator::builder(FakeSpawner {
            pid: Some(not_our_child()),
            calls: 0,
        })
        .build_with(queue_with(&[
            Event::Signal(Signal::SIGUSR2),
            Event::Signal(Signal::SIGUSR2),
        ]));

        assert_eq!(coordinator.wait(&listener()).unwrap(), Signal::SIGUSR2);
        assert_eq!(coordinator.spawner().calls, 1);
    }

    #[test]
    fn quit_after_spawn_is_the_single_handshake() {
        let mut coordinator = Coordinator::builder(FakeSpawner {
            pid: Some(not_our_child()),
            calls: 0,
        })
        .build_with(queue_with(&[
            Event::Signal(Signal::SIGUSR2),
            Event::Signal(Signal::SIGQUIT),
        ]));

        assert_eq!(coordinator.wait(&listener()).unwrap(), Signal::SIGQUIT);
    }

    #[test]
    fn failed_spawn_is_returned_immediately() {
        init_logging();
        let mut coordinator = Coordinator::builder(FakeSpawner { pid: None, calls: 0 })
            .build_with(queue_with(&[
                Event::Signal(Signal::SIGUSR2),
                Event::Signal(Signal::SIGTERM),
            ]));

        assert!(matches!(coordinator.wait(&listener()), Err(Error::ProcessStart(_))));
        assert_eq!(coordinator.state(), State::Done);
    }

    #[test]
    fn successor_dying_early_allows_another_restart() {
        init_logging();
        let pid = not_our_child();
        let mut coordinator = Coordinator::builder(FakeSpawner {
            pid: Some(pid),
            calls: 0,
        })
        .build_with(queue_with(&[
            Event::Signal(Signal::SIGUSR2),
            Event::SuccessorExited(pid),
            Event::Signal(Signal::SIGUSR2),
            Event::Signal(Signal::SIGTERM),
        ]));

        // Back in Idle after the exit, so the second SIGUSR2 spawns again
        // rather than ending the loop.
        assert_eq!(coordinator.wait(&listener()).unwrap(), Signal::SIGTERM);
        assert_eq!(coordinator.spawner().calls, 2);
    }

    /// Starts a real child that never confirms.
    struct SilentSuccessor {
        pid: Option<Pid>,
    }

    impl Spawn for SilentSuccessor {
        fn spawn_successor(&mut self, _listener: &Listener) -> Result<Pid> {
            let child = Command::new("sleep")
                .arg("30")
                .spawn()
                .map_err(Error::ProcessStart)?;
            let pid = Pid::from_raw(child.id() as i32);
            self.pid = Some(pid);
            Ok(pid)
        }
    }

    #[test]
    fn missed_deadline_kills_the_successor() {
        init_logging();
        let timeout = Duration::from_millis(200);
        let mut coordinator = Coordinator::builder(SilentSuccessor { pid: None })
            .handshake_timeout(Some(timeout))
            .build_with(queue_with(&[Event::Signal(Signal::SIGUSR2)]));

        let started = Instant::now();
        let result = coordinator.wait(&listener());
        let pid = coordinator.spawner().pid.unwrap();

        match result {
            Err(Error::HandshakeTimeout { pid: timed_out, timeout: reported }) => {
                assert_eq!(timed_out, pid);
                assert_eq!(reported, timeout);
            }
            other => panic!("expected handshake timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= timeout);
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));
    }
}
