use log::debug;
use nix::unistd::Pid;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::listener::Listener;
use crate::strategy::Strategy;

/// Per-process view of the restart protocol.
///
/// Holds what a predecessor handed to us (if anything) and the pid of the
/// successor this process spawned. Spawning, re-exec and the handshake signal
/// all work from here.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub(crate) strategy: Strategy,
    pub(crate) inherited: Option<Envelope>,
    pub(crate) successor: Option<Pid>,
}

impl Handoff {
    /// A top-level server with nothing inherited.
    pub fn new(strategy: Strategy) -> Self {
        Self::with_inherited(strategy, None)
    }

    pub fn with_inherited(strategy: Strategy, inherited: Option<Envelope>) -> Self {
        let successor = inherited.as_ref().and_then(Envelope::successor);
        Handoff {
            strategy,
            inherited,
            successor,
        }
    }

    /// Parse the environment once at startup.
    pub fn from_env(strategy: Strategy) -> Result<Self> {
        let inherited = Envelope::from_env()?;
        match &inherited {
            Some(envelope) => debug!(
                "inherited {} from predecessor {}",
                envelope.name(),
                envelope.predecessor()
            ),
            None => debug!("no handoff in environment, starting fresh"),
        }
        Ok(Self::with_inherited(strategy, inherited))
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn inherited(&self) -> Option<&Envelope> {
        self.inherited.as_ref()
    }

    /// Whether this process was started by a predecessor.
    pub fn is_successor(&self) -> bool {
        self.inherited.is_some()
    }

    pub fn successor(&self) -> Option<Pid> {
        self.successor
    }

    /// Take the listener a predecessor passed down, or bind a fresh one.
    pub fn listener_or_bind(&self, address: &str) -> Result<Listener> {
        match &self.inherited {
            Some(envelope) => Listener::decode(envelope),
            None => Listener::bind(address),
        }
    }
}
