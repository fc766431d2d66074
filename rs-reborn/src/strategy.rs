use std::fmt;
use std::str::FromStr;

use nix::sys::signal::Signal;
use serde::Deserialize;

/// How many process generations coexist during a restart.
///
/// `Single`: the successor confirms with `SIGQUIT` and the predecessor exits.
/// `Double`: the successor confirms with `SIGUSR2`; the predecessor stays
/// alive until it re-executes itself in place and the interim successor is
/// told to quit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Single,
    Double,
}

/// Signal that finalizes a predecessor's graceful exit.
pub const GRACEFUL_EXIT: Signal = Signal::SIGQUIT;

/// Signal a Double-strategy successor sends once it is serving.
pub const READY: Signal = Signal::SIGUSR2;

impl Strategy {
    /// The signal a freshly spawned successor must send back.
    pub fn handshake_signal(self) -> Signal {
        match self {
            Strategy::Single => GRACEFUL_EXIT,
            Strategy::Double => READY,
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(Strategy::Single),
            "double" => Ok(Strategy::Double),
            other => Err(format!("unknown restart strategy {other:?}")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Single => f.write_str("single"),
            Strategy::Double => f.write_str("double"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_handshake_differs_from_graceful_exit() {
        assert_eq!(Strategy::Double.handshake_signal(), Signal::SIGUSR2);
        assert_ne!(Strategy::Double.handshake_signal(), GRACEFUL_EXIT);
    }

    #[test]
    fn single_handshake_is_graceful_exit() {
        assert_eq!(Strategy::Single.handshake_signal(), GRACEFUL_EXIT);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Double".parse::<Strategy>(), Ok(Strategy::Double));
        assert_eq!("single".parse::<Strategy>(), Ok(Strategy::Single));
        assert!("triple".parse::<Strategy>().is_err());
    }
}
