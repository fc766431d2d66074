use std::time::Duration;

use serde::Deserialize;

use crate::strategy::Strategy;

/// Restart settings a hosting server embeds in its own configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub strategy: Strategy,
    /// Seconds to wait for the successor's handshake. Unset waits forever.
    pub handshake_timeout_secs: Option<u64>,
}

impl RestartConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_single_without_deadline() {
        let config: RestartConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.strategy, Strategy::Single);
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn reads_strategy_and_timeout() {
        let config: RestartConfig =
            serde_json::from_str(r#"{"strategy": "double", "handshake_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.strategy, Strategy::Double);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(5)));
    }
}
