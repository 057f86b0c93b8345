//! Configuration for the call controller

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One STUN or TURN entry. Plain STUN servers leave the credential fields
/// empty; TURN entries carry the short-lived credentials provisioned by the
/// backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn turn(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: username.into(),
            credential: credential.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// NAT traversal servers; at least one STUN entry is expected.
    pub ice_servers: Vec<IceServer>,
    /// How long an unanswered call rings before auto-rejection.
    pub ring_timeout: Duration,
    /// Cadence of the session/watcher housekeeping tick.
    pub tick_interval: Duration,
    /// Delay before the best-effort purge of a finished call's signals.
    pub signal_purge_delay: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ring_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            signal_purge_delay: Duration::from_secs(30),
        }
    }
}

impl CallConfig {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("call_config.json");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| crate::error::Error::Store(e.to_string()))?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let config_path = data_dir.join("call_config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)
            .map_err(|e| crate::error::Error::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_stun_and_sixty_second_ring() {
        let config = CallConfig::default();
        assert!(!config.ice_servers.is_empty());
        assert_eq!(config.ring_timeout, Duration::from_secs(60));
    }

    #[test]
    fn config_round_trips_as_json() {
        let mut config = CallConfig::default();
        config.ice_servers.push(IceServer::turn(
            vec!["turn:turn.example.org:3478".into()],
            "user",
            "secret",
        ));
        let json = serde_json::to_string(&config).unwrap();
        let back: CallConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ice_servers, config.ice_servers);
        assert_eq!(back.ring_timeout, config.ring_timeout);
    }
}
