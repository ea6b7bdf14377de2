use std::time::Duration;

use forgehost_plugin_proto::HandshakeConfig;
use serde::Deserialize;

/// Host-side tuning for plugin lifecycle and RPC.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Protocol identity sent to every spawned plugin. Must match the
    /// compiled protocol version or every start is refused.
    pub handshake: HandshakeConfig,
    /// Upper bound on one capability-call round-trip.
    pub call_timeout: Duration,
    /// Upper bound on the hello exchange after spawn.
    pub handshake_timeout: Duration,
    /// How long `stop` waits for a plugin to exit before killing it.
    pub stop_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            call_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_version_compatible() {
        assert!(HostConfig::default().handshake.is_version_compatible());
    }
}
