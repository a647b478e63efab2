//! Configuration for the tether node.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_core::{ConnectionConfig, PeerId, TcpDirectory};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Who this node is and where it listens.
    pub node: IdentityConfig,
    /// Peers to dial at startup, by id.
    pub peers: BTreeMap<PeerId, SocketAddr>,
    /// Reliability and reconnection tuning shared by every connection.
    pub connection: ConnectionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Local identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Peer id announced in the hello frame of every outbound session.
    pub id: PeerId,
    /// Address to accept inbound sessions on.
    pub listen: SocketAddr,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive. `RUST_LOG` wins when set.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: PeerId::from("node"),
            listen: SocketAddr::from(([0, 0, 0, 0], 7400)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// The default configuration rendered as TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Address book for the TCP dialer.
    pub fn directory(&self) -> TcpDirectory {
        self.peers
            .iter()
            .map(|(peer, addr)| (peer.clone(), *addr))
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::BackoffPolicy;

    #[test]
    fn default_config_serializes() {
        let text = NodeConfig::default_toml().unwrap();
        assert!(text.contains("listen"));
        assert!(text.contains("retry_limit"));
        assert!(text.contains("strategy = \"fixed\""));
    }

    #[test]
    fn roundtrip_config() {
        let mut cfg = NodeConfig::default();
        cfg.peers
            .insert(PeerId::from("bob"), "10.0.0.2:7400".parse().unwrap());
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed = NodeConfig::parse(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let cfg = NodeConfig::parse(
            r#"
            [node]
            id = "alice"

            [peers]
            bob = "127.0.0.1:7401"

            [connection.backoff]
            strategy = "exponential"
            initial_ms = 500
            max_ms = 8000
            "#,
        )
        .unwrap();

        assert_eq!(cfg.node.id, PeerId::from("alice"));
        assert_eq!(cfg.node.listen.port(), 7400);
        assert_eq!(cfg.connection.retry_limit, 5);
        assert_eq!(cfg.connection.retransmit_interval_ms, 10);
        assert_eq!(
            cfg.connection.backoff,
            BackoffPolicy::Exponential {
                initial_ms: 500,
                max_ms: 8000
            }
        );
        assert_eq!(
            cfg.directory().lookup(&PeerId::from("bob")),
            Some("127.0.0.1:7401".parse().unwrap())
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("tether-node-missing-config.toml");
        let _ = std::fs::remove_file(&path);
        assert_eq!(NodeConfig::load(&path), NodeConfig::default());
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!("tether-node-{}.toml", std::process::id()));
        NodeConfig::write_default(&path).unwrap();
        let loaded = NodeConfig::load(&path);
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, NodeConfig::default());
    }
}
