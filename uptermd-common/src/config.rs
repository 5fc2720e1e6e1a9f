use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identifier::IdentifierCodec;

fn _default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn _default_ws_listen() -> String {
    "0.0.0.0:8022".to_string()
}

fn _default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}

fn _default_keys_dir() -> PathBuf {
    PathBuf::from("./data/keys")
}

fn _default_inactivity_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn _default_keepalive_interval() -> Duration {
    Duration::from_secs(15)
}

fn _default_handshake_timeout() -> Duration {
    Duration::from_secs(60)
}

fn _default_shutdown_deadline() -> Duration {
    Duration::from_secs(1)
}

fn _default_session_ttl() -> Duration {
    Duration::from_secs(60)
}

fn _default_etcd_prefix() -> String {
    "uptermd".to_string()
}

fn _default_log_format() -> LogFormat {
    LogFormat::Auto
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Auto,
    Text,
    Json,
}

/// Which `NetworkProvider` (C2) backs session rendezvous and the internal
/// SSHD loopback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkConfig {
    Memory,
    Unix {
        #[serde(default = "_default_socket_dir")]
        socket_dir: PathBuf,
    },
}

fn _default_socket_dir() -> PathBuf {
    PathBuf::from("./data/sockets")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::Memory
    }
}

/// Which `SessionStore` (C3) backend to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectoryConfig {
    Embedded,
    Etcd {
        endpoints: Vec<String>,
        #[serde(default = "_default_etcd_prefix")]
        prefix: String,
    },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig::Embedded
    }
}

impl DirectoryConfig {
    /// The identifier codec implied by the chosen directory backend:
    /// embedded-KV sessions carry their own routing address, external ones
    /// are resolved by a lookup.
    pub fn identifier_codec(&self) -> IdentifierCodec {
        match self {
            DirectoryConfig::Embedded => IdentifierCodec::Embedded,
            DirectoryConfig::Etcd { .. } => IdentifierCodec::External,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "_default_ssh_listen")]
    pub listen: String,
    #[serde(default = "_default_keys_dir")]
    pub host_keys_dir: PathBuf,
    #[serde(default = "_default_inactivity_timeout", with = "humantime_duration")]
    pub inactivity_timeout: Duration,
    #[serde(default = "_default_keepalive_interval", with = "humantime_duration")]
    pub keepalive_interval: Duration,
    #[serde(default = "_default_handshake_timeout", with = "humantime_duration")]
    pub handshake_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen: _default_ssh_listen(),
            host_keys_dir: _default_keys_dir(),
            inactivity_timeout: _default_inactivity_timeout(),
            keepalive_interval: _default_keepalive_interval(),
            handshake_timeout: _default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "_default_ws_listen")]
    pub listen: String,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen: _default_ws_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "_default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: _default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigStore {
    #[serde(default)]
    pub node_addr: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default = "_default_session_ttl", with = "humantime_duration")]
    pub session_ttl: Duration,
    #[serde(default = "_default_shutdown_deadline", with = "humantime_duration")]
    pub shutdown_deadline: Duration,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "_default_log_format")]
    pub log_format: LogFormat,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            node_addr: None,
            network: NetworkConfig::default(),
            directory: DirectoryConfig::default(),
            session_ttl: _default_session_ttl(),
            shutdown_deadline: _default_shutdown_deadline(),
            ssh: SshConfig::default(),
            ws: WsConfig::default(),
            metrics: MetricsConfig::default(),
            log_format: _default_log_format(),
        }
    }
}

/// Fully resolved configuration: the deserialized store plus the directory
/// every relative path (key files, socket directory) is resolved against.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: ConfigStore,
    pub paths_relative_to: PathBuf,
}

impl Config {
    pub fn resolve_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths_relative_to.join(path)
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime_like(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_humantime_like(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_like(d: Duration) -> String {
        format!("{}s", d.as_secs())
    }

    fn parse_humantime_like(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(stripped) = s.strip_suffix("ms") {
            return stripped
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string());
        }
        if let Some(stripped) = s.strip_suffix('s') {
            return stripped
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string());
        }
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let store = ConfigStore::default();
        assert_eq!(store.ssh.listen, "0.0.0.0:2222");
        assert!(matches!(store.directory, DirectoryConfig::Embedded));
        assert!(matches!(store.network, NetworkConfig::Memory));
    }

    #[test]
    fn directory_mode_selects_matching_codec() {
        assert_eq!(
            DirectoryConfig::Embedded.identifier_codec(),
            IdentifierCodec::Embedded
        );
        assert_eq!(
            DirectoryConfig::Etcd {
                endpoints: vec!["http://localhost:2379".into()],
                prefix: "uptermd".into(),
            }
            .identifier_codec(),
            IdentifierCodec::External
        );
    }

    #[test]
    fn store_round_trips_through_yaml() {
        let store = ConfigStore::default();
        let yaml = serde_yaml::to_string(&store).unwrap();
        let back: ConfigStore = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.ssh.listen, store.ssh.listen);
    }
}
