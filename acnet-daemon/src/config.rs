//! Daemon configuration.
//!
//! A TOML file provides the stable settings; the command line can override
//! the common ones. Everything has a default so a bare `acnetd` comes up as
//! a single-node daemon on the standard ports.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// UDP port shared with peer daemons.
    pub peer_port: u16,

    /// Loopback UDP port for the client command channel.
    pub client_port: u16,

    /// Override for the machine's host name (otherwise taken from the OS).
    pub hostname: Option<String>,

    /// Extra virtual node names hosted alongside the primary node.
    pub nodes: Vec<String>,

    /// Task handles remote (TCP-fronted) clients may not address.
    pub reject_tasks: Vec<String>,

    /// Where diagnostic reports are written.
    pub report_dir: PathBuf,

    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            peer_port: crate::transport::ACNET_PORT,
            client_port: crate::transport::ACNET_CLIENT_PORT,
            hostname: None,
            nodes: Vec::new(),
            reject_tasks: Vec::new(),
            report_dir: PathBuf::from("/tmp"),
            log_level: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;

        Ok(toml::from_str(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_the_wellknown_ports() {
        let cfg = DaemonConfig::default();

        assert_eq!(cfg.peer_port, 6801);
        assert_eq!(cfg.client_port, 6802);
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            peer_port = 7801
            nodes = ["VNODE1", "VNODE2"]
            reject_tasks = ["SETTER"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.peer_port, 7801);
        assert_eq!(cfg.client_port, 6802);
        assert_eq!(cfg.nodes, vec!["VNODE1", "VNODE2"]);
        assert_eq!(cfg.reject_tasks, vec!["SETTER"]);
        assert_eq!(cfg.report_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn garbage_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acnetd.toml");

        std::fs::write(&path, "peer_port = \"not a port\"").unwrap();
        assert!(matches!(
            DaemonConfig::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
