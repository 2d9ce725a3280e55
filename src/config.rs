//! Server configuration, loaded from a TOML file with defaults for every
//! field. Module behavior is configured per thread through stored JSON
//! configurations, not here.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control server binds to.
    pub bind: String,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Default data directory offered to websites without their own.
    pub data_dir: Option<PathBuf>,
    /// Client IPs allowed to issue commands.
    pub allowed_ips: Vec<IpAddr>,
    /// Value for Access-Control-Allow-Origin; `*` allows any origin.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_string(),
            db_path: PathBuf::from("webharvest.db"),
            data_dir: None,
            allowed_ips: vec!["127.0.0.1".parse().expect("valid address")],
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("cannot parse {}: {e}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "127.0.0.1:8090");
        assert_eq!(config.allowed_ips.len(), 1);
        assert!(config.cors_origin.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind = "0.0.0.0:9000"
            db_path = "/var/lib/webharvest/store.db"
            allowed_ips = ["127.0.0.1", "10.0.0.5"]
            cors_origin = "*"
        "#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.allowed_ips.len(), 2);
        assert_eq!(config.cors_origin.as_deref(), Some("*"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.db_path, PathBuf::from("webharvest.db"));
    }
}
