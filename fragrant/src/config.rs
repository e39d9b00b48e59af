use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::network::Cidr;

/// Environment variable overriding `environments.env_dir`.
pub const ENV_DIR_VAR: &str = "FRAGRANT_ENV_DIR";
/// Environment variable overriding `network.address_range`.
pub const IP_RANGE_VAR: &str = "FRAGRANT_IP_RANGE";

/// Top-level configuration for the fragrant service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub environments: EnvironmentsConfig,
    pub network: NetworkConfig,
    pub tool: ToolConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.network
            .address_range
            .parse::<Cidr>()
            .with_context(|| format!("network.address_range is not a valid CIDR: {}", self.network.address_range))?;
        anyhow::ensure!(self.server.port != 0, "server.port must be non-zero");
        anyhow::ensure!(
            self.environments.id_attempts >= 1,
            "environments.id_attempts must be >= 1"
        );
        anyhow::ensure!(
            !self.tool.vagrant_binary.as_os_str().is_empty(),
            "tool.vagrant_binary must not be empty"
        );
        anyhow::ensure!(
            !self.tool.vboxmanage_binary.as_os_str().is_empty(),
            "tool.vboxmanage_binary must not be empty"
        );
        Ok(())
    }

    /// Apply `FRAGRANT_ENV_DIR` / `FRAGRANT_IP_RANGE` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let env_dir = std::env::var_os(ENV_DIR_VAR).map(PathBuf::from);
        let range = std::env::var(IP_RANGE_VAR).ok();
        self.apply_overrides(env_dir, range)
    }

    fn apply_overrides(&mut self, env_dir: Option<PathBuf>, range: Option<String>) -> Result<()> {
        if let Some(dir) = env_dir {
            // The pool file follows the environment directory unless it was set explicitly.
            if self.network.address_file == NetworkConfig::default().address_file {
                self.network.address_file = dir.join("addresses.json");
            }
            self.environments.env_dir = dir;
        }
        if let Some(range) = range {
            self.network.address_range = range;
        }
        self.validate()
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 9292,
        }
    }
}

/// Where environments live and what they boot by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentsConfig {
    /// Parent directory holding one working directory per environment.
    pub env_dir: PathBuf,
    /// Box used when a request does not name one.
    pub default_box_name: String,
    /// Download location for the default box.
    pub default_box_url: String,
    /// How many fresh ids to try before giving up on a create.
    pub id_attempts: u32,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            env_dir: PathBuf::from("/var/lib/fragrant/environments"),
            default_box_name: "precise32".into(),
            default_box_url: "http://files.vagrantup.com/precise32.box".into(),
            id_attempts: 8,
        }
    }
}

/// Address pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// CIDR block environments draw their private address from.
    pub address_range: String,
    /// JSON file recording which environment holds which address.
    pub address_file: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address_range: "172.24.24.128/25".into(),
            address_file: PathBuf::from("/var/lib/fragrant/addresses.json"),
        }
    }
}

/// External binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub vagrant_binary: PathBuf,
    pub vboxmanage_binary: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            vagrant_binary: PathBuf::from("vagrant"),
            vboxmanage_binary: PathBuf::from("VBoxManage"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.server.port, 9292);
        assert_eq!(config.environments.default_box_name, "precise32");
        assert_eq!(config.environments.id_attempts, 8);
        assert_eq!(config.network.address_range, "172.24.24.128/25");
        assert_eq!(config.tool.vagrant_binary, PathBuf::from("vagrant"));
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[server]
port = 8080

[network]
address_range = "10.0.0.0/24"

[environments]
default_box_name = "jammy64"
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        tmpfile.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(tmpfile.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.network.address_range, "10.0.0.0/24");
        assert_eq!(config.environments.default_box_name, "jammy64");
        // Unset fields use defaults
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(
            config.environments.default_box_url,
            "http://files.vagrantup.com/precise32.box"
        );
    }

    #[test]
    fn config_validation_rejects_bad_range() {
        let mut config = Config::default();
        config.network.address_range = "10.0.0.0/33".into();
        assert!(config.validate().is_err());

        config.network.address_range = "not-a-range".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_zero_id_attempts() {
        let mut config = Config::default();
        config.environments.id_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_dir_override_moves_default_pool_file() {
        let mut config = Config::default();
        config
            .apply_overrides(Some(PathBuf::from("/tmp/fragrant-envs")), None)
            .unwrap();
        assert_eq!(config.environments.env_dir, PathBuf::from("/tmp/fragrant-envs"));
        assert_eq!(
            config.network.address_file,
            PathBuf::from("/tmp/fragrant-envs/addresses.json")
        );
    }

    #[test]
    fn env_dir_override_keeps_explicit_pool_file() {
        let mut config = Config::default();
        config.network.address_file = PathBuf::from("/srv/pool.json");
        config
            .apply_overrides(Some(PathBuf::from("/tmp/fragrant-envs")), None)
            .unwrap();
        assert_eq!(config.network.address_file, PathBuf::from("/srv/pool.json"));
    }

    #[test]
    fn range_override_is_validated() {
        let mut config = Config::default();
        config
            .apply_overrides(None, Some("192.168.50.0/28".into()))
            .unwrap();
        assert_eq!(config.network.address_range, "192.168.50.0/28");

        assert!(config.apply_overrides(None, Some("bogus".into())).is_err());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.server.port, config.server.port);
        assert_eq!(deserialized.network.address_range, config.network.address_range);
        assert_eq!(deserialized.environments.env_dir, config.environments.env_dir);
    }
}
