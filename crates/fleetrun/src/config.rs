//! Configuration loading and types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fleetrun_core::FleetSpec;

/// Top-level configuration file
///
/// ```toml
/// log_level = "info"
///
/// [settings]
/// connect_attempts = 4
///
/// [[host]]
/// name = "ceph-mon1.lab"
/// addr = "10.0.0.11"
/// roles = ["mon"]
/// operator = { user = "cephuser", auth = { password = "cephuser" } }
/// privileged = { user = "root", auth = { key = { path = "/root/.ssh/id_ed25519" } } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(flatten)]
    pub fleet: FleetSpec,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("reading {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from the first config file found
    ///
    /// # Errors
    /// Returns error if no file exists or the one found cannot be parsed
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("FLEETRUN_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![
            PathBuf::from("fleetrun.toml"),
            PathBuf::from("/etc/fleetrun/fleetrun.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("fleetrun/fleetrun.toml"));
        }

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        eyre::bail!(
            "no fleet configuration found; set FLEETRUN_CONFIG or create one of {}",
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use fleetrun_exec::{Auth, KeySource};

    use super::*;

    #[test]
    fn test_parse_fleet_file() {
        let config: Config = toml::from_str(
            r#"
            [settings]
            connect_attempts = 2
            max_parallelism = 8

            [[host]]
            name = "ceph-mon1.lab"
            addr = "10.0.0.11"
            roles = ["mon"]
            operator = { user = "cephuser", auth = { password = "cephuser" } }
            privileged = { user = "root", auth = { key = { path = "/root/.ssh/id_ed25519" } } }

            [[host]]
            name = "ceph-osd1.lab"
            addr = "10.0.0.21"
            port = 2222
            operator = { user = "cephuser", auth = { password = "cephuser" } }
            privileged = { user = "root", auth = { password = "passwd" } }
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.fleet.settings.connect_attempts, 2);
        assert_eq!(config.fleet.settings.max_parallelism, Some(8));
        assert_eq!(config.fleet.settings.keepalive_secs, 15);
        assert_eq!(config.fleet.hosts.len(), 2);

        let mon = &config.fleet.hosts[0];
        assert!(mon.has_role("mon"));
        assert_eq!(mon.port, 22);
        assert_eq!(
            mon.privileged.auth,
            Auth::Key(KeySource::Path("/root/.ssh/id_ed25519".into()))
        );
        assert_eq!(config.fleet.hosts[1].port, 2222);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.fleet.hosts.is_empty());
    }
}
