use std::{env, fs, path::PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable holding the path of the JSON configuration file.
pub const CONFIG_ENV: &str = "MODEL_HOST_CONFIG";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8765;

/// Node configuration, every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    /// File backing the model store, kept in memory when unset.
    pub flash_path: Option<PathBuf>,
    pub flash_size: usize,
    pub page_size: usize,
    /// JSON file backing the settings, kept in memory when unset.
    pub settings_path: Option<PathBuf>,
    pub max_arena_size: usize,
    pub auto_invoke_every: u16,
    pub sample_channels: usize,
    pub sample_window: usize,
    /// Period of the simulated sensor, 0 disables it.
    pub sample_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            flash_path: None,
            flash_size: 128 * 1024,
            page_size: 4096,
            settings_path: None,
            max_arena_size: 64 * 1024,
            auto_invoke_every: 0,
            sample_channels: 3,
            sample_window: 32,
            sample_interval_ms: 100,
        }
    }
}

impl HostConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration file named by `MODEL_HOST_CONFIG`, if any,
    /// then applies the `HOST` and `PORT` overrides.
    ///
    /// # Errors
    /// A `ConfigError` if the file can't be read, parsed or validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) => {
                let content =
                    fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
                serde_json::from_str(&content)?
            }
            Err(_) => Self::default(),
        };

        config.apply_overrides(env::var("HOST").ok(), env::var("PORT").ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Replaces the listen address parts that are given.
    pub fn apply_overrides(
        &mut self,
        host: Option<String>,
        port: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = host {
            self.host = host;
        }

        if let Some(port) = port {
            self.port = port
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("PORT '{port}': {e}")))?;
        }

        Ok(())
    }

    /// Checks the values the node can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size % 8 != 0 {
            return Err(ConfigError::Invalid(format!(
                "page_size {} must be a positive multiple of 8",
                self.page_size
            )));
        }

        if self.flash_size == 0 || self.flash_size % self.page_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "flash_size {} must be a positive multiple of page_size {}",
                self.flash_size, self.page_size
            )));
        }

        for (name, value) in [
            ("flash_size", self.flash_size),
            ("max_arena_size", self.max_arena_size),
        ] {
            if u32::try_from(value).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name} {value} does not fit the 32 bit registers"
                )));
            }
        }

        if self.sample_channels == 0 || self.sample_window == 0 {
            return Err(ConfigError::Invalid(
                "sample_channels and sample_window must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Returns the `host:port` listen address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8765");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = HostConfig::from_json(r#"{"port": 9000, "auto_invoke_every": 50}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.auto_invoke_every, 50);
        assert_eq!(config.page_size, HostConfig::default().page_size);
    }

    #[test]
    fn test_invalid_values() {
        for json in [
            r#"{"page_size": 12}"#,
            r#"{"flash_size": 5000, "page_size": 4096}"#,
            r#"{"flash_size": 0}"#,
            r#"{"sample_window": 0}"#,
            r#"{"max_arena_size": 4294967296}"#,
        ] {
            assert!(
                matches!(HostConfig::from_json(json), Err(ConfigError::Invalid(_))),
                "{json}"
            );
        }

        assert!(matches!(
            HostConfig::from_json(r#"{"prot": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = HostConfig::default();
        config
            .apply_overrides(Some("0.0.0.0".into()), Some("4000".into()))
            .unwrap();
        assert_eq!(config.addr(), "0.0.0.0:4000");

        assert!(config.apply_overrides(None, Some("http".into())).is_err());
    }
}
