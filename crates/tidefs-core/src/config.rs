use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level client configuration (loaded from tidefs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidefsConfig {
    pub client: ClientConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// File-based encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Which cipher implementations the provider should try first:
    /// "system-default" or "accelerated"
    pub engine: EnginePreference,
}

/// Preferred cipher implementation family.
///
/// `Accelerated` asks the provider for a mode's hardware-accelerated variant
/// when one is registered, falling back to the generic implementation when
/// it is not. Affects performance only, never the produced key material.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnginePreference {
    #[default]
    SystemDefault,
    Accelerated,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            engine: EnginePreference::SystemDefault,
        }
    }
}

impl TidefsConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// missing section.
    pub fn load(path: &Path) -> crate::TidefsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            crate::TidefsError::Config(format!("parsing {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[client]
log_level = "debug"
log_format = "text"

[crypto]
engine = "accelerated"
"#;
        let config: TidefsConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.client.log_level, "debug");
        assert_eq!(config.crypto.engine, EnginePreference::Accelerated);
    }

    #[test]
    fn test_parse_defaults() {
        let config: TidefsConfig = toml::from_str("").unwrap();

        assert_eq!(config.client.log_level, "info");
        assert_eq!(config.crypto.engine, EnginePreference::SystemDefault);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[client]
log_level = "trace"
"#;
        let config: TidefsConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.client.log_level, "trace");
        // Defaults
        assert_eq!(config.crypto.engine, EnginePreference::SystemDefault);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidefs.toml");
        std::fs::write(&path, "[crypto]\nengine = \"accelerated\"\n").unwrap();

        let config = TidefsConfig::load(&path).unwrap();
        assert_eq!(config.crypto.engine, EnginePreference::Accelerated);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = TidefsConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: TidefsConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.client.log_level, parsed.client.log_level);
        assert_eq!(config.crypto.engine, parsed.crypto.engine);
    }
}
