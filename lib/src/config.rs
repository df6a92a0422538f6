//! Configuration types for the IDE agent

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default value for configuration_namespace
fn default_configuration_namespace() -> String {
    "assistant".to_string()
}

/// Main configuration structure for the IDE agent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    /// Top-level configuration section owned by the hosted extension
    #[serde(default = "default_configuration_namespace")]
    pub configuration_namespace: String,
    /// Optional JSONL transcript of every message crossing the wire
    #[serde(default)]
    pub record_path: Option<PathBuf>,
}

/// Server configuration options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub log_level: String,
    #[serde(default)]
    pub framing: Framing,
    /// Relay operator-facing messages as `debug/message` notifications
    #[serde(default)]
    pub verbose_debug: bool,
}

/// How JSON-RPC messages are delimited on a byte stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// `Content-Length` headers followed by the JSON body
    #[default]
    ContentLength,
    /// One JSON document per line
    Newline,
}

/// Storage backends for global state and secrets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub global_state: GlobalStateBackend,
    #[serde(default)]
    pub secrets: SecretBackend,
    /// Identifier of the IDE the state belongs to; part of every persisted key
    #[serde(default = "default_ide_identifier")]
    pub ide_identifier: String,
}

fn default_ide_identifier() -> String {
    "headless".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            global_state: GlobalStateBackend::default(),
            secrets: SecretBackend::default(),
            ide_identifier: default_ide_identifier(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GlobalStateBackend {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SecretBackend {
    #[default]
    Memory,
    EncryptedFile {
        path: PathBuf,
        /// Environment variable holding the passphrase
        passphrase_env: String,
    },
    Keychain {
        service: String,
    },
}

/// Options that only make sense under test harnesses
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestingConfig {
    /// Track background work so tests can wait for it deterministically
    #[serde(default)]
    pub deterministic: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                log_level: "info".to_string(),
                framing: Framing::ContentLength,
                verbose_debug: false,
            },
            storage: StorageConfig::default(),
            testing: TestingConfig::default(),
            configuration_namespace: default_configuration_namespace(),
            record_path: None,
        }
    }
}

impl AgentConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if !["error", "warn", "info", "debug", "trace"].contains(&self.server.log_level.as_str()) {
            return Err(crate::error::AgentError::Config(format!(
                "Invalid log level: {}",
                self.server.log_level
            )));
        }

        if self.configuration_namespace.is_empty() || self.configuration_namespace.contains('.') {
            return Err(crate::error::AgentError::Config(format!(
                "Configuration namespace must be a single non-empty segment, got '{}'",
                self.configuration_namespace
            )));
        }

        if self.storage.ide_identifier.is_empty() {
            return Err(crate::error::AgentError::Config(
                "IDE identifier cannot be empty".to_string(),
            ));
        }

        if let SecretBackend::EncryptedFile { passphrase_env, .. } = &self.storage.secrets {
            if passphrase_env.is_empty() {
                return Err(crate::error::AgentError::Config(
                    "Encrypted secret storage needs a passphrase environment variable".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON string
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();

        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.framing, Framing::ContentLength);
        assert_eq!(config.storage.global_state, GlobalStateBackend::Memory);
        assert_eq!(config.storage.secrets, SecretBackend::Memory);
        assert_eq!(config.configuration_namespace, "assistant");
        assert!(!config.testing.deterministic);
        assert!(config.record_path.is_none());
    }

    #[test]
    fn test_config_validation_success() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = AgentConfig::default();
        config.server.log_level = "invalid".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log level"));
    }

    #[test]
    fn test_config_validation_dotted_namespace() {
        let mut config = AgentConfig::default();
        config.configuration_namespace = "a.b".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("single non-empty"));
    }

    #[test]
    fn test_config_validation_missing_passphrase_env() {
        let mut config = AgentConfig::default();
        config.storage.secrets = SecretBackend::EncryptedFile {
            path: PathBuf::from("/tmp/secrets"),
            passphrase_env: String::new(),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_deserialization() {
        let json = r#"{
            "server": {
                "log_level": "debug",
                "framing": "newline"
            },
            "storage": {
                "global_state": { "type": "sqlite", "path": "/tmp/state.db" },
                "secrets": { "type": "keychain", "service": "ide-agent" }
            },
            "testing": { "deterministic": true }
        }"#;

        let config = AgentConfig::from_json(json).unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.framing, Framing::Newline);
        assert_eq!(
            config.storage.global_state,
            GlobalStateBackend::Sqlite {
                path: PathBuf::from("/tmp/state.db")
            }
        );
        assert_eq!(
            config.storage.secrets,
            SecretBackend::Keychain {
                service: "ide-agent".to_string()
            }
        );
        assert_eq!(config.storage.ide_identifier, "headless");
        assert!(config.testing.deterministic);
        assert_eq!(config.configuration_namespace, "assistant");
    }

    #[test]
    fn test_round_trip_serialization() {
        let original = AgentConfig::default();
        let json = original.to_json().unwrap();
        let deserialized = AgentConfig::from_json(&json).unwrap();

        assert_eq!(original.server.log_level, deserialized.server.log_level);
        assert_eq!(original.server.framing, deserialized.server.framing);
        assert_eq!(
            original.configuration_namespace,
            deserialized.configuration_namespace
        );
    }
}
