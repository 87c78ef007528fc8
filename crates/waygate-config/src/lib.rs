//! Gateway configuration.
//!
//! One JSON file (`waygate.json` by default) configures the whole gateway.
//! Every section defaults to production-safe values, so `waygate init`
//! writes a file that works as-is.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use waygate_core::Language;
use waygate_policy::Policy;

/// Default configuration file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "waygate.json";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    /// The file could not be read or written.
    #[error("configuration io error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid configuration JSON.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Declared npm dependencies for the bundler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NpmConfig {
    /// Package names treated as externals by the bundler.
    pub dependencies: Vec<String>,
    /// Optional lockfile path, reserved for future dependency layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<String>,
}

/// Declared pip dependencies; accepted for forward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipConfig {
    /// Requirement specifiers.
    pub requirements: Vec<String>,
    /// Pre-built wheel URLs.
    pub wheel_urls: Vec<String>,
}

/// Transport used to reach an upstream MCP server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    /// Spawn a child process and speak newline-delimited JSON-RPC.
    #[default]
    Stdio,
    /// POST JSON-RPC bodies to an HTTP endpoint.
    Http,
}

/// One upstream MCP server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpServerConfig {
    /// Unique name; also the guest-visible proxy object name.
    pub name: String,
    /// Transport flavor.
    pub transport: McpTransport,
    /// Command to spawn (stdio transport).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for the command.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Endpoint URL (http transport).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl McpServerConfig {
    /// A stdio upstream.
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransport::Stdio,
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// An http upstream.
    #[must_use]
    pub fn http(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransport::Http,
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Guest language.
    pub language: Language,
    /// npm dependency declarations.
    pub npm: NpmConfig,
    /// pip dependency declarations (not linked in this build).
    pub pip: PipConfig,
    /// Server default policy; intersected with client overrides per build.
    pub policy: Policy,
    /// Upstream MCP servers.
    pub mcps: Vec<McpServerConfig>,
    /// Idle session lifetime in milliseconds.
    pub session_ttl_ms: u64,
    /// Directory holding `signing.key` / `signing.pub`.
    pub signing_key_path: PathBuf,
    /// Capsule cache directory.
    pub cache_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            language: Language::Js,
            npm: NpmConfig::default(),
            pip: PipConfig::default(),
            policy: Policy::server_default(),
            mcps: Vec::new(),
            session_ttl_ms: 300_000,
            signing_key_path: PathBuf::from(".waygate/keys"),
            cache_dir: PathBuf::from(".waygate/capsules"),
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] when the file is absent, so the CLI can
    /// exit with its dedicated code; [`ConfigError::Invalid`] for parse
    /// failures.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Write as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let config = GatewayConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_ttl_ms, 300_000);
        assert_eq!(back.language, Language::Js);
        assert!(back.policy.network.is_some());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waygate.json");
        GatewayConfig::default().save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded.cache_dir, PathBuf::from(".waygate/capsules"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = GatewayConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn unknown_root_keys_are_rejected() {
        let err: Result<GatewayConfig, _> = serde_json::from_str(r#"{"lang":"js"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn mcps_parse_both_transports() {
        let json = r#"{
            "mcps": [
                {"name": "files", "transport": "stdio", "command": "mcp-files", "args": ["--root", "/srv"]},
                {"name": "search", "transport": "http", "endpoint": "http://localhost:9000/rpc"}
            ]
        }"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mcps.len(), 2);
        assert_eq!(config.mcps[0].transport, McpTransport::Stdio);
        assert_eq!(config.mcps[1].endpoint.as_deref(), Some("http://localhost:9000/rpc"));
    }
}
