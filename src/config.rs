//! Configuration management for CrabView
//!
//! Provides loading, saving and validation for the signaling relay, session
//! registry, reconnect policy and peer connection settings.

use crate::errors::StreamError;
use crate::webrtc::controller::{ControllerOptions, StreamDependencies};
use crate::webrtc::peer::{RTCConfiguration, RtcNegotiatorFactory};
use crate::webrtc::registry::HttpSessionRegistry;
use crate::webrtc::retry::RetryPolicy;
use crate::webrtc::signaling::WsSignalingConnector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variables override file values, e.g. `CRABVIEW__SIGNALING__URL`.
pub const ENV_PREFIX: &str = "CRABVIEW";

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CrabViewConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rtc: RTCConfiguration,
}

/// Signaling relay connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the relay (ws:// or wss://)
    pub url: String,
    /// Bearer token presented on the upgrade request
    pub auth_token: Option<String>,
    /// How long to wait for the relay's `connected` acknowledgement
    pub handshake_timeout_ms: u64,
}

/// Backend session registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL; `streams/start` and `streams/stop` are resolved against it
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/signaling".to_string(),
            auth_token: None,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            request_timeout_ms: 10_000,
        }
    }
}

fn config_error(what: &str, e: impl std::fmt::Display) -> StreamError {
    StreamError::Config(format!("{}: {}", what, e))
}

impl CrabViewConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(path).map_err(|e| config_error("Failed to read config file", e))?;

        let config: CrabViewConfig =
            toml::from_str(&contents).map_err(|e| config_error("Failed to parse config file", e))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Layer built-in defaults, an optional TOML file and `CRABVIEW__*`
    /// environment variables, in that order.
    pub fn load_layered<P: AsRef<Path>>(path: Option<P>) -> Result<Self, StreamError> {
        let defaults = toml::to_string(&Self::default())
            .map_err(|e| config_error("Failed to serialize defaults", e))?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults,
            config::FileFormat::Toml,
        ));
        if let Some(path) = path {
            let path = path.as_ref();
            log::debug!("Layering configuration file {:?}", path);
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: CrabViewConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| config_error("Failed to load configuration", e))?;
        config.validate().map_err(StreamError::Config)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), StreamError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| config_error("Failed to create config directory", e))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| config_error("Failed to serialize config", e))?;

        fs::write(path, toml_string).map_err(|e| config_error("Failed to write config file", e))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabview.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        match url::Url::parse(&self.signaling.url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(url) => {
                return Err(format!(
                    "Signaling url must use ws or wss, got {}",
                    url.scheme()
                ))
            }
            Err(e) => return Err(format!("Invalid signaling url: {}", e)),
        }
        if self.signaling.handshake_timeout_ms == 0 {
            return Err("Handshake timeout must be positive".to_string());
        }

        match url::Url::parse(&self.registry.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(format!(
                    "Registry url must use http or https, got {}",
                    url.scheme()
                ))
            }
            Err(e) => return Err(format!("Invalid registry url: {}", e)),
        }
        if self.registry.request_timeout_ms == 0 {
            return Err("Registry request timeout must be positive".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            return Err("Retry base delay must be positive".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err("Retry max delay must not be below the base delay".to_string());
        }
        if self.retry.max_retries > 20 {
            return Err("Max retries must be between 0 and 20".to_string());
        }

        if self.rtc.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err("Every ICE server needs at least one url".to_string());
        }

        Ok(())
    }

    /// Concrete registry, relay and negotiator clients for this configuration.
    pub fn stream_dependencies(&self) -> Result<StreamDependencies, StreamError> {
        let registry = HttpSessionRegistry::new(
            &self.registry.base_url,
            self.registry.auth_token.clone(),
            Duration::from_millis(self.registry.request_timeout_ms),
        )
        .map_err(|e| StreamError::Config(e.to_string()))?;

        Ok(StreamDependencies {
            registry: Arc::new(registry),
            connector: Arc::new(WsSignalingConnector::new(
                self.signaling.url.clone(),
                Duration::from_millis(self.signaling.handshake_timeout_ms),
            )),
            negotiators: Arc::new(RtcNegotiatorFactory::new(self.rtc.clone())),
        })
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            retry: self.retry,
            auth_token: self.signaling.auth_token.clone(),
        }
    }
}
