//! Konfiguration
//!
//! `config.json` im Konfigurationsverzeichnis der Anwendung, danach
//! Überschreibung durch Umgebungsvariablen. Fehlt die Datei, gelten die
//! Standardwerte.

use crate::call_engine::CaptureSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const ENV_SIGNALING_URL: &str = "SIGNALING_URL";
pub const ENV_ROOM: &str = "CALL_ROOM";
pub const ENV_NEGOTIATION_TIMEOUT: &str = "CALL_NEGOTIATION_TIMEOUT_SECS";

const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Relay-Adresse (http/https/ws/wss)
    pub signaling_url: String,
    pub room: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub capture: CaptureSettings,
    /// 0 = kein Timeout
    pub negotiation_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room: "default".to_string(),
            ice_servers: vec![IceServerConfig {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                username: None,
                credential: None,
            }],
            capture: CaptureSettings::default(),
            negotiation_timeout_secs: 30,
            heartbeat_interval_secs: 25,
        }
    }
}

impl CallConfig {
    /// Lädt Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "peercall", "peercall")
            .ok_or(ConfigError::NoConfigDir)?;

        Ok(proj_dirs.config_dir().join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Überschreibt Werte aus der Umgebung (`lookup` liefert die Variable)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SIGNALING_URL) {
            self.signaling_url = url;
        }
        if let Some(room) = lookup(ENV_ROOM) {
            self.room = room;
        }
        if let Some(value) = lookup(ENV_NEGOTIATION_TIMEOUT) {
            self.negotiation_timeout_secs =
                value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_NEGOTIATION_TIMEOUT,
                    value,
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "signaling_url",
                value: self.signaling_url.clone(),
            });
        }
        if self.room.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "room",
                value: self.room.clone(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_secs",
                value: "0".to_string(),
            });
        }
        if self.capture.width == 0 || self.capture.height == 0 || self.capture.fps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "capture",
                value: format!(
                    "{}x{}@{}",
                    self.capture.width, self.capture.height, self.capture.fps
                ),
            });
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0).then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();

        assert_eq!(config.signaling_url, "http://127.0.0.1:3000");
        assert_eq!(config.room, "default");
        assert_eq!(config.negotiation_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.capture, CaptureSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CallConfig::from_json_str(
            r#"{"room": "kitchen", "capture": {"fps": 30}, "negotiation_timeout_secs": 0}"#,
        )
        .unwrap();

        assert_eq!(config.room, "kitchen");
        assert_eq!(config.capture.fps, 30);
        assert_eq!(config.capture.width, 320);
        assert_eq!(config.negotiation_timeout(), None);
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CallConfig::from_json_str("{room"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("peercall-test-missing/config.json");
        assert_eq!(CallConfig::from_file(&path).unwrap(), CallConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CallConfig::default();
        config
            .apply_env(env(&[
                (ENV_SIGNALING_URL, "https://relay.example.org"),
                (ENV_ROOM, "lobby"),
                (ENV_NEGOTIATION_TIMEOUT, " 5 "),
            ]))
            .unwrap();

        assert_eq!(config.signaling_url, "https://relay.example.org");
        assert_eq!(config.room, "lobby");
        assert_eq!(config.negotiation_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_env_rejects_bad_timeout() {
        let mut config = CallConfig::default();
        let err = config
            .apply_env(env(&[(ENV_NEGOTIATION_TIMEOUT, "soon")]))
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: ENV_NEGOTIATION_TIMEOUT,
                ..
            }
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = CallConfig::default();
        config.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = CallConfig::default();
        config.room = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = CallConfig::default();
        config.capture.fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rtc_ice_servers() {
        let mut config = CallConfig::default();
        config.ice_servers.push(IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        });

        let servers = config.rtc_ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(servers[0].username, "");
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }
}
