//! Configuration loaded from defaults, an optional `meshroom.toml` and the
//! environment.
//!
//! Precedence: env vars (`MESHROOM__SIGNALING__URL`, ...) > `.env` > config file > defaults

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use crate::media::CaptureConstraints;
use crate::peer::types::ServerConfig;
use crate::session::SessionSettings;

/// Load the configuration. `file` is a path without extension; `meshroom`
/// when `None`. A missing file is not an error.
pub fn load(file: Option<&str>) -> Result<MeshConfig, ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        .set_default("signaling.url", "ws://localhost:5000/signal")?
        .set_default("registry.url", "http://localhost:5000/api")?
        .set_default("negotiation.timeout_secs", 30)?
        .set_default("negotiation.early_signal_limit", 64)?
        .set_default("media.width", 1280)?
        .set_default("media.height", 720)?
        .set_default("media.frame_rate", 30)?
        .set_default("media.echo_cancellation", true)?
        .set_default("media.noise_suppression", true)?
        .set_default("media.auto_gain_control", true)?
        .set_default("log.filter", "meshroom=info")?
        .add_source(config::File::with_name(file.unwrap_or("meshroom")).required(false))
        .add_source(
            config::Environment::with_prefix("MESHROOM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mesh: MeshConfig = cfg.try_deserialize()?;
    mesh.validate()?;
    Ok(mesh)
}

#[derive(Debug, Deserialize, Clone)]
pub struct MeshConfig {
    pub signaling: SignalingConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub ice: IceConfig,
    pub negotiation: NegotiationConfig,
    pub media: CaptureConstraints,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IceConfig {
    /// Empty means the public STUN defaults.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    pub timeout_secs: u64,
    pub early_signal_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub filter: String,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice.servers {
            if server.url.is_empty() {
                return Err(ConfigError::Message(format!(
                    "ICE server '{}': URL cannot be empty",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Message(format!(
                    "ICE server '{}': TURN servers require username and credential",
                    server.id
                )));
            }
        }
        if self.negotiation.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "negotiation.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ice_servers(&self) -> Vec<ServerConfig> {
        if self.ice.servers.is_empty() {
            ServerConfig::defaults()
        } else {
            self.ice.servers.clone()
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            negotiation_timeout: Duration::from_secs(self.negotiation.timeout_secs),
            early_signal_limit: self.negotiation.early_signal_limit,
            constraints: self.media.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MeshConfig {
        MeshConfig {
            signaling: SignalingConfig {
                url: "ws://relay".into(),
            },
            registry: RegistryConfig {
                url: "http://registry".into(),
                token: None,
            },
            ice: IceConfig::default(),
            negotiation: NegotiationConfig {
                timeout_secs: 30,
                early_signal_limit: 64,
            },
            media: CaptureConstraints::default(),
            log: LogConfig {
                filter: "meshroom=info".into(),
            },
        }
    }

    fn turn(username: Option<&str>) -> ServerConfig {
        ServerConfig {
            id: "turn-1".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: username.map(Into::into),
            credential: username.map(|_| "secret".into()),
        }
    }

    #[test]
    fn defaults_use_public_stun() {
        let cfg = base();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ice_servers().len(), 2);
        assert_eq!(cfg.session_settings().negotiation_timeout, Duration::from_secs(30));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut cfg = base();
        cfg.ice.servers = vec![turn(None)];
        assert!(cfg.validate().is_err());
        cfg.ice.servers = vec![turn(Some("alice"))];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_url_and_zero_timeout_are_rejected() {
        let mut cfg = base();
        let mut server = turn(Some("alice"));
        server.url.clear();
        cfg.ice.servers = vec![server];
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.negotiation.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = load(Some("does-not-exist")).unwrap();
        assert_eq!(cfg.negotiation.early_signal_limit, 64);
        assert_eq!(cfg.media.width, 1280);
    }
}
