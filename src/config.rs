//! Runtime configuration
//!
//! Defaults match a local Janus deployment with the demo video room and a
//! processing host listening on 127.0.0.1:6000. A JSON file can override any
//! part of it, and a handful of environment variables override the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RelayError, RelayResult};
use crate::model::codec::VideoCodec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub room: RoomConfig,
    /// Where the gateway should mirror our stream; `null` skips forwarding
    pub forward: Option<ForwardConfig>,
    pub subscribe: SubscribeTarget,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub keepalive_secs: u64,
    /// Maximum number of events returned by one long-poll
    pub maxev: u32,
    /// How long a step may wait for the gateway; 0 waits forever
    pub step_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub id: u64,
    pub display: String,
    pub pin: Option<String>,
    /// Administrative secret, required by rooms that protect rtp_forward
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub host: String,
    pub port: u16,
    pub codec: VideoCodec,
    pub payload_type: u8,
}

/// How the processed stream is received back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "lowercase")]
pub enum SubscribeTarget {
    /// Watch a streaming plugin mountpoint fed by the processing host
    Streaming {
        mountpoint: u64,
        #[serde(default)]
        pin: Option<String>,
    },
    /// Subscribe to a room feed; without a feed, our own publisher id
    Room {
        #[serde(default)]
        feed: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// IVF file played as the local camera
    pub source: PathBuf,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// IVF file the local feed is rendered into; unset logs frames only
    pub local_surface: Option<PathBuf>,
    /// IVF file the processed feed is rendered into; unset logs frames only
    pub remote_surface: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            room: RoomConfig::default(),
            forward: Some(ForwardConfig::default()),
            subscribe: SubscribeTarget::default(),
            media: MediaConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8088/janus".to_string(),
            keepalive_secs: 25,
            maxev: 10,
            step_timeout_secs: 30,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            id: 1234,
            display: random_display_name(),
            pin: None,
            secret: None,
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6000,
            codec: VideoCodec::Vp9,
            payload_type: 96,
        }
    }
}

impl Default for SubscribeTarget {
    fn default() -> Self {
        SubscribeTarget::Streaming {
            mountpoint: 1,
            pin: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("camera.ivf"),
            codec: VideoCodec::Vp9,
            width: 1280,
            height: 720,
            local_surface: Some(PathBuf::from("local.ivf")),
            remote_surface: Some(PathBuf::from("remote.ivf")),
        }
    }
}

fn random_display_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("user{suffix}")
}

impl Config {
    /// Load the configuration: defaults, then the optional JSON file, then
    /// environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let text = fs::read_to_string(path).map_err(|e| {
                    RelayError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&text)?
            }
            None => Config::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `JANUS_*` and `FORWARD_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> RelayResult<()> {
        if let Some(url) = lookup("JANUS_URL") {
            self.gateway.url = url;
        }
        if let Some(room) = lookup("JANUS_ROOM") {
            self.room.id = room
                .parse()
                .map_err(|_| RelayError::Config(format!("JANUS_ROOM is not a number: {room}")))?;
        }
        if let Some(pin) = lookup("JANUS_PIN") {
            self.room.pin = Some(pin);
        }
        if let Some(secret) = lookup("JANUS_SECRET") {
            self.room.secret = Some(secret);
        }
        if let Some(display) = lookup("JANUS_DISPLAY") {
            self.room.display = display;
        }

        let host = lookup("FORWARD_HOST");
        let port = lookup("FORWARD_PORT");
        if host.is_some() || port.is_some() {
            let forward = self.forward.get_or_insert_with(ForwardConfig::default);
            if let Some(host) = host {
                forward.host = host;
            }
            if let Some(port) = port {
                forward.port = port.parse().map_err(|_| {
                    RelayError::Config(format!("FORWARD_PORT is not a port: {port}"))
                })?;
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.gateway.url.trim().is_empty() {
            return Err(RelayError::Config("gateway url is empty".into()));
        }

        if let Some(forward) = &self.forward {
            if forward.port == 0 {
                return Err(RelayError::Config("forward port must not be 0".into()));
            }
            if !(96..=127).contains(&forward.payload_type) {
                return Err(RelayError::Config(format!(
                    "payload type {} is outside the dynamic range 96-127",
                    forward.payload_type
                )));
            }
        }

        if self.media.codec.fourcc().is_none() {
            return Err(RelayError::Config(format!(
                "{} cannot be read from an IVF source",
                self.media.codec
            )));
        }

        Ok(())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        match self.gateway.step_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.gateway.keepalive_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();

        config.validate().unwrap();
        assert_eq!(config.room.id, 1234);
        assert!(config.room.display.starts_with("user"));
        assert_eq!(config.room.display.len(), 14);
        assert_eq!(config.forward.unwrap().port, 6000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"room": {{"id": 99, "display": "alice"}}, "forward": null,
                "subscribe": {{"via": "room"}}}}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.room.id, 99);
        assert_eq!(config.room.display, "alice");
        assert_eq!(config.forward, None);
        assert_eq!(config.subscribe, SubscribeTarget::Room { feed: None });
        assert_eq!(config.gateway.url, "http://localhost:8088/janus");
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("JANUS_URL", "http://gw:8088/janus"),
            ("JANUS_ROOM", "5"),
            ("JANUS_SECRET", "adminpwd"),
            ("FORWARD_PORT", "7000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config {
            forward: None,
            ..Config::default()
        };
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.gateway.url, "http://gw:8088/janus");
        assert_eq!(config.room.id, 5);
        assert_eq!(config.room.secret.as_deref(), Some("adminpwd"));
        let forward = config.forward.unwrap();
        assert_eq!(forward.port, 7000);
        assert_eq!(forward.host, "127.0.0.1");
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(|k| (k == "JANUS_ROOM").then(|| "lobby".to_string()))
            .is_err());

        let mut config = Config::default();
        config.forward.as_mut().unwrap().payload_type = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.media.codec = VideoCodec::H264;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut config = Config::default();
        config.gateway.step_timeout_secs = 0;
        assert_eq!(config.step_timeout(), None);
    }
}
