use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::BallTrackError;
use crate::types::{Frame, PixelFormat, Resolution};

pub const CONFIG_PATH_ENV: &str = "BALLTRACK_CONFIG";
pub const SIGNALING_HOST_ENV: &str = "BALLTRACK_SIGNALING_HOST";
pub const SIGNALING_PORT_ENV: &str = "BALLTRACK_SIGNALING_PORT";
pub const MAX_TICKS_ENV: &str = "BALLTRACK_MAX_TICKS";

// MARK: - SessionConfig

/// Everything both peers need to agree on or tune.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub scene: SceneConfig,
    pub analysis: AnalysisConfig,
}

impl SessionConfig {
    /// Defaults, overlaid by the JSON file named in `BALLTRACK_CONFIG`, overlaid
    /// by the individual environment overrides.
    pub fn load() -> Result<Self, BallTrackError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, BallTrackError> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw).map_err(|e| BallTrackError::ConfigurationInvalid {
            reason: format!("{}: {e}", path.display()),
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Applies overrides from `lookup` (the process environment in production).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), BallTrackError> {
        if let Some(host) = lookup(SIGNALING_HOST_ENV) {
            debug!("{} override: {}", SIGNALING_HOST_ENV, host);
            self.signaling.host = host;
        }
        if let Some(port) = lookup(SIGNALING_PORT_ENV) {
            self.signaling.port = port.parse().map_err(|_| BallTrackError::ConfigurationInvalid {
                reason: format!("{SIGNALING_PORT_ENV}={port} is not a port number"),
            })?;
        }
        if let Some(ticks) = lookup(MAX_TICKS_ENV) {
            let ticks = ticks.parse().map_err(|_| BallTrackError::ConfigurationInvalid {
                reason: format!("{MAX_TICKS_ENV}={ticks} is not a tick count"),
            })?;
            self.scene.max_ticks = Some(ticks);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BallTrackError> {
        let invalid = |reason: &str| {
            Err(BallTrackError::ConfigurationInvalid { reason: reason.to_owned() })
        };
        let scene = &self.scene;
        if scene.width == 0 || scene.height == 0 {
            return invalid("scene dimensions must be non-zero");
        }
        if Frame::buffer_len(scene.width, scene.height, PixelFormat::Bgr24).is_none() {
            return invalid("scene dimensions are too large");
        }
        if scene.fps == 0 {
            return invalid("scene fps must be non-zero");
        }
        if scene.radius == 0 || 2 * scene.radius >= scene.width.min(scene.height) {
            return invalid("ball radius must fit inside the scene");
        }
        if self.analysis.queue_capacity == 0 {
            return invalid("analysis queue capacity must be non-zero");
        }
        if self.media.frame_buffer == 0 {
            return invalid("media frame buffer must be non-zero");
        }
        if let Some(url) = self.media.ice_servers.iter().find(|u| !is_ice_url(u)) {
            return invalid(&format!("ice server {url:?} is not a stun:, turn: or turns: URL"));
        }
        Ok(())
    }
}

// MARK: - SignalingConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    #[serde(alias = "connectAttempts")]
    pub connect_attempts: u32,
    #[serde(alias = "retryDelayMs")]
    pub retry_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            connect_attempts: 20,
            retry_delay_ms: 250,
        }
    }
}

impl SignalingConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// MARK: - MediaConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// STUN/TURN URLs. Empty keeps the session to host candidates.
    #[serde(alias = "iceServers")]
    pub ice_servers: Vec<String>,
    /// Gather loopback candidates too, so two peers on one host connect
    /// without a routable interface.
    #[serde(alias = "includeLoopback")]
    pub include_loopback: bool,
    /// Public address announced instead of the host address (1:1 NAT).
    #[serde(alias = "natIp")]
    pub nat_ip: Option<String>,
    /// Frames buffered on either side of the video track before
    /// `write_frame` waits.
    #[serde(alias = "frameBuffer")]
    pub frame_buffer: usize,
    /// ICE gives up on a silent peer after this long.
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: true,
            nat_ip: None,
            frame_buffer: 8,
            connect_timeout_ms: 5_000,
        }
    }
}

fn is_ice_url(url: &str) -> bool {
    ["stun:", "turn:", "turns:"].iter().any(|scheme| url.starts_with(scheme))
}

impl MediaConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// MARK: - SceneConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    pub radius: u32,
    #[serde(alias = "startX")]
    pub start_x: i32,
    #[serde(alias = "startY")]
    pub start_y: i32,
    #[serde(alias = "velocityX")]
    pub velocity_x: i32,
    #[serde(alias = "velocityY")]
    pub velocity_y: i32,
    pub fps: u32,
    /// Stop producing after this many ticks; run until stopped when unset.
    #[serde(alias = "maxTicks")]
    pub max_ticks: Option<u64>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            radius: 20,
            start_x: 320,
            start_y: 240,
            velocity_x: 2,
            velocity_y: 3,
            fps: 30,
            max_ticks: None,
        }
    }
}

impl SceneConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Interval between ticks in microseconds.
    pub fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.fps.max(1) as u64
    }
}

// MARK: - AnalysisConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    #[serde(alias = "queueCapacity")]
    pub queue_capacity: usize,
    /// Smallest region, in pixels, accepted as the object.
    #[serde(alias = "minArea")]
    pub min_area: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { queue_capacity: 64, min_area: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "signaling": {"host": "10.0.0.2", "port": 9000, "connectAttempts": 3},
            "scene": {"startX": 100, "velocityY": -4, "maxTicks": 100},
            "analysis": {"queueCapacity": 4}
        }"#;

        let cfg: SessionConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.signaling.addr(), "10.0.0.2:9000");
        assert_eq!(cfg.signaling.connect_attempts, 3);
        assert_eq!(cfg.scene.start_x, 100);
        assert_eq!(cfg.scene.velocity_y, -4);
        assert_eq!(cfg.scene.max_ticks, Some(100));
        assert_eq!(cfg.scene.width, 640);
        assert_eq!(cfg.analysis.queue_capacity, 4);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{
            "media": {"ice_servers": ["stun:stun.l.google.com:19302"], "nat_ip": "203.0.113.9", "frame_buffer": 2},
            "scene": {"fps": 60, "max_ticks": null}
        }"#;

        let cfg: SessionConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.media.ice_servers, vec!["stun:stun.l.google.com:19302".to_owned()]);
        assert_eq!(cfg.media.nat_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(cfg.media.frame_buffer, 2);
        assert!(cfg.media.include_loopback);
        assert_eq!(cfg.scene.fps, 60);
        assert_eq!(cfg.scene.frame_interval_us(), 16_666);
        assert!(cfg.scene.max_ticks.is_none());
    }

    #[test]
    fn env_overrides_signaling_address() {
        let mut cfg = SessionConfig::default();
        cfg.apply_env(|key| match key {
            SIGNALING_HOST_ENV => Some("192.168.1.7".into()),
            SIGNALING_PORT_ENV => Some("7000".into()),
            MAX_TICKS_ENV => Some("100".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.signaling.addr(), "192.168.1.7:7000");
        assert_eq!(cfg.scene.max_ticks, Some(100));
    }

    #[test]
    fn env_rejects_bad_port() {
        let mut cfg = SessionConfig::default();
        let err = cfg
            .apply_env(|key| (key == SIGNALING_PORT_ENV).then(|| "http".to_owned()))
            .unwrap_err();
        assert!(matches!(err, BallTrackError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn validate_catches_oversized_ball() {
        let mut cfg = SessionConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.scene.radius = 300;
        assert!(cfg.validate().is_err());
        cfg.scene.radius = 20;
        cfg.analysis.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_ice_urls() {
        let mut cfg = SessionConfig::default();
        cfg.media.ice_servers = vec!["turns:relay.example:5349".into()];
        assert!(cfg.validate().is_ok());
        cfg.media.ice_servers.push("http://relay.example".into());
        assert!(matches!(cfg.validate(), Err(BallTrackError::ConfigurationInvalid { .. })));
    }
}
