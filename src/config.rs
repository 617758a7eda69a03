#![forbid(unsafe_code)]

// Service configuration loaded from environment variables

use crate::media::config::{MediaConfig, WorkerConfig};
use crate::media::worker_pool::RespawnPolicy;
use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_PORT: u16 = 3003;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_GRACE_SECS: u64 = 300;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is not a valid IP address: {value}")]
    InvalidIp { name: &'static str, value: String },

    #[error("RTC port range {min}-{max} is empty")]
    EmptyPortRange { min: u16, max: u16 },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub environment: String,
    pub public_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub num_workers: usize,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub room_grace: Duration,
    pub respawn: RespawnPolicy,
    pub max_connections: usize,
}

/// Parses `name`, falling back to `default` with a warning when the value is invalid
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid {}={:?}, using default {}", name, raw, default);
                default
            }
        },
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let public_ip = match lookup("PUBLIC_IP") {
            Some(raw) => raw.trim().parse::<IpAddr>().map_err(|_| ConfigError::InvalidIp {
                name: "PUBLIC_IP",
                value: raw.clone(),
            })?,
            None => IpAddr::from([127, 0, 0, 1]),
        };

        let worker_defaults = WorkerConfig::default();
        let rtc_min_port = parse_or(&lookup, "RTC_MIN_PORT", worker_defaults.rtc_min_port);
        let rtc_max_port = parse_or(&lookup, "RTC_MAX_PORT", worker_defaults.rtc_max_port);
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::EmptyPortRange {
                min: rtc_min_port,
                max: rtc_max_port,
            });
        }

        let mut num_workers = parse_or(&lookup, "NUM_WORKERS", worker_defaults.num_workers);
        if num_workers == 0 {
            warn!("NUM_WORKERS=0 would leave no media workers, using {}", worker_defaults.num_workers);
            num_workers = worker_defaults.num_workers;
        }

        let mut max_connections = parse_or(&lookup, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let respawn_defaults = RespawnPolicy::default();
        let initial_ms = parse_or(
            &lookup,
            "WORKER_RESPAWN_DELAY_MS",
            u64::try_from(respawn_defaults.initial_delay.as_millis()).unwrap_or(u64::MAX),
        );
        let max_ms = parse_or(
            &lookup,
            "WORKER_RESPAWN_MAX_DELAY_MS",
            u64::try_from(respawn_defaults.max_delay.as_millis()).unwrap_or(u64::MAX),
        );

        Ok(Self {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT),
            environment: lookup("APP_ENV").unwrap_or_else(|| "development".to_string()),
            public_ip,
            rtc_min_port,
            rtc_max_port,
            num_workers,
            redis_url: lookup("REDIS_URL").filter(|s| !s.is_empty()),
            jwt_secret,
            room_grace: Duration::from_secs(parse_or(&lookup, "ROOM_GRACE_SECS", DEFAULT_GRACE_SECS)),
            respawn: RespawnPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms.max(initial_ms)),
            },
            max_connections,
        })
    }

    /// Media settings with this configuration's worker count, port range and
    /// announced address applied
    pub fn media_config(&self) -> MediaConfig {
        let mut media = MediaConfig::default();
        media.worker_config.num_workers = self.num_workers;
        media.worker_config.rtc_min_port = self.rtc_min_port;
        media.worker_config.rtc_max_port = self.rtc_max_port;
        media.webrtc_transport_config = media.webrtc_transport_config.with_public_ip(self.public_ip);
        media
    }
}
