use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_PREDICTION_URL: &str = "ws://localhost:8000/ws";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub prediction_service: PredictionServiceConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictionServiceConfig {
    #[serde(default = "default_prediction_url")]
    pub url: String,
}

impl Default for PredictionServiceConfig {
    fn default() -> Self {
        Self {
            url: default_prediction_url(),
        }
    }
}

fn default_prediction_url() -> String {
    DEFAULT_PREDICTION_URL.to_string()
}

impl PredictionServiceConfig {
    pub fn is_loopback(&self) -> bool {
        let rest = self.url.split_once("://").map_or(self.url.as_str(), |(_, r)| r);
        let authority = rest.split('/').next().unwrap_or_default();
        let host = match authority.strip_prefix('[') {
            Some(ipv6) => ipv6.split(']').next().unwrap_or_default(),
            None => authority.split(':').next().unwrap_or_default(),
        };
        matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0" | "")
    }
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Device,
    TestPattern,
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default)]
    pub device_index: i32,
    #[serde(default = "default_prediction_fps")]
    pub prediction_fps: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            device_index: 0,
            prediction_fps: default_prediction_fps(),
            jpeg_quality: default_jpeg_quality(),
            width: default_width(),
            height: default_height(),
        }
    }
}

fn default_prediction_fps() -> u64 {
    5
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

/// Highest rate whose capture period is still at least one millisecond.
pub const MAX_PREDICTION_FPS: u64 = 1000;

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps as f64).round() as u64
}

impl CameraConfig {
    pub fn get_prediction_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.prediction_fps)
    }

    pub fn get_capture_period(&self) -> Duration {
        Duration::from_millis(self.get_prediction_delay_ms())
    }
}

pub trait Validatable {
    fn validate(&self, environment: &Environment) -> Result<(), String>;
}

impl Validatable for CameraConfig {
    fn validate(&self, _environment: &Environment) -> Result<(), String> {
        if self.prediction_fps == 0 {
            return Err("camera.prediction_fps must be greater than zero".into());
        }
        if self.prediction_fps > MAX_PREDICTION_FPS {
            return Err(format!(
                "camera.prediction_fps must be at most {}, got {}",
                MAX_PREDICTION_FPS, self.prediction_fps
            ));
        }
        if self.source == SourceKind::TestPattern && (self.width == 0 || self.height == 0) {
            return Err("camera.width and camera.height must be non-zero".into());
        }
        Ok(())
    }
}

impl Validatable for PredictionServiceConfig {
    fn validate(&self, environment: &Environment) -> Result<(), String> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(format!(
                "prediction_service.url must be a ws:// or wss:// address, got {}",
                self.url
            ));
        }
        if self.url.starts_with("wss://") && !cfg!(feature = "tls") {
            return Err("wss:// prediction_service.url requires the `tls` feature".into());
        }
        if matches!(environment, Environment::Production) && self.is_loopback() {
            return Err(format!(
                "prediction_service.url points at a local address ({}) in production",
                self.url
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self, environment: &Environment) -> Result<(), String> {
        self.camera.validate(environment)?;
        self.prediction_service.validate(environment)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("VS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.validate(&environment) {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
