use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Meter discovery failed: {0}")]
    Discovery(String),
    #[error("No meter answered on mDNS within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("Could not find cert and key credentials (set CERT_PATH and KEY_PATH or provide certs/.cert.pem and certs/.key.pem)")]
    CredentialsNotFound,
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "sep2mqtt".to_string() }
fn mqtt_topic_prefix_default() -> String { return "homeassistant".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_topic_prefix_default")]
    pub topic_prefix: String,
}

impl MqttConfig {
    /// Username and password, only when both are configured.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.user, &self.pass) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

fn meter_device_name_default() -> String { return "Xcel Itron 5".to_string() }
fn meter_polling_rate_default() -> u64 { return 5 }
fn meter_request_timeout_default() -> u64 { return 15 }
fn meter_identity_timeout_default() -> u64 { return 4 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MeterConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default="meter_device_name_default")]
    pub device_name: String,
    #[serde(default="meter_polling_rate_default")]
    pub polling_rate: u64,              // Seconds between poll cycles
    #[serde(default="meter_request_timeout_default")]
    pub request_timeout: u64,           // Seconds per endpoint request
    #[serde(default="meter_identity_timeout_default")]
    pub identity_timeout: u64,          // Seconds for the /sdev/sdi request
    #[serde(default)]
    pub endpoints_dir: Option<PathBuf>, // Overrides the built-in endpoint documents
}

fn mqtt_default() -> MqttConfig {
    return MqttConfig {
        host: None,
        port: mqtt_port_default(),
        user: None,
        pass: None,
        client_name: mqtt_client_name_default(),
        topic_prefix: mqtt_topic_prefix_default(),
    }
}

fn meter_default() -> MeterConfig {
    return MeterConfig {
        host: None,
        port: None,
        cert_path: None,
        key_path: None,
        device_name: meter_device_name_default(),
        polling_rate: meter_polling_rate_default(),
        request_timeout: meter_request_timeout_default(),
        identity_timeout: meter_identity_timeout_default(),
        endpoints_dir: None,
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Settings {
    #[serde(default="meter_default")]
    pub meter: MeterConfig,
    #[serde(default="mqtt_default")]
    pub mqtt: MqttConfig,
}

impl Default for Settings {
    fn default() -> Self {
        return Settings { meter: meter_default(), mqtt: mqtt_default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub cert: PathBuf,
    pub key: PathBuf,
}

const CONFIG_PATHS: [&str; 2] = ["config/sep2mqtt.yaml", "sep2mqtt.yaml"];
const DEFAULT_CERT: &str = "certs/.cert.pem";
const DEFAULT_KEY: &str = "certs/.key.pem";

impl Settings {
    /// Reads the optional config file, then lets the environment override it.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match CONFIG_PATHS.iter().map(Path::new).find(|p| p.is_file()) {
            Some(path) => {
                info!("Loading settings from {}", path.display());
                Self::from_file(path)?
            }
            None => {
                debug!("No config file found, using environment only");
                Settings::default()
            }
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(contents)?)
    }

    /// Environment variables win over file values. Empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("METER_IP") { self.meter.host = Some(v); }
        if let Some(v) = get("METER_PORT") { self.meter.port = Some(parse_num("METER_PORT", &v)?); }
        if let Some(v) = get("CERT_PATH") { self.meter.cert_path = Some(PathBuf::from(v)); }
        if let Some(v) = get("KEY_PATH") { self.meter.key_path = Some(PathBuf::from(v)); }
        if let Some(v) = get("DEVICE_NAME") { self.meter.device_name = v; }
        if let Some(v) = get("POLLING_RATE") { self.meter.polling_rate = parse_num("POLLING_RATE", &v)?; }
        if let Some(v) = get("ENDPOINTS_DIR") { self.meter.endpoints_dir = Some(PathBuf::from(v)); }

        if let Some(v) = get("MQTT_SERVER") { self.mqtt.host = Some(v); }
        if let Some(v) = get("MQTT_PORT") { self.mqtt.port = parse_num("MQTT_PORT", &v)?; }
        if let Some(v) = get("MQTT_USER") { self.mqtt.user = Some(v); }
        if let Some(v) = get("MQTT_PASSWORD") { self.mqtt.pass = Some(v); }
        if let Some(v) = get("MQTT_CLIENT_NAME") { self.mqtt.client_name = v; }
        if let Some(v) = get("MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = v.trim_end_matches('/').to_string();
        }

        Ok(())
    }

    /// A missing meter address is allowed here, it can still be discovered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Missing("MQTT_SERVER"));
        }
        if self.meter.polling_rate == 0 {
            return Err(ConfigError::InvalidValue { key: "POLLING_RATE", value: "0".to_string() });
        }
        Ok(())
    }

    /// True unless both meter host and port are configured.
    pub fn meter_address_missing(&self) -> bool {
        self.meter.host.as_deref().unwrap_or("").is_empty() || self.meter.port.is_none()
    }

    pub fn set_meter_address(&mut self, host: String, port: u16) {
        self.meter.host = Some(host);
        self.meter.port = Some(port);
    }

    /// `https://<host>:<port>` of the meter.
    pub fn base_url(&self) -> Result<String, ConfigError> {
        let host = self.meter.host.as_deref().ok_or(ConfigError::Missing("METER_IP"))?;
        let port = self.meter.port.ok_or(ConfigError::Missing("METER_PORT"))?;
        Ok(format!("https://{host}:{port}"))
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.meter.polling_rate)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.meter.request_timeout)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.meter.identity_timeout)
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        self.credentials_in(Path::new("."))
    }

    /// Configured paths first, then the hidden files under `<base>/certs/`.
    pub fn credentials_in(&self, base: &Path) -> Result<Credentials, ConfigError> {
        if let (Some(cert), Some(key)) = (&self.meter.cert_path, &self.meter.key_path) {
            return Ok(Credentials { cert: cert.clone(), key: key.clone() });
        }

        let cert = base.join(DEFAULT_CERT);
        let key = base.join(DEFAULT_KEY);
        if cert.is_file() && key.is_file() {
            debug!("Using credentials from {}", base.join("certs").display());
            return Ok(Credentials { cert, key });
        }

        Err(ConfigError::CredentialsNotFound)
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue { key, value: value.to_string() })
}
