use serde::Serialize;
use serde_json::{Map, Value};

use crate::sep2::MeterIdentity;

/// Keys a sensor payload always sets itself; metadata cannot override them.
const RESERVED_KEYS: [&str; 5] = ["entity_type", "name", "state_topic", "unique_id", "device"];

/// MQTT topics don't like spaces.
pub fn topic_safe(name: &str) -> String {
    return name.replace(' ', "_");
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub sw_version: String,
}

impl HaDevice {
    pub fn new(identity: &MeterIdentity, device_name: &str) -> Self {
        return HaDevice {
            identifiers: vec![identity.lfdi.clone()],
            name: device_name.to_string(),
            model: identity.mf_id.clone(),
            sw_version: identity.sw_version.clone(),
        }
    }
}

/// Announces the meter itself.
#[derive(Serialize, Debug)]
pub struct HaMeterDevice {
    pub name: String,
    pub device_class: String,
    pub state_topic: String,
    pub unique_id: String,
    pub device: HaDevice,
}

impl HaMeterDevice {
    pub fn new(prefix: &str, identity: &MeterIdentity, device_name: &str) -> Self {
        return HaMeterDevice {
            name: device_name.to_string(),
            device_class: "energy".to_string(),
            state_topic: format!("{prefix}/device/energy/{}", topic_safe(device_name).to_lowercase()),
            unique_id: identity.lfdi.clone(),
            device: HaDevice::new(identity, device_name),
        }
    }
}

/// Discovery payload of one sensor: its free form metadata from the endpoint
/// document plus the identifying keys Home Assistant needs.
#[derive(Serialize, Debug)]
pub struct HaComponent {
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub device: HaDevice,
    #[serde(flatten)]
    pub details: Map<String, Value>,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaComponent {
    pub fn new(prefix: &str, entity_type: &str, endpoint: &str, field: &str, details: &Map<String, Value>, device: HaDevice) -> Self {
        let base = format!("{prefix}/{entity_type}/{}/{}", topic_safe(endpoint), topic_safe(field));

        let mut details = details.clone();
        for key in RESERVED_KEYS {
            details.remove(key);
        }

        return HaComponent {
            name: format!("{endpoint} {field}"),
            state_topic: format!("{base}/state"),
            unique_id: format!("{}_{endpoint}_{field}", device.name).to_lowercase().replace(' ', "_"),
            device,
            details,
            discover_topic: format!("{base}/config"),
        }
    }
}
