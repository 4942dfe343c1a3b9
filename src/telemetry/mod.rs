use std::collections::BTreeMap;

use log::{debug, error, info};
use thiserror::Error;

use crate::endpoints::EndpointSpec;
use crate::mqtt::ha_interface::{HaComponent, HaDevice, HaMeterDevice};
use crate::mqtt::{BusPublisher, PublishError};
use crate::sep2::{MeterIdentity, ReadingResult};

#[derive(Error, Debug, PartialEq)]
pub enum TelemetryError {
    #[error("No state topic was discovered for {}", .0.join(", "))]
    UnregisteredFields(Vec<String>),
}

/// Reading key to state topic, filled by discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorTopicTable {
    topics: BTreeMap<String, String>,
}

impl SensorTopicTable {
    pub fn topic(&self, field: &str) -> Option<&str> {
        self.topics.get(field).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    fn bind(&mut self, field: String, topic: String) {
        self.topics.insert(field, topic);
    }
}

/// Announces the meter as a Home Assistant energy device.
pub async fn send_device_discovery<B>(bus: &B, identity: &MeterIdentity, device_name: &str, prefix: &str) -> Result<(), PublishError>
where
    B: BusPublisher + ?Sized,
{
    let device = HaMeterDevice::new(prefix, identity, device_name);
    let payload = serde_json::to_string(&device)?;

    bus.publish(&device.state_topic, payload, true).await?;
    info!("Announced meter {} on {}", identity.lfdi, device.state_topic);
    Ok(())
}

/// Publishes one retained discovery message per sensor of `endpoint` and
/// returns where each sensor's state goes. Sensors whose discovery failed to
/// publish are bound all the same.
pub async fn send_discovery<B>(bus: &B, endpoint: &EndpointSpec, identity: &MeterIdentity, device_name: &str, prefix: &str) -> SensorTopicTable
where
    B: BusPublisher + ?Sized,
{
    let mut table = SensorTopicTable::default();

    for field in endpoint.tags.fields() {
        let details = &field.tag.details;
        let cmp = HaComponent::new(prefix, &details.entity_type, &endpoint.name, &field.key,
                                   &details.extra, HaDevice::new(identity, device_name));

        let published = match serde_json::to_string(&cmp) {
            Ok(payload) => bus.publish(&cmp.discover_topic, payload, true).await,
            Err(e) => Err(e.into()),
        };
        match published {
            Ok(()) => debug!("Discovery sent to {}", cmp.discover_topic),
            Err(e) => error!("Unable to send discovery for {} {}: {e}", endpoint.name, field.key),
        }

        table.bind(field.key, cmp.state_topic);
    }

    info!("{}: {} sensors announced", endpoint.name, table.len());
    table
}

/// Publishes every reading value to its discovered state topic and returns
/// how many were accepted by the bus. Values without a topic are reported
/// after the others went out.
pub async fn send_state<B>(bus: &B, table: &SensorTopicTable, reading: &ReadingResult) -> Result<usize, TelemetryError>
where
    B: BusPublisher + ?Sized,
{
    let mut published = 0;
    let mut unregistered = Vec::new();

    for (field, value) in reading {
        let Some(topic) = table.topic(field) else {
            error!("Reading {field} has no discovered state topic");
            unregistered.push(field.clone());
            continue;
        };

        match bus.publish(topic, value.clone(), false).await {
            Ok(()) => {
                debug!("{topic} <- {value}");
                published += 1;
            }
            Err(e) => error!("Unable to publish {field} to {topic}: {e}"),
        }
    }

    if unregistered.is_empty() {
        Ok(published)
    } else {
        Err(TelemetryError::UnregisteredFields(unregistered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{build, EndpointDocument, TagSet};
    use crate::mqtt::testing::RecordingBus;
    use serde_json::{json, Value};

    fn identity() -> MeterIdentity {
        MeterIdentity { lfdi: "3E4F45AB".to_string(), sw_version: "2.7.0".to_string(), mf_id: "37384".to_string() }
    }

    fn power_endpoint() -> EndpointSpec {
        EndpointSpec {
            name: "power".to_string(),
            path: "/p".to_string(),
            url: "https://meter:8081/p".to_string(),
            tags: TagSet::flat([("InstantaneousDemand", "value")]),
        }
    }

    fn reading(pairs: &[(&str, &str)]) -> ReadingResult {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_state_goes_to_discovered_topic() {
        let bus = RecordingBus::default();
        let table = send_discovery(&bus, &power_endpoint(), &identity(), "Xcel Itron 5", "homeassistant").await;

        let topic = table.topic("InstantaneousDemand").unwrap().to_string();
        assert_eq!(topic, "homeassistant/sensor/power/InstantaneousDemand/state");

        let sent = send_state(&bus, &table, &reading(&[("InstantaneousDemand", "2500")])).await;
        assert_eq!(sent, Ok(1));

        let states = bus.on_topic(&topic);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].payload, "2500");
        assert!(!states[0].retain);
    }

    #[tokio::test]
    async fn test_state_before_discovery_is_a_consistency_error() {
        let bus = RecordingBus::default();
        let empty = SensorTopicTable::default();

        let err = send_state(&bus, &empty, &reading(&[("InstantaneousDemand", "2500")])).await.unwrap_err();
        assert_eq!(err, TelemetryError::UnregisteredFields(vec!["InstantaneousDemand".to_string()]));
        assert!(bus.messages().is_empty());
    }

    #[tokio::test]
    async fn test_known_fields_still_published_next_to_unknown() {
        let bus = RecordingBus::default();
        let table = send_discovery(&bus, &power_endpoint(), &identity(), "Xcel Itron 5", "homeassistant").await;
        let before = bus.messages().len();

        let result = send_state(&bus, &table, &reading(&[("InstantaneousDemand", "1"), ("Stray", "2")])).await;
        assert_eq!(result, Err(TelemetryError::UnregisteredFields(vec!["Stray".to_string()])));
        assert_eq!(bus.messages().len(), before + 1);
    }

    #[tokio::test]
    async fn test_publish_failures_are_skipped() {
        let bus = RecordingBus {
            failing: vec!["homeassistant/sensor/power/InstantaneousDemand/state".to_string()],
            ..Default::default()
        };
        let table = send_discovery(&bus, &power_endpoint(), &identity(), "Xcel Itron 5", "homeassistant").await;

        let sent = send_state(&bus, &table, &reading(&[("InstantaneousDemand", "2500")])).await;
        assert_eq!(sent, Ok(0));
    }

    #[tokio::test]
    async fn test_discovery_for_documented_endpoint() {
        let doc = EndpointDocument::from_yaml(r#"
- Current Summation Received:
    url: "/upt/1/mr/2/r"
    tags:
      value:
        entity_type: sensor
        device_class: energy
        unit_of_measurement: Wh
        state_class: total_increasing
      timePeriod:
        - duration:
            entity_type: sensor
            unit_of_measurement: s
        - start:
            entity_type: sensor
"#).unwrap();
        let endpoints = build(&doc, "https://10.0.0.5:8081");
        let bus = RecordingBus::default();

        let table = send_discovery(&bus, &endpoints[0], &identity(), "Xcel Itron 5", "homeassistant").await;
        assert_eq!(table.len(), 3);
        assert_eq!(table.topic("timePeriodduration"),
                   Some("homeassistant/sensor/Current_Summation_Received/timePeriodduration/state"));

        let messages = bus.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.retain && m.topic.ends_with("/config")));
        assert_eq!(messages[0].topic, "homeassistant/sensor/Current_Summation_Received/value/config");

        let value = bus.on_topic("homeassistant/sensor/Current_Summation_Received/value/config");
        let payload: Value = serde_json::from_str(&value[0].payload).unwrap();
        assert_eq!(payload["name"], "Current Summation Received value");
        assert_eq!(payload["unique_id"], "xcel_itron_5_current_summation_received_value");
        assert_eq!(payload["unit_of_measurement"], "Wh");
        assert_eq!(payload["device"], json!({
            "identifiers": ["3E4F45AB"],
            "name": "Xcel Itron 5",
            "model": "37384",
            "sw_version": "2.7.0",
        }));
        assert!(payload.get("entity_type").is_none());
    }

    #[tokio::test]
    async fn test_device_discovery() {
        let bus = RecordingBus::default();
        send_device_discovery(&bus, &identity(), "Xcel Itron 5", "homeassistant").await.unwrap();

        let messages = bus.on_topic("homeassistant/device/energy/xcel_itron_5");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].retain);
        let payload: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(payload["name"], "Xcel Itron 5");
        assert_eq!(payload["unique_id"], "3E4F45AB");
    }
}
