pub mod ha_interface;

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;

use crate::config::{ConfigError, MqttConfig};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("MQTT client rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Unable to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Anything that can carry a message to the broker.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError>;
}

pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Creates the client and spawns its event loop. The connection itself is
    /// established (and re-established) by the event loop in the background.
    pub fn connect(config: &MqttConfig) -> Result<Self, ConfigError> {
        let host = config.host.clone().ok_or(ConfigError::Missing("MQTT_SERVER"))?;

        info!("MQTT connection starting up ({host}:{})", config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if let Some((user, pass)) = config.credentials() {
            mqttoptions.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);

        let port = config.port;
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            let mut last_error = String::new();
            let mut counter = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("[{host}:{port}] Connected to broker");
                    },
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        debug!("Publish {} acknowledged", ack.pkid);
                    },
                    Ok(_) => {},
                    Err(e) => {
                        if e.to_string() == last_error {
                            /* Rate limiting */
                            counter += 1;
                            if counter < 100 {
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                continue;
                            }
                        }

                        counter = 0;
                        error!("[{host}:{port}] Error in MQTT {:?}, reconnecting", e);
                        last_error = e.to_string();
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(MqttBus { client })
    }
}

const REQUEST_CAPACITY: usize = 10;

#[async_trait]
impl BusPublisher for MqttBus {
    /// Never waits for room in the request queue. While the broker is away
    /// the queue fills up and further messages are refused.
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        self.client.try_publish(topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Published {
        pub topic: String,
        pub payload: String,
        pub retain: bool,
    }

    /// Keeps every message; topics listed in `failing` are refused.
    #[derive(Default)]
    pub struct RecordingBus {
        pub messages: Mutex<Vec<Published>>,
        pub failing: Vec<String>,
    }

    impl RecordingBus {
        pub fn messages(&self) -> Vec<Published> {
            self.messages.lock().unwrap().clone()
        }

        pub fn on_topic(&self, topic: &str) -> Vec<Published> {
            self.messages().into_iter().filter(|m| m.topic == topic).collect()
        }
    }

    #[async_trait]
    impl BusPublisher for RecordingBus {
        async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
            if self.failing.iter().any(|t| t == topic) {
                let refused = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
                return Err(PublishError::Encode(refused));
            }
            self.messages.lock().unwrap().push(Published { topic: topic.to_string(), payload, retain });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            host: Some("127.0.0.1".to_string()),
            port: 1,
            user: Some("alice".to_string()),
            pass: Some("secret".to_string()),
            client_name: "sep2mqtt-test".to_string(),
            topic_prefix: "homeassistant".to_string(),
        }
    }

    #[test]
    fn test_connect_needs_server() {
        let mut conf = config();
        conf.host = None;
        assert!(matches!(MqttBus::connect(&conf), Err(ConfigError::Missing("MQTT_SERVER"))));
    }

    #[tokio::test]
    async fn test_publish_is_queued_without_broker() {
        let bus = MqttBus::connect(&config()).unwrap();
        bus.publish("homeassistant/sensor/x/state", "1".to_string(), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_refuses_instead_of_waiting() {
        let bus = MqttBus::connect(&config()).unwrap();

        let mut refused = 0;
        for i in 0..(REQUEST_CAPACITY * 3) {
            let sent = tokio::time::timeout(
                Duration::from_secs(3),
                bus.publish("homeassistant/sensor/x/state", i.to_string(), false),
            ).await;
            match sent {
                Ok(Ok(())) => {},
                Ok(Err(PublishError::Client(_))) => refused += 1,
                Ok(Err(e)) => panic!("unexpected error {e}"),
                Err(_) => panic!("publish {i} blocked"),
            }
        }
        assert!(refused >= REQUEST_CAPACITY);
    }
}
