use std::sync::Arc;

use log::{error, info};
use sep2mqtt::discovery::{search_for_meter, SEARCH_TIMEOUT};
use sep2mqtt::{MeterPoller, MeterTransport, MqttBus, PollerOptions, Settings, StartupError};

async fn start() -> Result<(), StartupError> {
    let mut settings = Settings::load()?;
    if settings.meter_address_missing() {
        info!("METER_IP and METER_PORT not set, looking for the meter on the network");
        let found = search_for_meter(SEARCH_TIMEOUT).await?;
        settings.set_meter_address(found.host, found.port);
    }
    let options = PollerOptions::from_settings(&settings)?;

    let creds = settings.credentials()?;
    let transport = MeterTransport::new(&options.base_url, &creds)?;
    let bus = MqttBus::connect(&settings.mqtt)?;

    info!("Bridging meter {} to MQTT {}:{}", transport.authority(),
          settings.mqtt.host.as_deref().unwrap_or_default(), settings.mqtt.port);

    MeterPoller::new(Arc::new(transport), Arc::new(bus), options).run().await
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("LOGLEVEL").unwrap_or("info".to_string()).to_lowercase();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    if let Err(e) = start().await {
        error!("{e}");
        std::process::exit(1);
    }
}
