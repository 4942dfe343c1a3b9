use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{ConfigError, Settings};
use crate::endpoints::{self, EndpointDocument, EndpointError, EndpointSpec};
use crate::meter::{fetch, MeterSource, RetryPolicy, TransportError};
use crate::mqtt::BusPublisher;
use crate::sep2::{self, ExtractError, IdentityError, MeterIdentity};
use crate::telemetry::{self, SensorTopicTable, TelemetryError};

/// Anything that keeps the bridge from reaching the polling state.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Meter transport: {0}")]
    Transport(#[from] TransportError),
    #[error("Meter identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("Endpoint configuration: {0}")]
    Endpoint(#[from] EndpointError),
}

#[derive(Error, Debug)]
enum EndpointFailure {
    #[error("{0}")]
    Fetch(#[from] TransportError),
    #[error("{0}")]
    Extract(#[from] ExtractError),
    #[error("{0}")]
    Telemetry(#[from] TelemetryError),
}

#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub base_url: String,
    pub device_name: String,
    pub topic_prefix: String,
    pub polling_interval: Duration,
    pub request_timeout: Duration,
    pub identity_timeout: Duration,
    pub endpoints_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl PollerOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        return Ok(PollerOptions {
            base_url: settings.base_url()?,
            device_name: settings.meter.device_name.clone(),
            topic_prefix: settings.mqtt.topic_prefix.trim_end_matches('/').to_string(),
            polling_interval: settings.polling_interval(),
            request_timeout: settings.request_timeout(),
            identity_timeout: settings.identity_timeout(),
            endpoints_dir: settings.meter.endpoints_dir.clone(),
            retry: RetryPolicy::default(),
        })
    }
}

/// An endpoint together with the state topics its discovery bound.
#[derive(Debug, Clone)]
pub struct BoundEndpoint {
    pub spec: EndpointSpec,
    pub topics: SensorTopicTable,
}

#[derive(Debug, Clone)]
pub enum PollState {
    Initializing,
    Polling { identity: MeterIdentity, endpoints: Vec<BoundEndpoint> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub endpoints_ok: usize,
    pub endpoints_failed: usize,
    pub values_published: usize,
}

pub struct MeterPoller<S: MeterSource + ?Sized, B: BusPublisher + ?Sized> {
    source: Arc<S>,
    bus: Arc<B>,
    options: PollerOptions,
    state: PollState,
}

impl<S: MeterSource + ?Sized, B: BusPublisher + ?Sized> MeterPoller<S, B> {
    pub fn new(source: Arc<S>, bus: Arc<B>, options: PollerOptions) -> Self {
        return MeterPoller { source, bus, options, state: PollState::Initializing }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Resolves the meter, loads the matching endpoint document and announces
    /// every sensor. On success the poller is in the polling state.
    pub async fn initialize(&mut self) -> Result<(), StartupError> {
        let opts = &self.options;
        let identity = sep2::resolve(self.source.as_ref(), &opts.base_url, opts.identity_timeout, &opts.retry).await?;

        let variant = identity.variant();
        info!("Firmware {} uses the {} endpoint set", identity.sw_version, variant.file_name());
        let document = EndpointDocument::load(variant, opts.endpoints_dir.as_deref())?;
        let specs = endpoints::build(&document, &opts.base_url);

        if let Err(e) = telemetry::send_device_discovery(self.bus.as_ref(), &identity, &opts.device_name, &opts.topic_prefix).await {
            error!("Unable to announce the meter device: {e}");
        }

        let mut bound = Vec::with_capacity(specs.len());
        for spec in specs {
            let topics = telemetry::send_discovery(self.bus.as_ref(), &spec, &identity, &opts.device_name, &opts.topic_prefix).await;
            bound.push(BoundEndpoint { spec, topics });
        }

        info!("Polling {} endpoints every {}s", bound.len(), opts.polling_interval.as_secs());
        self.state = PollState::Polling { identity, endpoints: bound };
        Ok(())
    }

    async fn poll_endpoint(&self, endpoint: &BoundEndpoint) -> Result<usize, EndpointFailure> {
        let raw = fetch(self.source.as_ref(), &endpoint.spec.url, self.options.request_timeout, &self.options.retry).await?;
        let reading = sep2::extract(&raw, &endpoint.spec.tags)?;
        if reading.is_empty() {
            warn!("{}: no known elements in response", endpoint.spec.name);
        }
        Ok(telemetry::send_state(self.bus.as_ref(), &endpoint.topics, &reading).await?)
    }

    /// Polls every endpoint once, in order. A failing endpoint does not keep
    /// the others from being polled.
    pub async fn poll_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let PollState::Polling { endpoints, .. } = &self.state else {
            warn!("Poll cycle requested before the meter was resolved");
            return report;
        };

        for endpoint in endpoints {
            match self.poll_endpoint(endpoint).await {
                Ok(count) => {
                    report.endpoints_ok += 1;
                    report.values_published += count;
                }
                Err(e) => {
                    report.endpoints_failed += 1;
                    error!("{} ({}) failed: {e}", endpoint.spec.name, endpoint.spec.url);
                }
            }
        }

        debug!("Cycle done: {report:?}");
        report
    }

    /// Initializes, then polls forever. The first cycle starts one interval
    /// after initialization.
    pub async fn run(mut self) -> Result<(), StartupError> {
        self.initialize().await?;

        let period = self.options.polling_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.poll_cycle().await;
        }
    }
}
