use crate::configs::endpoint_config::EndpointConfig;
use crate::data_channel::DataChannelConfig;
use crate::error::Result;
use opentelemetry::metrics::Meter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const DEFAULT_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// SessionConfig provides customized parameters for one negotiated endpoint pair
#[derive(Clone)]
pub struct SessionConfig {
    pub(crate) endpoint_config: Arc<EndpointConfig>,
    pub(crate) data_channel_config: DataChannelConfig,
    pub(crate) connectivity_timeout: Duration,
    pub(crate) meter: Meter,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint_config", &self.endpoint_config)
            .field("data_channel_config", &self.data_channel_config)
            .field("connectivity_timeout", &self.connectivity_timeout)
            .finish()
    }
}

impl SessionConfig {
    /// create new session config with default endpoint config
    pub fn new() -> Result<Self> {
        Ok(Self::with_endpoint_config(Arc::new(EndpointConfig::new()?)))
    }

    /// create new session config with provided endpoint config
    pub fn with_endpoint_config(endpoint_config: Arc<EndpointConfig>) -> Self {
        Self {
            endpoint_config,
            data_channel_config: DataChannelConfig::default(),
            connectivity_timeout: DEFAULT_CONNECTIVITY_TIMEOUT,
            meter: opentelemetry::global::meter("peerlink"),
        }
    }

    /// build with provided DataChannelConfig for the locally created channel
    pub fn with_data_channel_config(mut self, data_channel_config: DataChannelConfig) -> Self {
        self.data_channel_config = data_channel_config;
        self
    }

    /// build with the bound on waiting for both channels to open
    pub fn with_connectivity_timeout(mut self, connectivity_timeout: Duration) -> Self {
        self.connectivity_timeout = connectivity_timeout;
        self
    }

    /// build with provided opentelemetry meter
    pub fn with_meter(mut self, meter: Meter) -> Self {
        self.meter = meter;
        self
    }

    pub fn endpoint_config(&self) -> &Arc<EndpointConfig> {
        &self.endpoint_config
    }

    pub fn data_channel_config(&self) -> &DataChannelConfig {
        &self.data_channel_config
    }

    pub fn connectivity_timeout(&self) -> Duration {
        self.connectivity_timeout
    }
}
