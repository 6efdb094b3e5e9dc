use crate::certificate::RTCCertificate;
use crate::error::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(50);
pub(crate) const DEFAULT_MAX_BINDING_REQUESTS: u16 = 50;

/// EndpointConfig provides customized parameters for one peer endpoint
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) certificates: Vec<RTCCertificate>,
    pub(crate) host_ips: Vec<IpAddr>,
    pub(crate) check_interval: Duration,
    pub(crate) max_binding_requests: u16,
}

impl EndpointConfig {
    /// create new endpoint config with a freshly generated certificate
    pub fn new() -> Result<Self> {
        Ok(Self::with_certificates(vec![RTCCertificate::generate()?]))
    }

    /// create new endpoint config with provided certificates
    pub fn with_certificates(certificates: Vec<RTCCertificate>) -> Self {
        Self {
            certificates,
            host_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_binding_requests: DEFAULT_MAX_BINDING_REQUESTS,
        }
    }

    /// build with the host addresses candidates are gathered on
    pub fn with_host_ips(mut self, host_ips: Vec<IpAddr>) -> Self {
        self.host_ips = host_ips;
        self
    }

    /// build with connectivity check pacing interval
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// build with the number of binding requests sent per candidate pair before giving up on it
    pub fn with_max_binding_requests(mut self, max_binding_requests: u16) -> Self {
        self.max_binding_requests = max_binding_requests;
        self
    }

    pub fn host_ips(&self) -> &[IpAddr] {
        &self.host_ips
    }
}
