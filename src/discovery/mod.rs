//! mDNS lookup of the meter when no address is configured

use std::net::IpAddr;
use std::time::Duration;

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::config::ConfigError;

/// Service type SEP2 meters announce themselves under.
pub const METER_SERVICE: &str = "_smartenergy._tcp.local.";
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct MeterAddress {
    pub host: String,
    pub port: u16,
}

/// First IPv4 address of a resolved service, any address otherwise.
pub fn address_from(info: &ServiceInfo) -> Option<MeterAddress> {
    let addresses = info.get_addresses();
    let ip = addresses.iter()
        .find(|a| matches!(a, IpAddr::V4(_)))
        .or_else(|| addresses.iter().next())?;

    Some(MeterAddress { host: ip.to_string(), port: info.get_port() })
}

/// Browses for the meter until one resolves or `timeout` runs out.
pub async fn search_for_meter(timeout: Duration) -> Result<MeterAddress, ConfigError> {
    let daemon = ServiceDaemon::new().map_err(|e| ConfigError::Discovery(e.to_string()))?;
    let receiver = daemon.browse(METER_SERVICE).map_err(|e| ConfigError::Discovery(e.to_string()))?;
    info!("Searching for a meter on {METER_SERVICE}");

    let search = async {
        loop {
            match receiver.recv_async().await {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    debug!("mDNS: resolved {}", info.get_fullname());
                    if let Some(address) = address_from(&info) {
                        return Ok(address);
                    }
                    warn!("mDNS: {} has no address", info.get_fullname());
                }
                Ok(_) => {}
                Err(e) => return Err(ConfigError::Discovery(e.to_string())),
            }
        }
    };

    let result = match tokio::time::timeout(timeout, search).await {
        Ok(found) => found,
        Err(_) => Err(ConfigError::DiscoveryTimeout(timeout)),
    };

    if let Err(e) = daemon.shutdown() {
        debug!("mDNS daemon shutdown: {e}");
    }

    let address = result?;
    info!("Found meter at {}:{}", address.host, address.port);
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn service(addresses: &str) -> ServiceInfo {
        ServiceInfo::new(METER_SERVICE, "meter", "meter.local.", addresses, 8081, HashMap::<String, String>::new()).unwrap()
    }

    #[test]
    fn test_ipv4_address_preferred() {
        let info = service("fe80::1,192.168.1.40");
        assert_eq!(address_from(&info), Some(MeterAddress { host: "192.168.1.40".to_string(), port: 8081 }));
    }

    #[test]
    fn test_ipv6_only_service() {
        let info = service("fe80::1");
        assert_eq!(address_from(&info).map(|a| a.host), Some("fe80::1".to_string()));
    }

    #[tokio::test]
    async fn test_search_gives_up_after_timeout() {
        let err = search_for_meter(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, ConfigError::DiscoveryTimeout(_) | ConfigError::Discovery(_)), "unexpected {err:?}");
    }
}
