//! DNS proxy configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// DNS proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsProxyConfig {
    /// Listen address of the proxy, used for both UDP and TCP.
    #[serde(rename = "Address")]
    pub address: SocketAddr,

    /// Enable the UDP listener.
    #[serde(rename = "ListenUDP")]
    pub listen_udp: bool,

    /// Enable the TCP listener.
    #[serde(rename = "ListenTCP")]
    pub listen_tcp: bool,
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4253),
            listen_udp: true,
            listen_tcp: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DnsProxyConfig::default();
        assert_eq!(config.address.to_string(), "127.0.0.1:4253");
        assert!(config.listen_udp);
        assert!(config.listen_tcp);
    }

    #[test]
    fn test_config_from_json() {
        let config: DnsProxyConfig =
            serde_json::from_str(r#"{"Address": "127.0.0.1:5353", "ListenTCP": false}"#).unwrap();
        assert_eq!(config.address.to_string(), "127.0.0.1:5353");
        assert!(config.listen_udp);
        assert!(!config.listen_tcp);
    }
}
