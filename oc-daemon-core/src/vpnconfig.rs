//! Negotiated VPN tunnel parameters

use crate::error::{Error, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

/// VPN tunnel parameters delivered by the external OpenConnect runner
/// through the setup script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    #[serde(rename = "Device")]
    pub device: Device,
    #[serde(rename = "IPv4")]
    pub ipv4: Option<Ipv4Net>,
    #[serde(rename = "IPv6")]
    pub ipv6: Option<Ipv6Net>,
    #[serde(rename = "DNS")]
    pub dns: Dns,
    #[serde(rename = "Split")]
    pub split: Split,
}

/// Tunnel device parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MTU")]
    pub mtu: u32,
}

/// DNS parameters of the tunnel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dns {
    #[serde(rename = "DefaultDomain")]
    pub default_domain: String,
    #[serde(rename = "ServersIPv4")]
    pub servers_v4: Vec<Ipv4Addr>,
    #[serde(rename = "ServersIPv6")]
    pub servers_v6: Vec<Ipv6Addr>,
}

/// Split routing parameters of the tunnel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Split {
    #[serde(rename = "ExcludeIPv4")]
    pub exclude_v4: Vec<Ipv4Net>,
    #[serde(rename = "ExcludeIPv6")]
    pub exclude_v6: Vec<Ipv6Net>,
    #[serde(rename = "ExcludeDomains")]
    pub exclude_domains: Vec<String>,
    #[serde(rename = "ExcludeVirtualSubnetsOnlyIPv4")]
    pub exclude_virtual_subnets_only_v4: bool,
    #[serde(rename = "ExcludeDNS")]
    pub dns_excludes: Vec<String>,
}

impl VpnConfig {
    /// Returns the mapping from DNS name suffix to upstream servers for
    /// the DNS proxy. All tunnel resolvers answer for "." (the catch-all).
    pub fn remotes(&self) -> HashMap<String, Vec<String>> {
        let mut servers = Vec::new();
        for server in &self.dns.servers_v4 {
            servers.push(format!("{}:53", server));
        }
        for server in &self.dns.servers_v6 {
            servers.push(format!("[{}]:53", server));
        }

        let mut remotes = HashMap::new();
        if !servers.is_empty() {
            remotes.insert(".".to_string(), servers);
        }
        remotes
    }

    /// Returns the DNS exclude domains to watch, normalized to lowercase
    /// with a trailing dot and deduplicated.
    pub fn dns_excludes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut excludes = Vec::new();
        for domain in self
            .split
            .exclude_domains
            .iter()
            .chain(self.split.dns_excludes.iter())
        {
            let mut domain = domain.to_lowercase();
            if !domain.ends_with('.') {
                domain.push('.');
            }
            if seen.insert(domain.clone()) {
                excludes.push(domain);
            }
        }
        excludes
    }

    /// Checks the config invariant: a non-empty device name and at least
    /// one of the IPv4/IPv6 addresses.
    pub fn validate(&self) -> Result<()> {
        if self.device.name.is_empty() {
            return Err(Error::VpnConfig("device name is empty".into()));
        }
        if self.ipv4.is_none() && self.ipv6.is_none() {
            return Err(Error::VpnConfig(
                "neither IPv4 nor IPv6 address present".into(),
            ));
        }
        Ok(())
    }
}
