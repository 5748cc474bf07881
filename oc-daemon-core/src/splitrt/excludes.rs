//! Exclude address bookkeeping

use ipnet::{IpNet, Ipv4Net};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Minimum lifetime of a DNS-learned exclude.
const MIN_TTL: Duration = Duration::from_secs(300);

/// DNS-learned exclude addresses with per-entry expiry.
pub(crate) struct DynamicExcludes {
    entries: HashMap<IpAddr, Instant>,
}

impl DynamicExcludes {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Inserts or refreshes an address. The entry expires at
    /// `now + max(ttl, 300 s)`; a refresh keeps the later expiry.
    /// Returns true when the address was not present before.
    pub(crate) fn add(&mut self, addr: IpAddr, ttl: u32) -> bool {
        let expiry = Instant::now() + MIN_TTL.max(Duration::from_secs(u64::from(ttl)));
        match self.entries.get_mut(&addr) {
            Some(entry) => {
                if expiry > *entry {
                    *entry = expiry;
                }
                false
            }
            None => {
                self.entries.insert(addr, expiry);
                true
            }
        }
    }

    /// Reports whether any entry has expired.
    pub(crate) fn has_expired(&self) -> bool {
        let now = Instant::now();
        self.entries.values().any(|expiry| *expiry <= now)
    }

    /// Drops expired entries.
    pub(crate) fn prune(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    /// Returns the live addresses.
    pub(crate) fn live(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(move |(_, expiry)| **expiry > now)
            .map(|(addr, _)| *addr)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, addr: &IpAddr) -> bool {
        self.entries.contains_key(addr)
    }
}

/// Reports whether a v4 exclude lies in one of the virtual subnet ranges
/// (RFC 6598 carrier-grade NAT or link-local).
pub(crate) fn is_virtual_subnet_v4(net: &Ipv4Net) -> bool {
    let octets = net.network().octets();
    let cgnat = octets[0] == 100 && (64..128).contains(&octets[1]) && net.prefix_len() >= 10;
    let link_local = octets[0] == 169 && octets[1] == 254 && net.prefix_len() >= 16;
    cgnat || link_local
}

/// Parses the local network prefixes out of `ip -o address show` output,
/// skipping the loopback and the tunnel device.
pub(crate) fn parse_local_networks(output: &str, skip_device: &str) -> Vec<IpNet> {
    let mut networks = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }
        let device = tokens[1];
        if device == skip_device || device == "lo" {
            continue;
        }
        if let Ok(net) = tokens[3].parse::<IpNet>() {
            networks.push(net.trunc());
        }
    }
    networks
}
