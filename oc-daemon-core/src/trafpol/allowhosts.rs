//! Allowed host resolution

use crate::config::TrafPolConfig;
use crate::execs::Execs;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Hostnames exempt from the default-drop posture. Resolution results are
/// mirrored into the nft `allowhosts4`/`allowhosts6` sets.
pub(crate) struct AllowHosts {
    config: TrafPolConfig,
    hosts: BTreeSet<String>,
    installed4: BTreeSet<String>,
    installed6: BTreeSet<String>,
}

impl AllowHosts {
    /// Creates the allowed hosts from the configured list.
    pub(crate) fn new(config: TrafPolConfig) -> Self {
        let hosts = config.allowed_hosts.iter().cloned().collect();
        Self {
            config,
            hosts,
            installed4: BTreeSet::new(),
            installed6: BTreeSet::new(),
        }
    }

    /// Re-resolves all hosts and reinstalls the nft sets when the result
    /// set changed.
    pub(crate) async fn update(&mut self, execs: &Execs) {
        let mut v4 = BTreeSet::new();
        let mut v6 = BTreeSet::new();
        for host in &self.hosts {
            for addr in resolve_host(host, &self.config).await {
                match addr {
                    IpAddr::V4(a) => v4.insert(a.to_string()),
                    IpAddr::V6(a) => v6.insert(a.to_string()),
                };
            }
        }
        if v4 == self.installed4 && v6 == self.installed6 {
            return;
        }

        let mut batch = String::from("flush set inet oc-daemon-filter allowhosts4\n");
        batch += "flush set inet oc-daemon-filter allowhosts6\n";
        if !v4.is_empty() {
            batch += &format!(
                "add element inet oc-daemon-filter allowhosts4 {{ {} }}\n",
                v4.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        if !v6.is_empty() {
            batch += &format!(
                "add element inet oc-daemon-filter allowhosts6 {{ {} }}\n",
                v6.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        match execs.run_nft(&batch).await {
            Ok(()) => {
                debug!(
                    "traffic policing installed {} v4 and {} v6 allowed addresses",
                    v4.len(),
                    v6.len()
                );
                self.installed4 = v4;
                self.installed6 = v6;
            }
            Err(e) => warn!("traffic policing could not update allowed hosts: {}", e),
        }
    }
}

/// Resolves a host with the configured tries, backoff and per-attempt
/// timeout. Address literals pass through without resolution.
async fn resolve_host(host: &str, config: &TrafPolConfig) -> Vec<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return vec![addr];
    }

    let attempt_timeout = Duration::from_secs(config.resolve_timeout);
    for attempt in 0..config.resolve_tries.max(1) {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(config.resolve_tries_sleep)).await;
        }
        match timeout(attempt_timeout, lookup_host((host, 0u16))).await {
            Ok(Ok(addrs)) => return addrs.map(|a| a.ip()).collect(),
            Ok(Err(e)) => debug!("traffic policing could not resolve {}: {}", host, e),
            Err(_) => debug!("traffic policing resolution of {} timed out", host),
        }
    }
    warn!("traffic policing giving up resolving {}", host);
    Vec::new()
}
