//! Daemon configuration

use crate::error::{Error, Result};
use oc_daemon_dns::DnsProxyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/var/lib/oc-daemon/oc-daemon.json";

/// Daemon configuration, loaded once at startup from a JSON file. Missing
/// keys take their subsystem defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Verbose")]
    pub verbose: bool,
    #[serde(rename = "SocketServer")]
    pub socket_server: SocketServerConfig,
    #[serde(rename = "CPD")]
    pub cpd: CpdConfig,
    #[serde(rename = "DNSProxy")]
    pub dns_proxy: DnsProxyConfig,
    #[serde(rename = "OpenConnect")]
    pub openconnect: OpenConnectConfig,
    #[serde(rename = "Executables")]
    pub executables: ExecutablesConfig,
    #[serde(rename = "SplitRouting")]
    pub split_routing: SplitRoutingConfig,
    #[serde(rename = "TrafficPolicing")]
    pub traffic_policing: TrafPolConfig,
    #[serde(rename = "TND")]
    pub tnd: TndConfig,
}

/// Top-level keys recognized in the configuration file.
const KNOWN_KEYS: [&str; 9] = [
    "Verbose",
    "SocketServer",
    "CPD",
    "DNSProxy",
    "OpenConnect",
    "Executables",
    "SplitRouting",
    "TrafficPolicing",
    "TND",
];

impl Config {
    /// Loads the configuration from the JSON file at path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "could not read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&data)
    }

    /// Parses a configuration from JSON. The input must be valid JSON and
    /// contain at least one recognized field.
    pub fn parse(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| Error::Config(format!("invalid JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::config("configuration is not a JSON object"))?;
        if !object.keys().any(|k| KNOWN_KEYS.contains(&k.as_str())) {
            return Err(Error::config("no recognized configuration fields"));
        }
        serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
    }

    /// Checks the configuration for obviously unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.socket_server.socket_file.as_os_str().is_empty() {
            return Err(Error::config("socket file is empty"));
        }
        if self.openconnect.vpn_device.is_empty() {
            return Err(Error::config("VPN device name is empty"));
        }
        let e = &self.executables;
        for (name, path) in [
            ("ip", &e.ip),
            ("nft", &e.nft),
            ("resolvectl", &e.resolvectl),
            ("sysctl", &e.sysctl),
        ] {
            if path.is_empty() {
                return Err(Error::Config(format!("{} executable is empty", name)));
            }
        }
        Ok(())
    }
}

/// UNIX socket server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketServerConfig {
    #[serde(rename = "SocketFile")]
    pub socket_file: PathBuf,
    #[serde(rename = "SocketOwner")]
    pub socket_owner: String,
    #[serde(rename = "SocketGroup")]
    pub socket_group: String,
    #[serde(rename = "SocketPermissions")]
    pub socket_permissions: String,
    /// Per-request timeout in seconds.
    #[serde(rename = "RequestTimeout")]
    pub request_timeout: u64,
}

impl Default for SocketServerConfig {
    fn default() -> Self {
        Self {
            socket_file: PathBuf::from("/run/oc-daemon/daemon.sock"),
            socket_owner: String::new(),
            socket_group: String::new(),
            socket_permissions: "0700".into(),
            request_timeout: 30,
        }
    }
}

/// Captive portal detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpdConfig {
    #[serde(rename = "Host")]
    pub host: String,
    /// Probe timeout in seconds.
    #[serde(rename = "HTTPTimeout")]
    pub http_timeout: u64,
    /// Probe attempts per round.
    #[serde(rename = "ProbeCount")]
    pub probe_count: u32,
    /// Seconds between probe rounds.
    #[serde(rename = "ProbeTimer")]
    pub probe_timer: u64,
    /// Seconds between probe rounds while a portal is detected.
    #[serde(rename = "ProbeTimerDetected")]
    pub probe_timer_detected: u64,
}

impl Default for CpdConfig {
    fn default() -> Self {
        Self {
            host: "connectivity-check.ubuntu.com".into(),
            http_timeout: 5,
            probe_count: 3,
            probe_timer: 300,
            probe_timer_detected: 15,
        }
    }
}

/// OpenConnect runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenConnectConfig {
    #[serde(rename = "OpenConnect")]
    pub openconnect: String,
    #[serde(rename = "XMLProfile")]
    pub xml_profile: PathBuf,
    #[serde(rename = "VPNCScript")]
    pub vpnc_script: PathBuf,
    #[serde(rename = "VPNDevice")]
    pub vpn_device: String,
    #[serde(rename = "PIDFile")]
    pub pid_file: PathBuf,
    #[serde(rename = "PIDOwner")]
    pub pid_owner: String,
    #[serde(rename = "PIDGroup")]
    pub pid_group: String,
    #[serde(rename = "PIDPermissions")]
    pub pid_permissions: String,
}

impl Default for OpenConnectConfig {
    fn default() -> Self {
        Self {
            openconnect: "openconnect".into(),
            xml_profile: PathBuf::from("/var/lib/oc-daemon/profile.xml"),
            vpnc_script: PathBuf::from("/usr/bin/oc-daemon-vpncscript"),
            vpn_device: "oc-daemon-tun0".into(),
            pid_file: PathBuf::from("/run/oc-daemon/openconnect.pid"),
            pid_owner: String::new(),
            pid_group: String::new(),
            pid_permissions: "0600".into(),
        }
    }
}

/// External executables used by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutablesConfig {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Nft")]
    pub nft: String,
    #[serde(rename = "Resolvectl")]
    pub resolvectl: String,
    #[serde(rename = "Sysctl")]
    pub sysctl: String,
}

impl Default for ExecutablesConfig {
    fn default() -> Self {
        Self {
            ip: "ip".into(),
            nft: "nft".into(),
            resolvectl: "resolvectl".into(),
            sysctl: "sysctl".into(),
        }
    }
}

/// Split routing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRoutingConfig {
    #[serde(rename = "RoutingTable")]
    pub routing_table: String,
    #[serde(rename = "RulePriority1")]
    pub rule_priority1: String,
    #[serde(rename = "RulePriority2")]
    pub rule_priority2: String,
    #[serde(rename = "FirewallMark")]
    pub firewall_mark: String,
}

impl Default for SplitRoutingConfig {
    fn default() -> Self {
        Self {
            routing_table: "42111".into(),
            rule_priority1: "2111".into(),
            rule_priority2: "2112".into(),
            firewall_mark: "42111".into(),
        }
    }
}

/// Traffic policing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafPolConfig {
    #[serde(rename = "AllowedHosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(rename = "PortalPorts")]
    pub portal_ports: Vec<u16>,
    /// Per-attempt resolution timeout in seconds.
    #[serde(rename = "ResolveTimeout")]
    pub resolve_timeout: u64,
    /// Resolution attempts per host.
    #[serde(rename = "ResolveTries")]
    pub resolve_tries: u32,
    /// Seconds between resolution attempts.
    #[serde(rename = "ResolveTriesSleep")]
    pub resolve_tries_sleep: u64,
    /// Lifetime of resolved addresses in seconds.
    #[serde(rename = "ResolveTTL")]
    pub resolve_ttl: u64,
}

impl Default for TrafPolConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            portal_ports: vec![80, 443],
            resolve_timeout: 2,
            resolve_tries: 3,
            resolve_tries_sleep: 1,
            resolve_ttl: 300,
        }
    }
}

/// Trusted network detection configuration. The detector itself runs
/// outside the daemon core, only its settings are carried here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TndConfig {
    #[serde(rename = "WaitCheck")]
    pub wait_check: u64,
    #[serde(rename = "HTTPSTimeout")]
    pub https_timeout: u64,
    #[serde(rename = "UntrustedTimer")]
    pub untrusted_timer: u64,
    #[serde(rename = "TrustedTimer")]
    pub trusted_timer: u64,
}

impl Default for TndConfig {
    fn default() -> Self {
        Self {
            wait_check: 1,
            https_timeout: 5,
            untrusted_timer: 30,
            trusted_timer: 60,
        }
    }
}
