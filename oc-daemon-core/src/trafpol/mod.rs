//! Traffic policing ("always-on" firewall)
//!
//! Enforces a default-drop posture for all non-VPN traffic with
//! allowlists for devices, hosts and captive portal ports. Consumes
//! device, resolver and captive portal events.

mod allowdevs;
mod allowhosts;

use crate::config::{CpdConfig, TrafPolConfig};
use crate::cpd::{Cpd, CpdReport};
use crate::devmon::{DevMon, LinkEvents, LinkUpdate};
use crate::dnsmon::DnsMon;
use crate::error::Result;
use crate::execs::Execs;
use self::allowdevs::AllowDevs;
use self::allowhosts::AllowHosts;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Runtime commands of the policing engine.
enum Command {
    AllowDevice(String),
    DisallowDevice(String),
}

/// Traffic policing engine.
pub struct TrafPol {
    config: TrafPolConfig,
    cpd_config: CpdConfig,
    resolv_conf: PathBuf,
    execs: Arc<Execs>,
    link_events: Arc<dyn LinkEvents>,
    cmds_tx: mpsc::Sender<Command>,
    cmds_rx: Option<mpsc::Receiver<Command>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    started: bool,
}

impl TrafPol {
    /// Creates a new traffic policing engine.
    pub fn new(
        config: TrafPolConfig,
        cpd_config: CpdConfig,
        resolv_conf: PathBuf,
        execs: Arc<Execs>,
        link_events: Arc<dyn LinkEvents>,
    ) -> Self {
        let (cmds_tx, cmds_rx) = mpsc::channel(8);
        Self {
            config,
            cpd_config,
            resolv_conf,
            execs,
            link_events,
            cmds_tx,
            cmds_rx: Some(cmds_rx),
            stop: CancellationToken::new(),
            handle: None,
            started: false,
        }
    }

    /// Installs the filter table and starts the event loop. Starting
    /// twice is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        // table, default-drop chains, then set population
        self.execs.run_nft(&filter_program()).await?;

        let mut devmon = DevMon::new(self.link_events.clone(), self.stop.child_token());
        if let Err(e) = devmon.start().await {
            cleanup(&self.execs).await;
            return Err(e);
        }
        let dev_updates = devmon.take_updates().unwrap_or_else(|| mpsc::channel(1).1);

        let mut dnsmon = DnsMon::new(self.resolv_conf.clone());
        if let Err(e) = dnsmon.start() {
            cleanup(&self.execs).await;
            return Err(e);
        }
        let dns_updates = dnsmon.take_updates().unwrap_or_else(|| mpsc::channel(1).1);

        let mut cpd = Cpd::new(self.cpd_config.clone(), self.stop.child_token());
        if let Err(e) = cpd.start() {
            cleanup(&self.execs).await;
            return Err(e);
        }
        let cpd_results = cpd.take_results().unwrap_or_else(|| mpsc::channel(1).1);

        let cmds_rx = self.cmds_rx.take().unwrap_or_else(|| mpsc::channel(1).1);
        let mut worker = Worker::new(self.config.clone(), self.execs.clone());
        worker.cpd = Some(cpd);
        worker.dnsmon = Some(dnsmon);
        self.handle = Some(tokio::spawn(worker.run(
            dev_updates,
            dns_updates,
            cpd_results,
            cmds_rx,
            self.stop.clone(),
        )));
        self.started = true;
        Ok(())
    }

    /// Stops the event loop and removes the filter table. Stopping twice
    /// is a no-op.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        cleanup(&self.execs).await;
        self.started = false;
    }

    /// Exempts a device (the tunnel) from the default-drop posture.
    pub async fn allow_device(&self, device: &str) {
        let _ = self
            .cmds_tx
            .send(Command::AllowDevice(device.to_string()))
            .await;
    }

    /// Removes a device exemption.
    pub async fn disallow_device(&self, device: &str) {
        let _ = self
            .cmds_tx
            .send(Command::DisallowDevice(device.to_string()))
            .await;
    }
}

/// Removes the filter table. Safe to run whether or not the table is
/// installed, errors are ignored.
pub async fn cleanup(execs: &Execs) {
    if let Err(e) = execs.run_nft("delete table inet oc-daemon-filter").await {
        debug!("traffic policing cleanup: {}", e);
    }
}

/// Builds the initial filter ruleset: default-drop chains and the
/// allowlist sets, seeded with the loopback device.
fn filter_program() -> String {
    let mut p = String::from("add table inet oc-daemon-filter\n");
    p += "add set inet oc-daemon-filter allowdevs { type ifname; }\n";
    p += "add set inet oc-daemon-filter allowhosts4 { type ipv4_addr; flags interval; }\n";
    p += "add set inet oc-daemon-filter allowhosts6 { type ipv6_addr; flags interval; }\n";
    p += "add set inet oc-daemon-filter allowports { type inet_service; }\n";
    p += "add chain inet oc-daemon-filter input { type filter hook input priority 0; policy drop; }\n";
    p += "add rule inet oc-daemon-filter input ct state established,related accept\n";
    p += "add rule inet oc-daemon-filter input iifname @allowdevs accept\n";
    p += "add rule inet oc-daemon-filter input ip saddr @allowhosts4 accept\n";
    p += "add rule inet oc-daemon-filter input ip6 saddr @allowhosts6 accept\n";
    p += "add chain inet oc-daemon-filter output { type filter hook output priority 0; policy drop; }\n";
    p += "add rule inet oc-daemon-filter output ct state established,related accept\n";
    p += "add rule inet oc-daemon-filter output oifname @allowdevs accept\n";
    p += "add rule inet oc-daemon-filter output ip daddr @allowhosts4 accept\n";
    p += "add rule inet oc-daemon-filter output ip6 daddr @allowhosts6 accept\n";
    p += "add rule inet oc-daemon-filter output tcp dport @allowports accept\n";
    p += "add rule inet oc-daemon-filter output udp dport @allowports accept\n";
    p += "add chain inet oc-daemon-filter forward { type filter hook forward priority 0; policy drop; }\n";
    p += "add element inet oc-daemon-filter allowdevs { lo }\n";
    p
}

/// Formats portal ports as an nft set element list.
fn format_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Event loop state of a running engine.
struct Worker {
    config: TrafPolConfig,
    execs: Arc<Execs>,
    allow_devs: AllowDevs,
    allow_hosts: AllowHosts,
    cap_portal: bool,
    cpd: Option<Cpd>,
    dnsmon: Option<DnsMon>,
}

impl Worker {
    fn new(config: TrafPolConfig, execs: Arc<Execs>) -> Self {
        let allow_hosts = AllowHosts::new(config.clone());
        Self {
            config,
            execs,
            allow_devs: AllowDevs::new(),
            allow_hosts,
            cap_portal: false,
            cpd: None,
            dnsmon: None,
        }
    }

    /// Handles a device update: the device joins or leaves the allowed
    /// devices.
    async fn handle_device_update(&mut self, update: &LinkUpdate) {
        if update.add {
            self.allow_devs.add(&self.execs, &update.device).await;
        } else {
            self.allow_devs.remove(&self.execs, &update.device).await;
        }
    }

    /// Handles a resolver configuration change: probe for a captive
    /// portal and refresh the allowed hosts.
    async fn handle_dns_update(&mut self) {
        debug!("traffic policing handling resolver configuration change");
        if let Some(cpd) = &self.cpd {
            cpd.probe();
        }
        self.allow_hosts.update(&self.execs).await;
    }

    /// Handles a captive portal report: toggles the portal ports in the
    /// `allowports` set on state changes.
    async fn handle_cpd_report(&mut self, report: &CpdReport) {
        if report.detected == self.cap_portal {
            return;
        }
        self.cap_portal = report.detected;

        if self.config.portal_ports.is_empty() {
            return;
        }
        let action = if report.detected { "add" } else { "delete" };
        let command = format!(
            "{} element inet oc-daemon-filter allowports {{ {} }}",
            action,
            format_ports(&self.config.portal_ports)
        );
        if let Err(e) = self.execs.run_nft(&command).await {
            error!("traffic policing could not toggle portal ports: {}", e);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AllowDevice(device) => self.allow_devs.add(&self.execs, &device).await,
            Command::DisallowDevice(device) => {
                self.allow_devs.remove(&self.execs, &device).await
            }
        }
    }

    /// Runs the event loop until stopped.
    async fn run(
        mut self,
        mut dev_updates: mpsc::Receiver<LinkUpdate>,
        mut dns_updates: mpsc::Receiver<()>,
        mut cpd_results: mpsc::Receiver<CpdReport>,
        mut cmds: mpsc::Receiver<Command>,
        stop: CancellationToken,
    ) {
        // first tick fires immediately and installs the initial hosts
        let mut resolve_tick =
            tokio::time::interval(Duration::from_secs(self.config.resolve_ttl.max(1)));
        loop {
            tokio::select! {
                Some(update) = dev_updates.recv() => self.handle_device_update(&update).await,
                Some(_) = dns_updates.recv() => self.handle_dns_update().await,
                Some(report) = cpd_results.recv() => self.handle_cpd_report(&report).await,
                Some(command) = cmds.recv() => self.handle_command(command).await,
                _ = resolve_tick.tick() => self.allow_hosts.update(&self.execs).await,
                _ = stop.cancelled() => break,
            }
        }
        if let Some(mut dnsmon) = self.dnsmon.take() {
            dnsmon.stop();
        }
        if let Some(cpd) = self.cpd.take() {
            cpd.stop();
        }
    }
}
