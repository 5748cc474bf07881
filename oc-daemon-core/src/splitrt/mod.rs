//! Split routing engine
//!
//! Programs the OS so that traffic to excluded destinations bypasses the
//! VPN tunnel while everything else is routed into it. Bypass destinations
//! come from the static excludes of the VPN config, the locally attached
//! networks, and DNS reports for watched exclude domains.
//!
//! The in-memory exclude sets are authoritative; a reconciler coalesces
//! changes and pushes them into the kernel nft sets, retrying failed
//! batches on the next tick.

mod excludes;

use crate::config::SplitRoutingConfig;
use crate::devmon::{DevMon, LinkEvents, LinkUpdate};
use crate::error::Result;
use crate::execs::Execs;
use crate::vpnconfig::VpnConfig;
use self::excludes::{is_virtual_subnet_v4, parse_local_networks, DynamicExcludes};
use ipnet::IpNet;
use oc_daemon_dns::Report;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Coalescing window of the exclude set reconciler.
const RECONCILE_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the DNS report channel.
const REPORT_CHANNEL_SIZE: usize = 16;

/// Split routing engine for one VPN tunnel.
pub struct SplitRouting {
    config: SplitRoutingConfig,
    vpnconf: VpnConfig,
    execs: Arc<Execs>,
    link_events: Arc<dyn LinkEvents>,
    reports_tx: mpsc::Sender<Report>,
    reports_rx: Option<mpsc::Receiver<Report>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    started: bool,
}

impl SplitRouting {
    /// Creates a new split routing engine for the tunnel in vpnconf.
    pub fn new(
        config: SplitRoutingConfig,
        vpnconf: VpnConfig,
        execs: Arc<Execs>,
        link_events: Arc<dyn LinkEvents>,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_SIZE);
        Self {
            config,
            vpnconf,
            execs,
            link_events,
            reports_tx,
            reports_rx: Some(reports_rx),
            stop: CancellationToken::new(),
            handle: None,
            started: false,
        }
    }

    /// Returns the sink for DNS reports. The engine adds every reported
    /// address to the bypass set and raises the report's `done`.
    pub fn dns_reports(&self) -> mpsc::Sender<Report> {
        self.reports_tx.clone()
    }

    /// Installs routing table, policy rules and nft marking state and
    /// starts the reconciler. Starting twice is a no-op; a failing start
    /// rolls back and leaves the engine stopped.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        if let Err(e) = self.setup_routing().await {
            teardown_routing(&self.config, &self.execs).await;
            return Err(e);
        }

        let mut devmon = DevMon::new(self.link_events.clone(), self.stop.child_token());
        if let Err(e) = devmon.start().await {
            teardown_routing(&self.config, &self.execs).await;
            return Err(e);
        }
        let dev_updates = devmon.take_updates().unwrap_or_else(|| mpsc::channel(1).1);
        let reports_rx = self
            .reports_rx
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1);

        let mut worker = Worker::new(self.vpnconf.clone(), self.execs.clone());
        worker.seed_static_excludes();
        worker.update_local_excludes().await;
        self.handle = Some(tokio::spawn(worker.run(
            reports_rx,
            dev_updates,
            self.stop.clone(),
        )));
        self.started = true;
        Ok(())
    }

    /// Stops the reconciler and removes the routing state in mirror
    /// order. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        teardown_routing(&self.config, &self.execs).await;
        self.started = false;
    }

    /// Sets up routing table, rules, firewall mark and nft exclude sets.
    async fn setup_routing(&self) -> Result<()> {
        let config = &self.config;
        let device = &self.vpnconf.device.name;
        let mark = &config.firewall_mark;

        self.execs
            .run_sysctl(&["-q", "net.ipv4.conf.all.src_valid_mark=1"])
            .await?;

        let mut program = String::from("add table inet oc-daemon-routing\n");
        program +=
            "add set inet oc-daemon-routing excludes4 { type ipv4_addr; flags interval; }\n";
        program +=
            "add set inet oc-daemon-routing excludes6 { type ipv6_addr; flags interval; }\n";
        program +=
            "add chain inet oc-daemon-routing output { type route hook output priority mangle; }\n";
        program += &format!(
            "add rule inet oc-daemon-routing output ip daddr @excludes4 meta mark set {}\n",
            mark
        );
        program += &format!(
            "add rule inet oc-daemon-routing output ip6 daddr @excludes6 meta mark set {}\n",
            mark
        );
        program += "add chain inet oc-daemon-routing prerouting { type filter hook prerouting priority mangle; }\n";
        program += &format!(
            "add rule inet oc-daemon-routing prerouting ip daddr @excludes4 meta mark set {}\n",
            mark
        );
        program += &format!(
            "add rule inet oc-daemon-routing prerouting ip6 daddr @excludes6 meta mark set {}\n",
            mark
        );
        self.execs.run_nft(&program).await?;

        if self.vpnconf.ipv4.is_some() {
            self.setup_family("-4", device).await?;
        }
        if self.vpnconf.ipv6.is_some() {
            self.setup_family("-6", device).await?;
        }
        Ok(())
    }

    /// Sets up the routing table and policy rules for one address family.
    async fn setup_family(&self, family: &str, device: &str) -> Result<()> {
        let config = &self.config;
        self.execs
            .run_ip_route(
                family,
                &["add", "default", "dev", device, "table", &config.routing_table],
            )
            .await?;
        // marked (bypass) traffic consults the main table first
        self.execs
            .run_ip_rule(
                family,
                &[
                    "add",
                    "pref",
                    &config.rule_priority1,
                    "fwmark",
                    &config.firewall_mark,
                    "table",
                    "main",
                ],
            )
            .await?;
        // everything else falls through to the tunnel table
        self.execs
            .run_ip_rule(
                family,
                &["add", "pref", &config.rule_priority2, "table", &config.routing_table],
            )
            .await?;
        Ok(())
    }
}

/// Removes policy rules, routing table and nft state in mirror order.
/// Best-effort, errors are logged and ignored.
async fn teardown_routing(config: &SplitRoutingConfig, execs: &Execs) {
    for family in ["-4", "-6"] {
        if let Err(e) = execs
            .run_ip_rule(family, &["del", "pref", &config.rule_priority2])
            .await
        {
            debug!("split routing teardown: {}", e);
        }
        if let Err(e) = execs
            .run_ip_rule(family, &["del", "pref", &config.rule_priority1])
            .await
        {
            debug!("split routing teardown: {}", e);
        }
        if let Err(e) = execs
            .run_ip_route(family, &["flush", "table", &config.routing_table])
            .await
        {
            debug!("split routing teardown: {}", e);
        }
    }
    if let Err(e) = execs.run_nft("delete table inet oc-daemon-routing").await {
        debug!("split routing teardown: {}", e);
    }
}

/// Removes split routing state left over after an unclean shutdown.
pub async fn cleanup(config: &SplitRoutingConfig, execs: &Execs) {
    teardown_routing(config, execs).await;
}

/// Reconciler state of a running engine.
struct Worker {
    vpnconf: VpnConfig,
    execs: Arc<Execs>,
    static4: BTreeSet<ipnet::Ipv4Net>,
    static6: BTreeSet<ipnet::Ipv6Net>,
    local: BTreeSet<IpNet>,
    dynamic: DynamicExcludes,
    installed4: BTreeSet<String>,
    installed6: BTreeSet<String>,
    dirty: bool,
}

impl Worker {
    fn new(vpnconf: VpnConfig, execs: Arc<Execs>) -> Self {
        Self {
            vpnconf,
            execs,
            static4: BTreeSet::new(),
            static6: BTreeSet::new(),
            local: BTreeSet::new(),
            dynamic: DynamicExcludes::new(),
            installed4: BTreeSet::new(),
            installed6: BTreeSet::new(),
            dirty: false,
        }
    }

    /// Seeds the static excludes from the VPN config. In
    /// virtual-subnets-only mode only the virtual v4 subnets are used;
    /// DNS-learned v4 addresses are still admitted later.
    fn seed_static_excludes(&mut self) {
        for net in &self.vpnconf.split.exclude_v4 {
            if self.vpnconf.split.exclude_virtual_subnets_only_v4 && !is_virtual_subnet_v4(net) {
                debug!("split routing skipping non-virtual v4 exclude {}", net);
                continue;
            }
            self.static4.insert(*net);
        }
        for net in &self.vpnconf.split.exclude_v6 {
            self.static6.insert(*net);
        }
        self.dirty = true;
    }

    /// Re-enumerates the locally attached networks and merges them into
    /// the bypass set.
    async fn update_local_excludes(&mut self) {
        let mut local = BTreeSet::new();
        for family in ["-4", "-6"] {
            let output = match self.execs.run_ip(&[family, "-o", "address", "show"]).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("split routing could not list local addresses: {}", e);
                    continue;
                }
            };
            for net in parse_local_networks(
                &String::from_utf8_lossy(&output),
                &self.vpnconf.device.name,
            ) {
                local.insert(net);
            }
        }
        if local != self.local {
            self.local = local;
            self.dirty = true;
        }
    }

    /// Adds the reported address to the bypass set and raises `done`.
    /// The nft reconciler runs within the coalescing window.
    fn handle_dns_report(&mut self, report: &mut Report) {
        debug!("split routing handling DNS report {:?}", report);
        self.dynamic.add(report.ip, report.ttl);
        self.dirty = true;
        report.done();
    }

    /// Computes the desired nft set elements.
    fn desired_elements(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut v4 = BTreeSet::new();
        let mut v6 = BTreeSet::new();
        for net in &self.static4 {
            v4.insert(net.to_string());
        }
        for net in &self.static6 {
            v6.insert(net.to_string());
        }
        for net in &self.local {
            match net {
                IpNet::V4(n) => v4.insert(n.to_string()),
                IpNet::V6(n) => v6.insert(n.to_string()),
            };
        }
        for addr in self.dynamic.live() {
            match addr {
                IpAddr::V4(a) => v4.insert(a.to_string()),
                IpAddr::V6(a) => v6.insert(a.to_string()),
            };
        }
        (v4, v6)
    }

    /// Pushes the in-memory exclude sets into the kernel. A failed batch
    /// leaves the dirty flag set so the next tick retries.
    async fn reconcile(&mut self) {
        self.dynamic.prune();
        let (desired4, desired6) = self.desired_elements();

        let mut batch = String::new();
        for element in desired4.difference(&self.installed4) {
            batch += &format!(
                "add element inet oc-daemon-routing excludes4 {{ {} }}\n",
                element
            );
        }
        for element in self.installed4.difference(&desired4) {
            batch += &format!(
                "delete element inet oc-daemon-routing excludes4 {{ {} }}\n",
                element
            );
        }
        for element in desired6.difference(&self.installed6) {
            batch += &format!(
                "add element inet oc-daemon-routing excludes6 {{ {} }}\n",
                element
            );
        }
        for element in self.installed6.difference(&desired6) {
            batch += &format!(
                "delete element inet oc-daemon-routing excludes6 {{ {} }}\n",
                element
            );
        }
        if batch.is_empty() {
            self.dirty = false;
            return;
        }

        match self.execs.run_nft(&batch).await {
            Ok(()) => {
                self.installed4 = desired4;
                self.installed6 = desired6;
                self.dirty = false;
            }
            Err(e) => warn!("split routing could not update exclude sets: {}", e),
        }
    }

    /// Runs the reconciler loop until stopped.
    async fn run(
        mut self,
        mut reports: mpsc::Receiver<Report>,
        mut dev_updates: mpsc::Receiver<LinkUpdate>,
        stop: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(mut report) = reports.recv() => self.handle_dns_report(&mut report),
                Some(_) = dev_updates.recv() => self.update_local_excludes().await,
                _ = tick.tick() => {
                    if self.dirty || self.dynamic.has_expired() {
                        self.reconcile().await;
                    }
                }
                _ = stop.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devmon::testing::FakeLinkEvents;
    use crate::execs::testing::recording_execs;
    use crate::vpnconfig::{Device, Split, VpnConfig};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_vpnconf() -> VpnConfig {
        VpnConfig {
            device: Device {
                name: "oc-daemon-tun0".into(),
                mtu: 1300,
            },
            ipv4: Some("10.0.0.2/32".parse().unwrap()),
            ipv6: None,
            split: Split {
                exclude_v4: vec!["172.16.10.0/24".parse().unwrap()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_engine() -> (SplitRouting, std::sync::Arc<crate::execs::testing::RecordingRunner>)
    {
        let (execs, runner) = recording_execs();
        let (events, _tx) = FakeLinkEvents::new();
        let engine = SplitRouting::new(
            SplitRoutingConfig::default(),
            test_vpnconf(),
            Arc::new(execs),
            events,
        );
        (engine, runner)
    }

    #[tokio::test]
    async fn test_start_programs_routing() {
        let (mut engine, runner) = test_engine();
        engine.start().await.unwrap();

        let commands = runner.commands();
        assert_eq!(commands[0], "sysctl -q net.ipv4.conf.all.src_valid_mark=1");
        assert!(commands[1].contains("add table inet oc-daemon-routing"));
        assert!(commands[1].contains("meta mark set 42111"));
        assert_eq!(
            commands[2],
            "ip -4 route add default dev oc-daemon-tun0 table 42111"
        );
        assert_eq!(
            commands[3],
            "ip -4 rule add pref 2111 fwmark 42111 table main"
        );
        assert_eq!(commands[4], "ip -4 rule add pref 2112 table 42111");
        // no IPv6 in the config, no -6 routes or rules
        assert!(!commands.iter().any(|c| c.starts_with("ip -6 route")));

        engine.stop().await;
        let commands = runner.commands();
        assert!(commands.contains(&"ip -4 rule del pref 2112".to_string()));
        assert!(commands.contains(&"ip -4 rule del pref 2111".to_string()));
        assert!(commands.contains(&"ip -4 route flush table 42111".to_string()));
        assert_eq!(
            commands.last().map(String::as_str),
            Some("delete table inet oc-daemon-routing")
        );
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (mut engine, runner) = test_engine();
        engine.start().await.unwrap();
        // let the initial reconcile settle before counting
        tokio::time::sleep(Duration::from_millis(300)).await;
        let count = runner.commands().len();
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.commands().len(), count);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_static_excludes_installed() {
        let (mut engine, runner) = test_engine();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let commands = runner.commands();
        assert!(commands.iter().any(|c| c
            .contains("add element inet oc-daemon-routing excludes4 { 172.16.10.0/24 }")));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_dns_report_installs_exclude() {
        let (mut engine, runner) = test_engine();
        engine.start().await.unwrap();
        let reports = engine.dns_reports();

        let (report, done) = Report::new(
            "api.internal.example.com.".into(),
            std::net::IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            60,
        );
        reports.send(report).await.unwrap();
        // done is raised once the address is queued for installation
        timeout(Duration::from_secs(1), done)
            .await
            .expect("done not raised")
            .expect("report dropped");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let commands = runner.commands();
        assert!(commands
            .iter()
            .any(|c| c.contains("add element inet oc-daemon-routing excludes4 { 192.0.2.10 }")));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_virtual_subnets_only() {
        let (execs, runner) = recording_execs();
        let (events, _tx) = FakeLinkEvents::new();
        let mut vpnconf = test_vpnconf();
        vpnconf.split.exclude_v4 = vec![
            "172.16.10.0/24".parse().unwrap(),
            "100.64.10.0/24".parse().unwrap(),
        ];
        vpnconf.split.exclude_virtual_subnets_only_v4 = true;
        let mut engine = SplitRouting::new(
            SplitRoutingConfig::default(),
            vpnconf,
            Arc::new(execs),
            events,
        );
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let commands = runner.commands();
        assert!(commands
            .iter()
            .any(|c| c.contains("excludes4 { 100.64.10.0/24 }")));
        assert!(!commands.iter().any(|c| c.contains("172.16.10.0/24")));
        engine.stop().await;
    }
}
