//! VPN setup orchestration
//!
//! A single serialized orchestrator that configures and tears down the
//! tunnel in response to external commands: device parameters, split
//! routing and DNS redirection are sequenced here. DNS proxy reports are
//! forwarded into the split routing engine while the tunnel is up.

use crate::config::SplitRoutingConfig;
use crate::devmon::LinkEvents;
use crate::error::{Error, Result};
use crate::execs::Execs;
use crate::splitrt::{self, SplitRouting};
use crate::vpnconfig::VpnConfig;
use oc_daemon_dns::{DnsProxyConfig, Proxy, Report};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Setup state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ConfiguringDevice,
    ConfiguringRouting,
    ConfiguringDns,
    Up,
    TearingDown,
}

/// Orchestrator commands, handled strictly in FIFO order.
enum Command {
    Setup(Box<VpnConfig>),
    Teardown(Box<VpnConfig>),
}

/// Orchestrator events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A setup sequence completed. Failures of individual steps are in
    /// the log.
    SetupOk,
    /// A teardown sequence completed, possibly partially.
    TeardownOk,
}

/// VPN setup orchestrator. Owns the DNS proxy and the split routing
/// engine of the active tunnel.
pub struct VpnSetup {
    dns_config: DnsProxyConfig,
    splitrt_config: SplitRoutingConfig,
    execs: Arc<Execs>,
    link_events: Arc<dyn LinkEvents>,
    cmds_tx: mpsc::Sender<Command>,
    cmds_rx: Option<mpsc::Receiver<Command>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Option<mpsc::Receiver<Event>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    started: bool,
}

impl VpnSetup {
    /// Creates a new orchestrator.
    pub fn new(
        dns_config: DnsProxyConfig,
        splitrt_config: SplitRoutingConfig,
        execs: Arc<Execs>,
        link_events: Arc<dyn LinkEvents>,
    ) -> Self {
        let (cmds_tx, cmds_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(8);
        Self {
            dns_config,
            splitrt_config,
            execs,
            link_events,
            cmds_tx,
            cmds_rx: Some(cmds_rx),
            events_tx,
            events_rx: Some(events_rx),
            stop: CancellationToken::new(),
            handle: None,
            started: false,
        }
    }

    /// Starts the orchestrator and the DNS proxy. Starting twice is a
    /// no-op; a DNS proxy bind failure is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        let proxy = Proxy::new(self.dns_config.clone());
        proxy.start().await?;
        let reports_rx = proxy
            .reports()
            .ok_or_else(|| Error::Internal("DNS proxy reports already taken".into()))?;
        let cmds_rx = self
            .cmds_rx
            .take()
            .ok_or_else(|| Error::Internal("VPN setup restarted".into()))?;

        let worker = Worker {
            dns_config: self.dns_config.clone(),
            splitrt_config: self.splitrt_config.clone(),
            execs: self.execs.clone(),
            link_events: self.link_events.clone(),
            proxy,
            splitrt: None,
            state: State::Idle,
            events_tx: self.events_tx.clone(),
            stop: self.stop.clone(),
        };
        self.handle = Some(tokio::spawn(worker.run(cmds_rx, reports_rx)));
        self.started = true;
        Ok(())
    }

    /// Stops the orchestrator, the DNS proxy and a running split routing
    /// engine.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.started = false;
    }

    /// Enqueues a setup command.
    pub async fn setup(&self, config: VpnConfig) {
        let _ = self.cmds_tx.send(Command::Setup(Box::new(config))).await;
    }

    /// Enqueues a teardown command.
    pub async fn teardown(&self, config: VpnConfig) {
        let _ = self.cmds_tx.send(Command::Teardown(Box::new(config))).await;
    }

    /// Takes the event channel. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.take()
    }
}

/// Cleans up tunnel state left over after an unclean shutdown: DNS
/// configuration, the tunnel device and split routing state.
pub async fn cleanup(device: &str, splitrt_config: &SplitRoutingConfig, execs: &Execs) {
    if execs.run_resolvectl(&["revert", device]).await.is_ok() {
        warn!("VPN setup cleaned up DNS configuration of {}", device);
    }
    if execs.run_ip_link(&["delete", device]).await.is_ok() {
        warn!("VPN setup cleaned up VPN device {}", device);
    }
    splitrt::cleanup(splitrt_config, execs).await;
}

/// Orchestrator task state.
struct Worker {
    dns_config: DnsProxyConfig,
    splitrt_config: SplitRoutingConfig,
    execs: Arc<Execs>,
    link_events: Arc<dyn LinkEvents>,
    proxy: Proxy,
    splitrt: Option<SplitRouting>,
    state: State,
    events_tx: mpsc::Sender<Event>,
    stop: CancellationToken,
}

impl Worker {
    /// Runs the orchestrator loop until stopped.
    async fn run(
        mut self,
        mut cmds: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<Report>,
    ) {
        loop {
            tokio::select! {
                Some(command) = cmds.recv() => self.handle_command(command).await,
                Some(report) = reports.recv() => self.handle_dns_report(report).await,
                _ = self.stop.cancelled() => break,
            }
        }
        self.proxy.stop();
        if let Some(mut splitrt) = self.splitrt.take() {
            splitrt.stop().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Setup(config) => self.setup(&config).await,
            Command::Teardown(config) => self.teardown(&config).await,
        }
    }

    /// Forwards a DNS proxy report into the split routing engine, which
    /// raises the report's `done` after installing the address. Reports
    /// arriving without an active tunnel are dropped, releasing `done`.
    async fn handle_dns_report(&mut self, report: Report) {
        debug!("VPN setup handling DNS report {:?}", report);
        if self.state != State::Up {
            return;
        }
        if let Some(splitrt) = &self.splitrt {
            if splitrt.dns_reports().send(report).await.is_err() {
                warn!("VPN setup could not forward DNS report to split routing");
            }
        }
    }

    /// Runs the setup sequence. Step failures are logged; the sequence
    /// continues and ends with a SetupOk event.
    async fn setup(&mut self, config: &VpnConfig) {
        if self.state != State::Idle {
            warn!(
                "VPN setup ignoring setup request in state {:?}",
                self.state
            );
            return;
        }

        self.state = State::ConfiguringDevice;
        self.setup_vpn_device(config).await;
        self.state = State::ConfiguringRouting;
        self.setup_routing(config).await;
        self.state = State::ConfiguringDns;
        self.setup_dns(config).await;
        self.state = State::Up;

        self.send_event(Event::SetupOk).await;
    }

    /// Runs the teardown sequence in mirror order, best-effort. Ends with
    /// a TeardownOk event even on partial cleanup.
    async fn teardown(&mut self, config: &VpnConfig) {
        if self.state == State::Idle {
            warn!("VPN setup ignoring teardown request, not set up");
            return;
        }

        self.state = State::TearingDown;
        self.teardown_vpn_device(config).await;
        if let Some(mut splitrt) = self.splitrt.take() {
            splitrt.stop().await;
        }
        self.teardown_dns(config).await;
        self.state = State::Idle;

        self.send_event(Event::TeardownOk).await;
    }

    /// Sets MTU and state of the tunnel device and assigns its addresses.
    async fn setup_vpn_device(&self, config: &VpnConfig) {
        let device = &config.device.name;
        let mtu = config.device.mtu.to_string();
        if let Err(e) = self.execs.run_ip_link(&["set", device, "mtu", &mtu]).await {
            error!("VPN setup could not set MTU on {}: {}", device, e);
        }
        if let Err(e) = self.execs.run_ip_link(&["set", device, "up"]).await {
            error!("VPN setup could not set {} up: {}", device, e);
        }

        if let Some(net) = &config.ipv4 {
            let address = net.to_string();
            if let Err(e) = self
                .execs
                .run_ip_address(&["add", &address, "dev", device])
                .await
            {
                error!("VPN setup could not set {} on {}: {}", address, device, e);
            }
        }
        if let Some(net) = &config.ipv6 {
            let address = net.to_string();
            if let Err(e) = self
                .execs
                .run_ip_address(&["add", &address, "dev", device])
                .await
            {
                error!("VPN setup could not set {} on {}: {}", address, device, e);
            }
        }
    }

    /// Sets the tunnel device down.
    async fn teardown_vpn_device(&self, config: &VpnConfig) {
        let device = &config.device.name;
        if let Err(e) = self.execs.run_ip_link(&["set", device, "down"]).await {
            error!("VPN setup could not set {} down: {}", device, e);
        }
    }

    /// Starts the split routing engine for the tunnel.
    async fn setup_routing(&mut self, config: &VpnConfig) {
        if self.splitrt.is_some() {
            return;
        }
        let mut splitrt = SplitRouting::new(
            self.splitrt_config.clone(),
            config.clone(),
            self.execs.clone(),
            self.link_events.clone(),
        );
        match splitrt.start().await {
            Ok(()) => self.splitrt = Some(splitrt),
            Err(e) => error!("VPN setup could not start split routing: {}", e),
        }
    }

    /// Points the DNS proxy at the VPN resolvers, installs the watches
    /// and redirects host DNS for the device to the proxy.
    async fn setup_dns(&self, config: &VpnConfig) {
        self.proxy.set_remotes(config.remotes());
        let excludes = config.dns_excludes();
        debug!("VPN setup setting DNS split excludes {:?}", excludes);
        self.proxy.set_watches(&excludes);

        let device = &config.device.name;
        let proxy_address = self.dns_config.address.to_string();
        if let Err(e) = self
            .execs
            .run_resolvectl(&["dns", device, &proxy_address])
            .await
        {
            error!("VPN setup error setting DNS server: {}", e);
        }
        // "~." routes all domains over this device
        if let Err(e) = self
            .execs
            .run_resolvectl(&["domain", device, &config.dns.default_domain, "~."])
            .await
        {
            error!("VPN setup error setting DNS domains: {}", e);
        }
        if let Err(e) = self
            .execs
            .run_resolvectl(&["default-route", device, "yes"])
            .await
        {
            error!("VPN setup error setting DNS default route: {}", e);
        }
        if let Err(e) = self.execs.run_resolvectl(&["flush-caches"]).await {
            error!("VPN setup error flushing DNS caches during setup: {}", e);
        }
        if let Err(e) = self.execs.run_resolvectl(&["reset-server-features"]).await {
            error!("VPN setup error resetting DNS server features during setup: {}", e);
        }
    }

    /// Reverts the DNS configuration of the device and clears the proxy.
    async fn teardown_dns(&self, config: &VpnConfig) {
        self.proxy.set_remotes(Default::default());
        self.proxy.set_watches(&[]);

        let device = &config.device.name;
        if let Err(e) = self.execs.run_resolvectl(&["revert", device]).await {
            error!("VPN setup error reverting DNS configuration: {}", e);
        }
        if let Err(e) = self.execs.run_resolvectl(&["flush-caches"]).await {
            error!("VPN setup error flushing DNS caches during teardown: {}", e);
        }
        if let Err(e) = self.execs.run_resolvectl(&["reset-server-features"]).await {
            error!(
                "VPN setup error resetting DNS server features during teardown: {}",
                e
            );
        }
    }

    async fn send_event(&self, event: Event) {
        tokio::select! {
            _ = self.events_tx.send(event) => {}
            _ = self.stop.cancelled() => {}
        }
    }
}
