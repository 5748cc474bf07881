//! Daemon control loop
//!
//! Owns the traffic policing engine, the VPN setup orchestrator and the
//! IPC API server, and routes events between them: API requests drive
//! setup and teardown, orchestrator events drive the connection status
//! and the tunnel device exemption.

use crate::api::{ApiRequest, ApiServer, Request, Response};
use crate::config::Config;
use crate::devmon::{LinkEvents, RtnetlinkEvents};
use crate::dnsmon::RESOLV_CONF;
use crate::error::{Error, Result};
use crate::execs::{Execs, SystemRunner};
use crate::trafpol::{self, TrafPol};
use crate::vpnconfig::VpnConfig;
use crate::vpnsetup::{self, Event, VpnSetup};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connection status of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Daemon status snapshot served over the IPC API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "ConnectionState")]
    pub connection_state: ConnectionState,
    #[serde(rename = "VPNConfig")]
    pub vpn_config: Option<VpnConfig>,
}

/// The oc-daemon control loop.
pub struct Daemon {
    config: Config,
    stop: CancellationToken,
    startup_complete: bool,
}

impl Daemon {
    /// Creates a new daemon for config.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
            startup_complete: false,
        }
    }

    /// Returns the token that shuts the daemon down when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Reports whether startup finished before run returned. Used to
    /// distinguish startup errors from runtime errors in the exit code.
    pub fn startup_complete(&self) -> bool {
        self.startup_complete
    }

    /// Runs the daemon until the shutdown token is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        let execs = Arc::new(Execs::new(
            self.config.executables.clone(),
            Arc::new(SystemRunner),
            self.stop.child_token(),
        ));
        let link_events: Arc<dyn LinkEvents> = Arc::new(RtnetlinkEvents);

        // recover from a previous unclean shutdown
        vpnsetup::cleanup(
            &self.config.openconnect.vpn_device,
            &self.config.split_routing,
            &execs,
        )
        .await;
        trafpol::cleanup(&execs).await;

        let mut trafpol = TrafPol::new(
            self.config.traffic_policing.clone(),
            self.config.cpd.clone(),
            PathBuf::from(RESOLV_CONF),
            execs.clone(),
            link_events.clone(),
        );
        trafpol.start().await?;

        let mut vpnsetup = VpnSetup::new(
            self.config.dns_proxy.clone(),
            self.config.split_routing.clone(),
            execs.clone(),
            link_events.clone(),
        );
        vpnsetup.start().await?;
        let mut events = vpnsetup
            .take_events()
            .ok_or_else(|| Error::Internal("VPN setup events already taken".into()))?;

        let mut api = ApiServer::new(self.config.socket_server.clone(), self.stop.child_token());
        let mut requests = api.start()?;

        self.startup_complete = true;
        info!("daemon started");

        let mut status = Status {
            connection_state: ConnectionState::Disconnected,
            vpn_config: None,
        };

        loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    handle_request(request, &mut status, &vpnsetup, &self.config).await;
                }
                Some(event) = events.recv() => {
                    handle_event(event, &mut status, &trafpol).await;
                }
                _ = self.stop.cancelled() => break,
            }
        }

        // orderly shutdown tears an active tunnel down first
        if matches!(
            status.connection_state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            if let Some(config) = status.vpn_config.clone() {
                vpnsetup.teardown(config).await;
                let teardown = async {
                    while let Some(event) = events.recv().await {
                        if event == Event::TeardownOk {
                            break;
                        }
                    }
                };
                if timeout(Duration::from_secs(10), teardown).await.is_err() {
                    warn!("daemon timed out waiting for teardown");
                }
            }
        }

        api.stop();
        vpnsetup.stop().await;
        trafpol.stop().await;
        info!("daemon stopped");
        Ok(())
    }
}

/// Handles an IPC API request against the current status.
async fn handle_request(
    request: ApiRequest,
    status: &mut Status,
    vpnsetup: &VpnSetup,
    config: &Config,
) {
    let response = match request.request {
        Request::Query => Response::Status {
            status: status.clone(),
        },
        Request::DumpState => dump_state(config, status),
        Request::Connect { config } => connect(*config, status, vpnsetup).await,
        Request::Disconnect => disconnect(status, vpnsetup).await,
    };
    let _ = request.respond.send(response);
}

/// Serializes the full daemon state, config included, for DumpState
/// requests. Query only returns the structured connection status.
fn dump_state(config: &Config, status: &Status) -> Response {
    #[derive(Serialize)]
    struct State<'a> {
        #[serde(rename = "Config")]
        config: &'a Config,
        #[serde(rename = "Status")]
        status: &'a Status,
    }
    match serde_json::to_string(&State { config, status }) {
        Ok(state) => Response::State { state },
        Err(e) => Response::Error {
            message: format!("could not dump state: {}", e),
        },
    }
}

/// Validates the delivered VPN config and starts the setup sequence.
async fn connect(config: VpnConfig, status: &mut Status, vpnsetup: &VpnSetup) -> Response {
    if status.connection_state != ConnectionState::Disconnected {
        return Response::Error {
            message: format!("cannot connect in state {:?}", status.connection_state),
        };
    }
    if let Err(e) = config.validate() {
        return Response::Error {
            message: e.to_string(),
        };
    }

    info!("daemon connecting VPN on {}", config.device.name);
    status.connection_state = ConnectionState::Connecting;
    status.vpn_config = Some(config.clone());
    vpnsetup.setup(config).await;
    Response::Ok
}

/// Starts the teardown sequence for the active tunnel.
async fn disconnect(status: &mut Status, vpnsetup: &VpnSetup) -> Response {
    match status.connection_state {
        ConnectionState::Connected | ConnectionState::Connecting => {
            let Some(config) = status.vpn_config.clone() else {
                return Response::Error {
                    message: "no active VPN config".into(),
                };
            };
            info!("daemon disconnecting VPN on {}", config.device.name);
            status.connection_state = ConnectionState::Disconnecting;
            vpnsetup.teardown(config).await;
            Response::Ok
        }
        state => Response::Error {
            message: format!("cannot disconnect in state {:?}", state),
        },
    }
}

/// Handles a VPN setup event: updates the connection status and the
/// tunnel device exemption of the policing engine.
async fn handle_event(event: Event, status: &mut Status, trafpol: &TrafPol) {
    let device = status
        .vpn_config
        .as_ref()
        .map(|c| c.device.name.clone())
        .unwrap_or_default();
    match event {
        Event::SetupOk => {
            if status.connection_state == ConnectionState::Connecting {
                info!("daemon VPN connection up on {}", device);
                status.connection_state = ConnectionState::Connected;
                if !device.is_empty() {
                    trafpol.allow_device(&device).await;
                }
            }
        }
        Event::TeardownOk => {
            info!("daemon VPN connection down");
            if !device.is_empty() {
                trafpol.disallow_device(&device).await;
            }
            status.connection_state = ConnectionState::Disconnected;
            status.vpn_config = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SplitRoutingConfig, TrafPolConfig};
    use crate::devmon::testing::FakeLinkEvents;
    use crate::execs::testing::recording_execs;
    use crate::vpnconfig::Device;
    use oc_daemon_dns::DnsProxyConfig;
    use tokio::sync::oneshot;

    fn test_vpnconf() -> VpnConfig {
        VpnConfig {
            device: Device {
                name: "oc-daemon-tun0".into(),
                mtu: 1300,
            },
            ipv4: Some("10.0.0.2/32".parse().unwrap()),
            ..Default::default()
        }
    }

    async fn test_vpnsetup() -> VpnSetup {
        let (execs, _runner) = recording_execs();
        let (events, _tx) = FakeLinkEvents::new();
        let dns_config = DnsProxyConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            listen_udp: true,
            listen_tcp: false,
        };
        let mut vpnsetup = VpnSetup::new(
            dns_config,
            SplitRoutingConfig::default(),
            Arc::new(execs),
            events,
        );
        vpnsetup.start().await.unwrap();
        vpnsetup
    }

    #[tokio::test]
    async fn test_handle_request_query() {
        let vpnsetup = test_vpnsetup().await;
        let mut status = Status {
            connection_state: ConnectionState::Disconnected,
            vpn_config: None,
        };

        let (respond, response) = oneshot::channel();
        handle_request(
            ApiRequest {
                request: Request::Query,
                respond,
            },
            &mut status,
            &vpnsetup,
            &Config::default(),
        )
        .await;
        match response.await.unwrap() {
            Response::Status { status } => {
                assert_eq!(status.connection_state, ConnectionState::Disconnected)
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_request_dump_state() {
        let vpnsetup = test_vpnsetup().await;
        let mut status = Status {
            connection_state: ConnectionState::Connecting,
            vpn_config: Some(test_vpnconf()),
        };

        let (respond, response) = oneshot::channel();
        handle_request(
            ApiRequest {
                request: Request::DumpState,
                respond,
            },
            &mut status,
            &vpnsetup,
            &Config::default(),
        )
        .await;
        match response.await.unwrap() {
            Response::State { state } => {
                // the dump is a raw JSON document carrying config and status
                let dump: serde_json::Value = serde_json::from_str(&state).unwrap();
                assert_eq!(
                    dump["Status"]["ConnectionState"],
                    serde_json::json!("Connecting")
                );
                assert_eq!(
                    dump["Status"]["VPNConfig"]["Device"]["Name"],
                    serde_json::json!("oc-daemon-tun0")
                );
                assert_eq!(
                    dump["Config"]["OpenConnect"]["VPNDevice"],
                    serde_json::json!("oc-daemon-tun0")
                );
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let vpnsetup = test_vpnsetup().await;
        let mut status = Status {
            connection_state: ConnectionState::Disconnected,
            vpn_config: None,
        };

        let response = connect(test_vpnconf(), &mut status, &vpnsetup).await;
        assert_eq!(response, Response::Ok);
        assert_eq!(status.connection_state, ConnectionState::Connecting);
        assert!(status.vpn_config.is_some());

        // a second connect while not disconnected is rejected
        let response = connect(test_vpnconf(), &mut status, &vpnsetup).await;
        assert!(matches!(response, Response::Error { .. }));

        let response = disconnect(&mut status, &vpnsetup).await;
        assert_eq!(response, Response::Ok);
        assert_eq!(status.connection_state, ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn test_connect_invalid_config_rejected() {
        let vpnsetup = test_vpnsetup().await;
        let mut status = Status {
            connection_state: ConnectionState::Disconnected,
            vpn_config: None,
        };

        let mut config = test_vpnconf();
        config.device.name = String::new();
        let response = connect(config, &mut status, &vpnsetup).await;
        assert!(matches!(response, Response::Error { .. }));
        assert_eq!(status.connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_while_disconnected_rejected() {
        let vpnsetup = test_vpnsetup().await;
        let mut status = Status {
            connection_state: ConnectionState::Disconnected,
            vpn_config: None,
        };
        let response = disconnect(&mut status, &vpnsetup).await;
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_handle_event_transitions() {
        let (execs, _runner) = recording_execs();
        let (events, _tx) = FakeLinkEvents::new();
        // trafpol stays unstarted, allow/disallow commands are buffered
        let trafpol = TrafPol::new(
            TrafPolConfig::default(),
            crate::config::CpdConfig {
                host: "127.0.0.1:1".into(),
                http_timeout: 1,
                ..Default::default()
            },
            std::env::temp_dir().join("resolv.conf-test-nonexistent"),
            Arc::new(execs),
            events,
        );

        let mut status = Status {
            connection_state: ConnectionState::Connecting,
            vpn_config: Some(test_vpnconf()),
        };
        handle_event(Event::SetupOk, &mut status, &trafpol).await;
        assert_eq!(status.connection_state, ConnectionState::Connected);

        handle_event(Event::TeardownOk, &mut status, &trafpol).await;
        assert_eq!(status.connection_state, ConnectionState::Disconnected);
        assert!(status.vpn_config.is_none());
    }
}
