//! Captive portal detection
//!
//! Periodically probes a known HTTP endpoint. The endpoint answers
//! 204 No Content on an unfiltered network; a redirect or an intercepted
//! success page means a captive portal sits between the host and the
//! internet.

use crate::config::CpdConfig;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A captive portal detection report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpdReport {
    /// Whether a captive portal is currently detected.
    pub detected: bool,
}

/// Captive portal detector.
pub struct Cpd {
    config: CpdConfig,
    probe_tx: mpsc::Sender<()>,
    probe_rx: Option<mpsc::Receiver<()>>,
    results_rx: Option<mpsc::Receiver<CpdReport>>,
    results_tx: mpsc::Sender<CpdReport>,
    stop: CancellationToken,
    started: bool,
}

impl Cpd {
    /// Creates a new detector for config.
    pub fn new(config: CpdConfig, stop: CancellationToken) -> Self {
        let (probe_tx, probe_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(8);
        Self {
            config,
            probe_tx,
            probe_rx: Some(probe_rx),
            results_rx: Some(results_rx),
            results_tx,
            stop,
            started: false,
        }
    }

    /// Starts the probe loop. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let probe_rx = self
            .probe_rx
            .take()
            .ok_or_else(|| Error::Internal("captive portal detector restarted".into()))?;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(self.config.http_timeout))
            .build()
            .map_err(|e| Error::Cpd(e.to_string()))?;

        tokio::spawn(run(
            self.config.clone(),
            client,
            probe_rx,
            self.results_tx.clone(),
            self.stop.clone(),
        ));
        self.started = true;
        Ok(())
    }

    /// Stops the probe loop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Requests an immediate probe round.
    pub fn probe(&self) {
        let _ = self.probe_tx.try_send(());
    }

    /// Takes the report channel. Can be taken once.
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<CpdReport>> {
        self.results_rx.take()
    }
}

/// Runs probe rounds until stopped, sleeping between rounds according to
/// the current detection state.
async fn run(
    config: CpdConfig,
    client: reqwest::Client,
    mut probe_rx: mpsc::Receiver<()>,
    results_tx: mpsc::Sender<CpdReport>,
    stop: CancellationToken,
) {
    let mut detected = false;
    loop {
        if let Some(result) = probe_round(&config, &client).await {
            if result != detected {
                info!("captive portal {}", if result { "detected" } else { "cleared" });
            }
            detected = result;
        }
        let report = CpdReport { detected };
        tokio::select! {
            _ = results_tx.send(report) => {}
            _ = stop.cancelled() => return,
        }

        let timer = if detected {
            config.probe_timer_detected
        } else {
            config.probe_timer
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(timer)) => {}
            Some(_) = probe_rx.recv() => {}
            _ = stop.cancelled() => return,
        }
    }
}

/// Probes the endpoint up to the configured number of attempts. Returns
/// None when every attempt fails at the transport level; transport
/// failures are not detection.
async fn probe_round(config: &CpdConfig, client: &reqwest::Client) -> Option<bool> {
    for attempt in 0..config.probe_count.max(1) {
        match check(config, client).await {
            Some(result) => return Some(result),
            None => debug!("captive portal probe attempt {} failed", attempt + 1),
        }
    }
    None
}

/// Performs a single probe request.
async fn check(config: &CpdConfig, client: &reqwest::Client) -> Option<bool> {
    let url = format!("http://{}/", config.host);
    match client.get(&url).send().await {
        Ok(response) => {
            let status = response.status();
            Some(status.is_redirection() || (status.is_success() && status.as_u16() != 204))
        }
        Err(e) => {
            debug!("captive portal probe error: {}", e);
            None
        }
    }
}
