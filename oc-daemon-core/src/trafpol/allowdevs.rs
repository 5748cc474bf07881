//! Allowed device bookkeeping

use crate::execs::Execs;
use std::collections::HashSet;
use tracing::error;

/// Devices exempt from the default-drop posture, mirrored into the nft
/// `allowdevs` set one element at a time.
pub(crate) struct AllowDevs {
    devices: HashSet<String>,
}

impl AllowDevs {
    /// Creates the allowed devices, seeded with the loopback device that
    /// the initial filter ruleset already contains.
    pub(crate) fn new() -> Self {
        let mut devices = HashSet::new();
        devices.insert("lo".to_string());
        Self { devices }
    }

    /// Adds a device. Adding a present device is a no-op without an nft
    /// call.
    pub(crate) async fn add(&mut self, execs: &Execs, device: &str) {
        if !self.devices.insert(device.to_string()) {
            return;
        }
        if let Err(e) = execs
            .run_nft(&format!(
                "add element inet oc-daemon-filter allowdevs {{ {} }}",
                device
            ))
            .await
        {
            error!("traffic policing could not allow device {}: {}", device, e);
        }
    }

    /// Removes a device. Removing an absent device is a no-op without an
    /// nft call.
    pub(crate) async fn remove(&mut self, execs: &Execs, device: &str) {
        if !self.devices.remove(device) {
            return;
        }
        if let Err(e) = execs
            .run_nft(&format!(
                "delete element inet oc-daemon-filter allowdevs {{ {} }}",
                device
            ))
            .await
        {
            error!(
                "traffic policing could not disallow device {}: {}",
                device, e
            );
        }
    }

    /// Returns the allowed devices.
    pub(crate) fn list(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.devices.iter().cloned().collect();
        devices.sort();
        devices
    }
}
