//! Host resolver configuration monitoring
//!
//! Watches the resolver configuration file and emits a change tick when it
//! is altered. The file is usually replaced by rename, so the parent
//! directory is watched and events are filtered by path.

use crate::error::{Error, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;

/// Default resolver configuration file.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Monitor for the host resolver configuration.
pub struct DnsMon {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    updates: Option<mpsc::Receiver<()>>,
}

impl DnsMon {
    /// Creates a new monitor for the resolver configuration at path.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            watcher: None,
            updates: None,
        }
    }

    /// Starts watching. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(8);
        let path = self.path.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if event.paths.iter().any(|p| p == &path) {
                        // drop the tick when the consumer lags, change
                        // notifications carry no payload
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!("resolver watch error: {}", e),
            })
            .map_err(|e| Error::Watch(e.to_string()))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("/"));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(e.to_string()))?;

        self.watcher = Some(watcher);
        self.updates = Some(rx);
        Ok(())
    }

    /// Stops watching.
    pub fn stop(&mut self) {
        self.watcher = None;
    }

    /// Takes the update channel. Can be taken once after start.
    pub fn take_updates(&mut self) -> Option<mpsc::Receiver<()>> {
        self.updates.take()
    }
}
