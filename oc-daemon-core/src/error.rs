//! Daemon error types

use thiserror::Error;

/// Daemon result type
pub type Result<T> = std::result::Result<T, Error>;

/// Daemon error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("command \"{command}\" failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("command \"{0}\" canceled")]
    Canceled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("resolver watch error: {0}")]
    Watch(String),

    #[error("captive portal detection error: {0}")]
    Cpd(String),

    #[error("DNS proxy error: {0}")]
    DnsProxy(#[from] oc_daemon_dns::DnsProxyError),

    #[error("invalid VPN configuration: {0}")]
    VpnConfig(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Creates a new command error with the stderr payload
    pub fn command<S: Into<String>, T: Into<String>>(command: S, stderr: T) -> Self {
        Self::Command {
            command: command.into(),
            stderr: stderr.into(),
        }
    }
}
