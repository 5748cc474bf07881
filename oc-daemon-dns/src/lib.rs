//! Split-DNS forwarding proxy for the oc-daemon VPN daemon.
//!
//! The proxy terminates DNS queries from the host on a loopback address,
//! forwards each query to the upstream servers responsible for the question
//! name, and reports A/AAAA answers for watched names so that the
//! split-routing engine can install bypass routes before the client sees
//! the reply.

pub mod config;
pub mod error;
pub mod proxy;
pub mod remotes;
pub mod report;
pub mod watches;

pub use config::DnsProxyConfig;
pub use error::{DnsProxyError, Result};
pub use proxy::Proxy;
pub use remotes::Remotes;
pub use report::Report;
pub use watches::Watches;
