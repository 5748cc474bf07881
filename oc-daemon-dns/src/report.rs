//! DNS watch reports

use std::fmt;
use std::net::IpAddr;
use tokio::sync::oneshot;

/// A report about an A/AAAA answer for a watched name. The consumer raises
/// `done` once the address has been installed; the producer blocks on the
/// paired receiver before forwarding the DNS reply to the client. Dropping
/// an unhandled report also releases the producer.
pub struct Report {
    /// Owner name of the address record.
    pub name: String,
    /// Reported address.
    pub ip: IpAddr,
    /// TTL of the address record in seconds.
    pub ttl: u32,
    done: Option<oneshot::Sender<()>>,
}

impl Report {
    /// Creates a report and the completion receiver the producer waits on.
    pub fn new(name: String, ip: IpAddr, ttl: u32) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name,
                ip,
                ttl,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Signals that the reported address has been installed.
    pub fn done(&mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_done_releases_producer() {
        let (mut report, rx) = Report::new(
            "example.com.".into(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            60,
        );
        report.done();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_producer() {
        let (report, rx) = Report::new(
            "example.com.".into(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            60,
        );
        drop(report);
        assert!(rx.await.is_err());
    }
}
