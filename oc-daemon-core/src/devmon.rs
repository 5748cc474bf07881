//! Network device monitoring
//!
//! Subscribes to RTNETLINK link updates through a thin socket shim and
//! forwards add/remove events. The subscription source is an injected
//! capability so tests can feed their own updates.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A link add/remove event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUpdate {
    /// Interface name.
    pub device: String,
    /// Whether the interface is a loopback device.
    pub loopback: bool,
    /// Whether the interface was added (or removed).
    pub add: bool,
}

/// Source of link updates. The production implementation subscribes to
/// RTNETLINK; tests inject a channel of their own.
#[async_trait]
pub trait LinkEvents: Send + Sync {
    /// Subscribes to link updates until stop is cancelled.
    async fn subscribe(&self, stop: CancellationToken) -> Result<mpsc::Receiver<LinkUpdate>>;
}

// Netlink constants for the link subscription
const RTMGRP_LINK: u32 = 1;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const IFLA_IFNAME: u16 = 3;
const IFF_LOOPBACK: u32 = 0x8;
const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Link updates from an RTNETLINK socket joined to the link multicast
/// group. Messages are read on a dedicated thread with a receive timeout
/// so cancellation is observed.
pub struct RtnetlinkEvents;

#[async_trait]
impl LinkEvents for RtnetlinkEvents {
    async fn subscribe(&self, stop: CancellationToken) -> Result<mpsc::Receiver<LinkUpdate>> {
        let fd = open_link_socket()?;
        let (tx, rx) = mpsc::channel(16);
        std::thread::spawn(move || read_loop(fd, tx, stop));
        Ok(rx)
    }
}

/// Opens an AF_NETLINK socket bound to the link multicast group.
fn open_link_socket() -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(Error::Netlink(format!(
            "failed to create netlink socket: {}",
            std::io::Error::last_os_error()
        )));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = RTMGRP_LINK;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Netlink(format!(
            "failed to bind netlink socket: {}",
            std::io::Error::last_os_error()
        )));
    }

    // receive timeout so the reader thread can observe cancellation
    let tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 500_000,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Netlink(format!(
            "failed to set netlink receive timeout: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(fd)
}

/// Reads netlink datagrams and forwards parsed link updates until the
/// receiver is gone or stop is cancelled.
fn read_loop(fd: OwnedFd, tx: mpsc::Sender<LinkUpdate>, stop: CancellationToken) {
    let mut buf = [0u8; 8192];
    while !stop.is_cancelled() {
        let n = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => continue,
                std::io::ErrorKind::Interrupted => continue,
                _ => {
                    error!("netlink receive error: {}", err);
                    return;
                }
            }
        }
        for update in parse_link_messages(&buf[..n as usize]) {
            debug!("link update: {:?}", update);
            if tx.blocking_send(update).is_err() {
                return;
            }
        }
    }
}

/// Parses RTM_NEWLINK/RTM_DELLINK messages out of a netlink datagram.
fn parse_link_messages(data: &[u8]) -> Vec<LinkUpdate> {
    let mut updates = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= data.len() {
        let len = u32::from_ne_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let typ = u16::from_ne_bytes([data[offset + 4], data[offset + 5]]);
        if len < NLMSG_HDRLEN || offset + len > data.len() {
            break;
        }

        if typ == RTM_NEWLINK || typ == RTM_DELLINK {
            let body = &data[offset + NLMSG_HDRLEN..offset + len];
            if body.len() >= IFINFOMSG_LEN {
                // ifinfomsg: family, pad, type, index, flags, change
                let flags = u32::from_ne_bytes([body[8], body[9], body[10], body[11]]);
                if let Some(device) = parse_ifname(&body[IFINFOMSG_LEN..]) {
                    updates.push(LinkUpdate {
                        device,
                        loopback: flags & IFF_LOOPBACK != 0,
                        add: typ == RTM_NEWLINK,
                    });
                }
            }
        }
        offset += nlmsg_align(len);
    }
    updates
}

/// Extracts the IFLA_IFNAME attribute from a link message's attributes.
fn parse_ifname(mut attrs: &[u8]) -> Option<String> {
    while attrs.len() >= 4 {
        let rta_len = u16::from_ne_bytes([attrs[0], attrs[1]]) as usize;
        let rta_type = u16::from_ne_bytes([attrs[2], attrs[3]]);
        if rta_len < 4 || rta_len > attrs.len() {
            return None;
        }
        if rta_type == IFLA_IFNAME {
            let value = &attrs[4..rta_len];
            let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
            return Some(String::from_utf8_lossy(&value[..end]).into_owned());
        }
        let next = nlmsg_align(rta_len);
        if next >= attrs.len() {
            break;
        }
        attrs = &attrs[next..];
    }
    None
}

/// Device monitor delivering link updates from a [`LinkEvents`] source.
pub struct DevMon {
    events: Arc<dyn LinkEvents>,
    stop: CancellationToken,
    updates: Option<mpsc::Receiver<LinkUpdate>>,
}

impl DevMon {
    /// Creates a new device monitor.
    pub fn new(events: Arc<dyn LinkEvents>, stop: CancellationToken) -> Self {
        Self {
            events,
            stop,
            updates: None,
        }
    }

    /// Starts the subscription. Starting twice is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.updates.is_some() {
            return Ok(());
        }
        self.updates = Some(self.events.subscribe(self.stop.child_token()).await?);
        Ok(())
    }

    /// Stops the subscription.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Takes the update channel. Can be taken once after start.
    pub fn take_updates(&mut self) -> Option<mpsc::Receiver<LinkUpdate>> {
        self.updates.take()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a netlink link message with the given type, flags and name.
    fn link_message(typ: u16, flags: u32, name: &str) -> Vec<u8> {
        let mut attr = Vec::new();
        let name_bytes = name.as_bytes();
        let rta_len = 4 + name_bytes.len() + 1;
        attr.extend_from_slice(&(rta_len as u16).to_ne_bytes());
        attr.extend_from_slice(&IFLA_IFNAME.to_ne_bytes());
        attr.extend_from_slice(name_bytes);
        attr.push(0);
        while attr.len() % 4 != 0 {
            attr.push(0);
        }

        let len = NLMSG_HDRLEN + IFINFOMSG_LEN + attr.len();
        let mut msg = Vec::new();
        msg.extend_from_slice(&(len as u32).to_ne_bytes());
        msg.extend_from_slice(&typ.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
        msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
        msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
        // ifinfomsg
        msg.push(0); // family
        msg.push(0); // pad
        msg.extend_from_slice(&0u16.to_ne_bytes()); // type
        msg.extend_from_slice(&2i32.to_ne_bytes()); // index
        msg.extend_from_slice(&flags.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes()); // change
        msg.extend_from_slice(&attr);
        msg
    }

    #[test]
    fn test_parse_new_link() {
        let data = link_message(RTM_NEWLINK, 0, "wlan0");
        let updates = parse_link_messages(&data);
        assert_eq!(
            updates,
            vec![LinkUpdate {
                device: "wlan0".into(),
                loopback: false,
                add: true,
            }]
        );
    }

    #[test]
    fn test_parse_del_link() {
        let data = link_message(RTM_DELLINK, 0, "wlan0");
        let updates = parse_link_messages(&data);
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].add);
    }

    #[test]
    fn test_parse_loopback() {
        let data = link_message(RTM_NEWLINK, IFF_LOOPBACK, "lo");
        let updates = parse_link_messages(&data);
        assert!(updates[0].loopback);
    }

    #[test]
    fn test_parse_multiple_messages() {
        let mut data = link_message(RTM_NEWLINK, 0, "eth0");
        data.extend_from_slice(&link_message(RTM_DELLINK, 0, "wlan0"));
        let updates = parse_link_messages(&data);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].device, "eth0");
        assert_eq!(updates[1].device, "wlan0");
    }

    #[test]
    fn test_parse_truncated_message() {
        let data = link_message(RTM_NEWLINK, 0, "eth0");
        assert!(parse_link_messages(&data[..10]).is_empty());
    }

    #[tokio::test]
    async fn test_devmon_with_fake_events() {
        let (events, tx) = testing::FakeLinkEvents::new();
        let mut devmon = DevMon::new(events, CancellationToken::new());
        devmon.start().await.unwrap();
        devmon.start().await.unwrap(); // idempotent

        let mut updates = devmon.take_updates().unwrap();
        tx.send(LinkUpdate {
            device: "wlan0".into(),
            loopback: false,
            add: true,
        })
        .await
        .unwrap();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.device, "wlan0");
        devmon.stop();
    }
}
