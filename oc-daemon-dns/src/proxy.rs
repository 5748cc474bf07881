//! Split-DNS forwarding proxy (UDP/TCP)

use crate::config::DnsProxyConfig;
use crate::error::{DnsProxyError, Result};
use crate::remotes::{normalize, Remotes};
use crate::report::Report;
use crate::watches::Watches;
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::BinDecodable;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timeout for a single upstream exchange. Upstream failures are not
/// retried, clients run their own retries.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the temporary-watch janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the report channel.
const REPORT_CHANNEL_SIZE: usize = 16;

/// Shared state of the request handlers.
struct HandlerCtx {
    remotes: Arc<Remotes>,
    watches: Arc<Watches>,
    reports: mpsc::Sender<Report>,
    shutdown: CancellationToken,
}

/// DNS proxy. Forwards client queries to the upstream servers in the
/// remotes table and reports A/AAAA answers for watched names.
pub struct Proxy {
    config: DnsProxyConfig,
    remotes: Arc<Remotes>,
    watches: Arc<Watches>,
    reports_tx: Mutex<Option<mpsc::Sender<Report>>>,
    reports_rx: Mutex<Option<mpsc::Receiver<Report>>>,
    shutdown: CancellationToken,
    started: Mutex<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Proxy {
    /// Creates a new proxy for config. The proxy is single-use: once
    /// stopped it cannot be started again.
    pub fn new(config: DnsProxyConfig) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_SIZE);
        Self {
            config,
            remotes: Arc::new(Remotes::new()),
            watches: Arc::new(Watches::new()),
            reports_tx: Mutex::new(Some(reports_tx)),
            reports_rx: Mutex::new(Some(reports_rx)),
            shutdown: CancellationToken::new(),
            started: Mutex::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Takes the report channel. The consumer must drain it; every report
    /// blocks its handler until `done` is raised or the report is dropped.
    pub fn reports(&self) -> Option<mpsc::Receiver<Report>> {
        self.reports_rx.lock().take()
    }

    /// Replaces the mapping from DNS name suffixes to upstream servers.
    pub fn set_remotes(&self, remotes: HashMap<String, Vec<String>>) {
        self.remotes.flush();
        for (domain, servers) in remotes {
            self.remotes.add(&domain, servers);
        }
    }

    /// Replaces the watched names and clears the temporary watches.
    pub fn set_watches(&self, watches: &[String]) {
        self.watches.flush();
        for domain in watches {
            self.watches.add(domain);
        }
    }

    /// Returns the bound UDP (or TCP) address after a successful start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts the proxy listeners. Starting an already started proxy is a
    /// no-op; a bind failure leaves the proxy stopped.
    pub async fn start(&self) -> Result<()> {
        if *self.started.lock() {
            return Ok(());
        }

        let reports = match self.reports_tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Ok(()), // already stopped
        };
        let ctx = Arc::new(HandlerCtx {
            remotes: self.remotes.clone(),
            watches: self.watches.clone(),
            reports,
            shutdown: self.shutdown.clone(),
        });

        let mut bound = None;
        if self.config.listen_udp {
            let socket = Arc::new(UdpSocket::bind(self.config.address).await?);
            let udp_addr = socket.local_addr()?;
            info!("DNS proxy listening on udp {}", udp_addr);
            bound = Some(udp_addr);
            tokio::spawn(run_udp_server(socket, ctx.clone()));
        }
        if self.config.listen_tcp {
            // share the port with the UDP listener when it picked one
            let addr = bound.unwrap_or(self.config.address);
            let listener = TcpListener::bind(addr).await?;
            let tcp_addr = listener.local_addr()?;
            if bound.is_none() {
                bound = Some(tcp_addr);
            }
            info!("DNS proxy listening on tcp {}", tcp_addr);
            tokio::spawn(run_tcp_server(listener, ctx.clone()));
        }

        let watches = self.watches.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => watches.cleanup(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        *self.local_addr.lock() = bound;
        *self.started.lock() = true;
        Ok(())
    }

    /// Stops the proxy, unblocking all in-flight handlers and closing the
    /// report channel once they have finished. Stopping twice is a no-op.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.reports_tx.lock().take();
    }
}

/// Runs the UDP listener until shutdown.
async fn run_udp_server(socket: Arc<UdpSocket>, ctx: Arc<HandlerCtx>) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        let data = buf[..len].to_vec();
                        let ctx = ctx.clone();
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = handle_request(&ctx, &data).await {
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    error!("DNS proxy could not send reply to {}: {}", peer, e);
                                }
                            }
                        });
                    }
                    Err(e) => error!("DNS proxy UDP receive error: {}", e),
                }
            }
            _ = ctx.shutdown.cancelled() => break,
        }
    }
}

/// Runs the TCP listener until shutdown.
async fn run_tcp_server(listener: TcpListener, ctx: Arc<HandlerCtx>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_tcp_connection(stream, &ctx).await {
                                debug!("DNS proxy TCP connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("DNS proxy TCP accept error: {}", e),
                }
            }
            _ = ctx.shutdown.cancelled() => break,
        }
    }
}

/// Handles length-prefixed DNS messages on a TCP connection.
async fn handle_tcp_connection(mut stream: TcpStream, ctx: &HandlerCtx) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        tokio::select! {
            result = stream.read_exact(&mut len_buf) => {
                if result.is_err() {
                    break; // connection closed
                }
            }
            _ = ctx.shutdown.cancelled() => break,
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        if let Some(reply) = handle_request(ctx, &buf).await {
            let len = (reply.len() as u16).to_be_bytes();
            stream.write_all(&len).await?;
            stream.write_all(&reply).await?;
        }
    }
    Ok(())
}

/// Handles a single DNS client request and returns the reply to forward,
/// if any. All failures only drop the in-flight query.
async fn handle_request(ctx: &HandlerCtx, data: &[u8]) -> Option<Vec<u8>> {
    let request = match Message::from_bytes(data) {
        Ok(m) => m,
        Err(e) => {
            warn!("DNS proxy received malformed client request: {}", e);
            return None;
        }
    };
    if request.queries().len() != 1 {
        error!("DNS proxy received invalid client request");
        return None;
    }
    let question = normalize(&request.queries()[0].name().to_string());

    let upstreams = ctx.remotes.get(&question);
    if upstreams.is_empty() {
        error!("DNS proxy has no upstream servers for {}", question);
        return None;
    }
    // pick one upstream uniformly at random
    let upstream = &upstreams[rand::thread_rng().gen_range(0..upstreams.len())];

    let reply = match exchange(data, upstream).await {
        Ok(r) => r,
        Err(e) => {
            debug!("DNS proxy exchange with {} failed: {}", upstream, e);
            return None;
        }
    };
    let msg = match Message::from_bytes(&reply) {
        Ok(m) => m,
        Err(e) => {
            warn!("DNS proxy received malformed upstream reply: {}", e);
            return None;
        }
    };

    let watched_question = ctx.watches.contains(&question);
    let watched = |name: &str| watched_question || ctx.watches.contains(name);

    // Alias targets must enter the temporary watch set before the address
    // pass sees their owners: DNAME first, then CNAME, then A/AAAA.
    for rec in msg.answers() {
        if let RData::DNAME(target) = rec.data() {
            if watched(&rec.name().to_string()) {
                ctx.watches.add_temp_dname(&target.0.to_string(), rec.ttl());
            }
        }
    }
    for rec in msg.answers() {
        if let RData::CNAME(target) = rec.data() {
            if watched(&rec.name().to_string()) {
                ctx.watches.add_temp_cname(&target.0.to_string(), rec.ttl());
            }
        }
    }
    for rec in msg.answers() {
        let ip = match rec.data() {
            RData::A(a) => std::net::IpAddr::V4(a.0),
            RData::AAAA(aaaa) => std::net::IpAddr::V6(aaaa.0),
            _ => continue,
        };
        if !watched(&rec.name().to_string()) {
            continue;
        }

        let (report, done) = Report::new(normalize(&rec.name().to_string()), ip, rec.ttl());
        debug!("DNS proxy reporting {:?}", report);
        if ctx.reports.send(report).await.is_err() {
            warn!("DNS proxy report channel closed");
            break;
        }
        // block until the address is installed so the client cannot use
        // it before the route exists
        tokio::select! {
            _ = done => {}
            _ = ctx.shutdown.cancelled() => return None,
        }
    }

    Some(reply)
}

/// Exchanges a raw DNS message with the upstream server over UDP.
async fn exchange(data: &[u8], upstream: &str) -> Result<Vec<u8>> {
    let addr: SocketAddr = upstream
        .parse()
        .map_err(|_| DnsProxyError::InvalidUpstream(upstream.to_string()))?;
    let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(data, addr).await?;

    let mut buf = vec![0u8; 4096];
    let (len, _) = timeout(EXCHANGE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| DnsProxyError::Timeout)??;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::{IpAddr, Ipv4Addr};

    /// Spawns a fake upstream answering every query with the records
    /// produced by `answers` for the question name.
    async fn spawn_upstream<F>(answers: F) -> SocketAddr
    where
        F: Fn(&Name) -> Vec<Record> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let request = match Message::from_bytes(&buf[..len]) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let query = request.queries()[0].clone();
                let mut reply = Message::new();
                reply.set_id(request.id());
                reply.set_message_type(MessageType::Response);
                reply.set_op_code(OpCode::Query);
                reply.set_recursion_desired(request.recursion_desired());
                reply.set_recursion_available(true);
                reply.set_response_code(ResponseCode::NoError);
                let name = query.name().clone();
                reply.add_query(query);
                for answer in answers(&name) {
                    reply.add_answer(answer);
                }
                let data = reply.to_bytes().unwrap();
                let _ = socket.send_to(&data, peer).await;
            }
        });
        addr
    }

    /// Starts a proxy on an ephemeral port with the given upstream as
    /// catch-all and a consumer that records reports and raises done.
    async fn start_proxy(
        upstream: SocketAddr,
        watches: &[String],
    ) -> (Proxy, mpsc::Receiver<(String, IpAddr, u32)>) {
        let config = DnsProxyConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            listen_udp: true,
            listen_tcp: true,
        };
        let proxy = Proxy::new(config);
        proxy.start().await.unwrap();
        proxy.set_remotes(HashMap::from([(
            ".".to_string(),
            vec![upstream.to_string()],
        )]));
        proxy.set_watches(watches);

        let mut reports = proxy.reports().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(mut report) = reports.recv().await {
                let _ = seen_tx
                    .send((report.name.clone(), report.ip, report.ttl))
                    .await;
                report.done();
            }
        });
        (proxy, seen_rx)
    }

    fn query_bytes(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_ascii(name).unwrap(),
            RecordType::A,
        ));
        msg.to_bytes().unwrap()
    }

    async fn udp_query(proxy_addr: SocketAddr, data: &[u8]) -> Option<Message> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(data, proxy_addr).await.unwrap();
        let mut buf = vec![0u8; 4096];
        match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(Message::from_bytes(&buf[..len]).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_start_twice() {
        let proxy = Proxy::new(DnsProxyConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            listen_udp: true,
            listen_tcp: false,
        });
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().unwrap();
        proxy.start().await.unwrap();
        assert_eq!(proxy.local_addr(), Some(addr));
        proxy.stop();
    }

    #[tokio::test]
    async fn test_watched_exclude_resolution() {
        let upstream = spawn_upstream(|name| {
            if name.to_string().starts_with("api.intra.") {
                vec![
                    Record::from_rdata(
                        Name::from_ascii("api.intra.example.com.").unwrap(),
                        60,
                        RData::CNAME(CNAME(
                            Name::from_ascii("api.internal.example.com.").unwrap(),
                        )),
                    ),
                    Record::from_rdata(
                        Name::from_ascii("api.internal.example.com.").unwrap(),
                        60,
                        RData::A(A(Ipv4Addr::new(192, 0, 2, 10))),
                    ),
                ]
            } else {
                vec![Record::from_rdata(
                    Name::from_ascii("api.internal.example.com.").unwrap(),
                    60,
                    RData::A(A(Ipv4Addr::new(192, 0, 2, 11))),
                )]
            }
        })
        .await;
        let (proxy, mut seen) = start_proxy(upstream, &["intra.example.com".into()]).await;
        let addr = proxy.local_addr().unwrap();

        let reply = udp_query(addr, &query_bytes("api.intra.example.com."))
            .await
            .expect("no reply from proxy");
        assert_eq!(reply.answers().len(), 2);

        let (name, ip, ttl) = seen.recv().await.unwrap();
        assert_eq!(name, "api.internal.example.com.");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        assert_eq!(ttl, 60);

        // the CNAME target is now temporarily watched, a direct query for
        // it must be reported as well
        let reply = udp_query(addr, &query_bytes("api.internal.example.com."))
            .await
            .expect("no reply from proxy");
        assert_eq!(reply.answers().len(), 1);
        let (name, ip, _) = seen.recv().await.unwrap();
        assert_eq!(name, "api.internal.example.com.");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11)));

        proxy.stop();
    }

    #[tokio::test]
    async fn test_unwatched_name_not_reported() {
        let upstream = spawn_upstream(|name| {
            vec![Record::from_rdata(
                name.clone(),
                60,
                RData::A(A(Ipv4Addr::new(203, 0, 113, 1))),
            )]
        })
        .await;
        let (proxy, mut seen) = start_proxy(upstream, &["intra.example.com".into()]).await;
        let addr = proxy.local_addr().unwrap();

        let reply = udp_query(addr, &query_bytes("www.example.org."))
            .await
            .expect("no reply from proxy");
        assert_eq!(reply.answers().len(), 1);
        assert!(seen.try_recv().is_err());

        proxy.stop();
    }

    #[tokio::test]
    async fn test_no_remotes_drops_query() {
        let config = DnsProxyConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            listen_udp: true,
            listen_tcp: false,
        };
        let proxy = Proxy::new(config);
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&query_bytes("example.com."), addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let result = timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await;
        assert!(result.is_err());

        proxy.stop();
    }

    #[tokio::test]
    async fn test_invalid_question_count_dropped() {
        let upstream = spawn_upstream(|name| {
            vec![Record::from_rdata(
                name.clone(),
                60,
                RData::A(A(Ipv4Addr::new(203, 0, 113, 1))),
            )]
        })
        .await;
        let (proxy, _seen) = start_proxy(upstream, &[]).await;
        let addr = proxy.local_addr().unwrap();

        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(
            Name::from_ascii("a.example.com.").unwrap(),
            RecordType::A,
        ));
        msg.add_query(Query::query(
            Name::from_ascii("b.example.com.").unwrap(),
            RecordType::A,
        ));
        let reply = udp_query(addr, &msg.to_bytes().unwrap()).await;
        assert!(reply.is_none());

        proxy.stop();
    }

    #[tokio::test]
    async fn test_upstream_outage() {
        // an upstream that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let (proxy, mut seen) = start_proxy(silent_addr, &["intra.example.com".into()]).await;
        let addr = proxy.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&query_bytes("api.intra.example.com."), addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let result = timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await;
        assert!(result.is_err());
        assert!(seen.try_recv().is_err());

        // the proxy keeps serving after the failed exchange
        let upstream = spawn_upstream(|name| {
            vec![Record::from_rdata(
                name.clone(),
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 20))),
            )]
        })
        .await;
        proxy.set_remotes(HashMap::from([(
            ".".to_string(),
            vec![upstream.to_string()],
        )]));
        let reply = udp_query(addr, &query_bytes("api.intra.example.com."))
            .await
            .expect("no reply after upstream recovery");
        assert_eq!(reply.answers().len(), 1);

        proxy.stop();
    }

    #[tokio::test]
    async fn test_tcp_query() {
        let upstream = spawn_upstream(|name| {
            vec![Record::from_rdata(
                name.clone(),
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 30))),
            )]
        })
        .await;
        let (proxy, mut seen) = start_proxy(upstream, &["intra.example.com".into()]).await;
        let addr = proxy.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let data = query_bytes("db.intra.example.com.");
        stream
            .write_all(&(data.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&data).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await.unwrap();
        let reply = Message::from_bytes(&buf).unwrap();
        assert_eq!(reply.answers().len(), 1);

        let (name, ip, _) = seen.recv().await.unwrap();
        assert_eq!(name, "db.intra.example.com.");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 30)));

        proxy.stop();
    }
}
