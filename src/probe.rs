use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, UdpSocket};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::config::RunConfig;
use crate::protocol::{self, RECV_BUF_LEN};
use crate::types::{IpVersion, ProbeKind, Proto};

/// One attempt at deciding whether a port answers the handshake.
///
/// The worker pool is generic over this so retry and cancellation behaviour can be
/// driven by scripted probes in tests.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, kind: ProbeKind, port: u16) -> impl Future<Output = bool> + Send;
}

/// Probes a real host over the network. Any failure counts as closed for the attempt.
#[derive(Debug, Clone)]
pub struct NetProbe {
    host: Arc<str>,
    secret: Arc<[u8]>,
    timeout: Duration,
}

impl NetProbe {
    pub fn new(host: &str, secret: &[u8], timeout: Duration) -> Self {
        Self {
            host: Arc::from(host),
            secret: Arc::from(secret),
            timeout,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(&config.host, &config.secret, config.timeout)
    }

    /// Resolve the target, keeping only addresses of the pinned family.
    async fn resolve(&self, port: u16, version: IpVersion) -> io::Result<SocketAddr> {
        let mut addrs = time::timeout(self.timeout, lookup_host((&*self.host, port)))
            .await
            .map_err(|_| timed_out("resolve"))??;
        addrs.find(|a| family_matches(version, a)).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {version:?} address for {}", self.host),
            )
        })
    }

    async fn probe_tcp(&self, addr: SocketAddr, kind: ProbeKind) -> io::Result<bool> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        let buf_len = u32::try_from(self.secret.len()).unwrap_or(u32::MAX);
        if let Err(e) = socket.set_send_buffer_size(buf_len) {
            debug!("{kind} send buffer warning: {e}");
        }
        if let Err(e) = socket.set_recv_buffer_size(buf_len) {
            debug!("{kind} receive buffer warning: {e}");
        }

        let mut stream = time::timeout(self.timeout, socket.connect(addr))
            .await
            .map_err(|_| timed_out("connect"))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{kind} nodelay warning: {e}");
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; RECV_BUF_LEN];
        let exchange = async {
            time::timeout_at(deadline, stream.write_all(&self.secret))
                .await
                .map_err(|_| timed_out("write"))??;
            let n = time::timeout_at(deadline, stream.read(&mut buf))
                .await
                .map_err(|_| timed_out("read"))??;
            Ok::<_, io::Error>(n)
        }
        .await;

        if let Err(e) = stream.shutdown().await {
            debug!("{kind} shutdown error: {e}");
        }
        let n = exchange?;
        Ok(self.check_reply(kind, addr.port(), &buf[..n]))
    }

    async fn probe_udp(&self, addr: SocketAddr, kind: ProbeKind) -> io::Result<bool> {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        if let Err(e) = SockRef::from(&socket).set_recv_buffer_size(self.secret.len() * 2) {
            debug!("{kind} receive buffer warning: {e}");
        }

        let deadline = Instant::now() + self.timeout;
        time::timeout_at(deadline, socket.send(&self.secret))
            .await
            .map_err(|_| timed_out("send"))??;

        let mut buf = [0u8; RECV_BUF_LEN];
        // ICMP port-unreachable surfaces here as ConnectionRefused on a connected socket.
        let n = time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| timed_out("recv"))??;
        Ok(self.check_reply(kind, addr.port(), &buf[..n]))
    }

    fn check_reply(&self, kind: ProbeKind, port: u16, reply: &[u8]) -> bool {
        if protocol::is_valid_reply(reply, &self.secret) {
            debug!("{kind} OPEN {port}");
            true
        } else {
            debug!("{kind} {port} got data: {}", protocol::printable(reply));
            false
        }
    }
}

impl Probe for NetProbe {
    async fn probe(&self, kind: ProbeKind, port: u16) -> bool {
        let attempt = async {
            let addr = self.resolve(port, kind.version).await?;
            match kind.proto {
                Proto::Tcp => self.probe_tcp(addr, kind).await,
                Proto::Udp => self.probe_udp(addr, kind).await,
            }
        };
        match attempt.await {
            Ok(open) => open,
            Err(e) if is_closed_signal(&e) => {
                debug!("{kind} CLOSED {port}: {e}");
                false
            }
            Err(e) => {
                debug!("{kind} error for {}:{port}: {e}", self.host);
                false
            }
        }
    }
}

/// Refusals and timeouts are the expected way a port reads as closed.
fn is_closed_signal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
    )
}

fn family_matches(version: IpVersion, addr: &SocketAddr) -> bool {
    match version {
        IpVersion::Any => true,
        IpVersion::V4 => addr.is_ipv4(),
        IpVersion::V6 => addr.is_ipv6(),
    }
}

fn timed_out(step: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{step} timed out"))
}
