use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{self, RECV_BUF_LEN};

/// Settings shared by both responders.
#[derive(Debug, Clone)]
pub struct ResponderOptions {
    pub secret: Arc<[u8]>,
    /// Bound on reading the request and writing the reply on one TCP connection.
    pub timeout: Duration,
}

impl ResponderOptions {
    pub fn new(secret: &[u8], timeout: Duration) -> Self {
        Self {
            secret: Arc::from(secret),
            timeout,
        }
    }
}

pub struct TcpResponder {
    listener: TcpListener,
    opts: ResponderOptions,
}

impl TcpResponder {
    pub async fn bind(addr: SocketAddr, opts: ResponderOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding TCP responder on {addr}"))?;
        Ok(Self { listener, opts })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. Dropping the listener on return closes it.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("starting TCP server on {addr}");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopping TCP server on {addr}");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted
                        .with_context(|| format!("accepting on {addr}"))?;
                    tokio::spawn(handle_tcp(stream, peer, self.opts.clone()));
                }
            }
        }
    }
}

async fn handle_tcp(mut stream: TcpStream, peer: SocketAddr, opts: ResponderOptions) {
    debug!("serving TCP {peer}");
    if let Err(e) = stream.set_nodelay(true) {
        debug!("TCP nodelay warning for {peer}: {e}");
    }

    let mut buf = [0u8; RECV_BUF_LEN];
    let n = match time::timeout(opts.timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("TCP read error from {peer}: {e}");
            return;
        }
        Err(_) => {
            debug!("TCP read from {peer} timed out");
            return;
        }
    };
    debug!("[TCP] got data from {peer}: {}", protocol::printable(&buf[..n]));

    if let Some(reply) = protocol::response_for(&buf[..n], &opts.secret) {
        debug!("[TCP] handshake from {peer}");
        match time::timeout(opts.timeout, stream.write_all(reply)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("TCP write error to {peer}: {e}"),
            Err(_) => debug!("TCP write to {peer} timed out"),
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!("TCP shutdown error for {peer}: {e}");
    }
}

pub struct UdpResponder {
    socket: UdpSocket,
    opts: ResponderOptions,
}

impl UdpResponder {
    pub async fn bind(addr: SocketAddr, opts: ResponderOptions) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP responder on {addr}"))?;
        if let Err(e) = SockRef::from(&socket).set_recv_buffer_size(opts.secret.len() * 2) {
            debug!("UDP receive buffer warning: {e}");
        }
        Ok(Self { socket, opts })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Echo matching datagrams until `cancel` fires. Read errors are logged and skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("starting UDP server on {addr}");
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stopping UDP server on {addr}");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("UDP read error: {e}");
                        continue;
                    }
                },
            };
            debug!(
                "[UDP] data from {peer} len: {n}, data: {}",
                protocol::printable(&buf[..n])
            );
            if let Some(reply) = protocol::response_for(&buf[..n], &self.opts.secret) {
                debug!("[UDP] handshake from {peer}");
                if let Err(e) = self.socket.send_to(reply, peer).await {
                    warn!("UDP write error to {peer}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ResponderOptions {
        ResponderOptions::new(b"portquiz", Duration::from_secs(2))
    }

    #[tokio::test]
    async fn tcp_echoes_secret() {
        let r = TcpResponder::bind("127.0.0.1:0".parse().unwrap(), opts()).await.unwrap();
        let addr = r.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(r.run(cancel.clone()));

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"portquiz").await.unwrap();
        let mut buf = [0u8; RECV_BUF_LEN];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"portquiz");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_stays_silent_on_wrong_secret() {
        let r = TcpResponder::bind("127.0.0.1:0".parse().unwrap(), opts()).await.unwrap();
        let addr = r.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(r.run(cancel.clone()));

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"nope").await.unwrap();
        let mut buf = [0u8; RECV_BUF_LEN];
        // Server closes without replying.
        let n = time::timeout(Duration::from_secs(3), s.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn udp_echoes_secret() {
        let r = UdpResponder::bind("127.0.0.1:0".parse().unwrap(), opts()).await.unwrap();
        let addr = r.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(r.run(cancel.clone()));

        let c = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        c.connect(addr).await.unwrap();
        c.send(b"portquiz-extra").await.unwrap();
        let mut buf = [0u8; RECV_BUF_LEN];
        let n = time::timeout(Duration::from_secs(2), c.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"portquiz-extra");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
