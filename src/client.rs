use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::batch_sender::DatagramSink;
use crate::buffer_pool::receive_buffer_pool;
use crate::config::ClientConfig;
use crate::error::{RudpError, RudpResult};
use crate::send_socket::SharedSocket;

/// A UDP socket connected to a single peer.
///
/// There are two flavors of send and receive: `send_raw` and `receive_into` go straight to the
///  socket without allocation or timers, and they are what high-frequency code should use.
///  `send` and `receive` apply the configured timeouts, and `receive` returns an owned copy of
///  the datagram.
pub struct Client {
    config: ClientConfig,
    socket: SharedSocket,
    close_signal: CancellationToken,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> RudpResult<Client> {
        let bind_addr = if config.target_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(config.target_addr).await?;
        info!("client socket {:?} connected to {:?}", socket.local_addr()?, config.target_addr);

        Ok(Client {
            config,
            socket: SharedSocket::new(socket),
            close_signal: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> RudpResult<SocketAddr> {
        Ok(self.socket.get()?.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.config.target_addr
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    fn open_socket(&self) -> RudpResult<Arc<UdpSocket>> {
        self.socket.get()
    }

    async fn with_deadline<T>(deadline: Option<Duration>, f: impl Future<Output = std::io::Result<T>>) -> RudpResult<T> {
        match deadline {
            Some(deadline) => match timeout(deadline, f).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(RudpError::Timeout),
            },
            None => Ok(f.await?),
        }
    }

    /// Sends a datagram, failing with `Timeout` if the socket does not accept it within the
    ///  configured write timeout
    pub async fn send(&self, data: &[u8]) -> RudpResult<usize> {
        let socket = self.open_socket()?;
        trace!("sending {} bytes to {:?}", data.len(), self.config.target_addr);
        Self::with_deadline(self.config.write_timeout, socket.send(data)).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> RudpResult<usize> {
        let socket = self.open_socket()?;
        Ok(socket.send(data).await?)
    }

    /// Receives a single datagram into a pooled buffer and returns a copy of exactly the
    ///  received bytes. Fails with `Cancelled` if `cancel` is (or becomes) cancelled, with
    ///  `Timeout` if the read timeout expires, and with `Closed` if the client is closed.
    pub async fn receive(&self, cancel: &CancellationToken) -> RudpResult<Vec<u8>> {
        let socket = self.open_socket()?;
        if cancel.is_cancelled() {
            return Err(RudpError::Cancelled);
        }

        let pool = receive_buffer_pool();
        let mut buf = pool.get_from_pool();

        let result = select! {
            _ = cancel.cancelled() => Err(RudpError::Cancelled),
            _ = self.close_signal.cancelled() => Err(RudpError::Closed),
            r = Self::with_deadline(self.config.read_timeout, socket.recv(&mut buf)) => r,
        };
        let result = result.map(|num_read| buf[..num_read].to_vec());

        pool.return_to_pool(buf);
        result
    }

    /// Receives a single datagram directly into `buf`, returning the number of bytes read. If
    ///  the datagram is longer than `buf`, the rest is discarded by the OS.
    pub async fn receive_into(&self, buf: &mut [u8]) -> RudpResult<usize> {
        let socket = self.open_socket()?;

        select! {
            _ = self.close_signal.cancelled() => Err(RudpError::Closed),
            r = socket.recv(buf) => Ok(r?),
        }
    }

    /// Closes the client and its socket, failing all pending and future operations with
    ///  `Closed`. Calling this more than once is harmless.
    pub fn close(&self) {
        if !self.socket.close() {
            trace!("client already closed");
            return;
        }
        debug!("closed client connected to {:?}", self.config.target_addr);
        self.close_signal.cancel();
    }
}

#[async_trait]
impl DatagramSink for Client {
    async fn send_datagram(&self, datagram: &[u8]) -> RudpResult<()> {
        self.send_raw(datagram).await?;
        Ok(())
    }
}
