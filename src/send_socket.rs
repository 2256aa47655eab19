use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use crate::error::{RudpError, RudpResult};

/// This is an abstraction for sending a single datagram to a peer. It is the only path through
///  which sessions write to the network, and it exists to facilitate mocking the I/O part away
///  for testing.
///
/// There is no backpressure or flow control beyond what the OS socket provides.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> RudpResult<()>;
}

/// A UDP socket that can be closed while other parts of the code still hold a reference to it.
///  After `close`, all operations fail with `Closed`, and the OS socket is released as soon as
///  in-flight operations finish.
pub struct SharedSocket {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl SharedSocket {
    pub fn new(socket: UdpSocket) -> SharedSocket {
        SharedSocket {
            socket: RwLock::new(Some(Arc::new(socket))),
        }
    }

    /// The socket for a single operation. Callers must not keep it beyond that operation, since
    ///  that would keep the OS socket alive after `close`.
    pub fn get(&self) -> RudpResult<Arc<UdpSocket>> {
        self.socket.read().unwrap()
            .clone()
            .ok_or(RudpError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.socket.read().unwrap().is_none()
    }

    /// Releases the socket. Returns `true` for the call that actually closed it, `false` if it
    ///  was closed before.
    pub fn close(&self) -> bool {
        let socket = self.socket.write().unwrap().take();
        match socket {
            Some(socket) => {
                debug!("closing UDP socket {:?}", socket.local_addr().ok());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SendSocket for SharedSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> RudpResult<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        let socket = self.get()?;
        if let Err(e) = socket.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
            return Err(e.into());
        }
        Ok(())
    }
}
