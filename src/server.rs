use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, trace_span, warn, Instrument};

use crate::config::{ReliabilityConfig, ServerConfig};
use crate::packet::Packet;
use crate::priority_queue::PriorityQueue;
use crate::send_socket::SharedSocket;
use crate::session::Session;

/// Application callback for payloads received by a [`Server`]. Each call runs in its own task,
///  so calls for the same session may overlap.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, context: CancellationToken, session: Arc<Session>, payload: Bytes) -> anyhow::Result<()>;
}

/// Sessions by peer address. Sessions are never removed implicitly.
#[derive(Default)]
struct SessionRegistry {
    sessions: RwLock<FxHashMap<SocketAddr, Arc<Session>>>,
}

impl SessionRegistry {
    fn get(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.read().unwrap()
            .get(addr)
            .cloned()
    }

    fn get_or_create(&self, addr: SocketAddr, create: impl FnOnce() -> Session) -> Arc<Session> {
        if let Some(session) = self.get(&addr) {
            return session;
        }

        self.sessions.write().unwrap()
            .entry(addr)
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap()
            .values()
            .cloned()
            .collect()
    }

    fn remove(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.write().unwrap()
            .remove(addr)
    }

    fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    fn clear(&self) {
        self.sessions.write().unwrap().clear();
    }
}

/// Pause after a socket error that is not caused by a single peer, so that a persistent error
///  does not turn the receive loop into a busy loop
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Errors that are caused by an individual peer (e.g. ICMP 'port unreachable' reported back on
///  the socket) and do not affect reading from the socket as a whole
fn is_peer_error(e: &std::io::Error) -> bool {
    matches!(e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// The state shared by the server's background tasks
struct ServerCore {
    config: Arc<ServerConfig>,
    reliability: Arc<ReliabilityConfig>,
    socket: Arc<SharedSocket>,
    sessions: SessionRegistry,
    outbound: Arc<PriorityQueue<SocketAddr>>,
    handler: Arc<dyn Handler>,
    handler_permits: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl ServerCore {
    fn get_or_create_session(&self, addr: SocketAddr) -> Arc<Session> {
        self.sessions.get_or_create(addr, || {
            info!("new session for {:?}", addr);
            Session::new(
                addr,
                self.reliability.clone(),
                self.socket.clone(),
                Some(self.outbound.clone()),
                &self.shutdown,
            )
        })
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let socket = match self.socket.get() {
            Ok(socket) => socket,
            Err(_) => {
                warn!("socket closed before the receive loop started");
                return;
            }
        };

        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            let (num_read, from) = select! {
                _ = self.shutdown.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) if is_peer_error(&e) => {
                        debug!("socket error caused by a peer: {}", e);
                        continue;
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                        select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = sleep(RECV_ERROR_BACKOFF) => continue,
                        }
                    }
                }
            };

            let span = trace_span!("packet_received", peer = %from);
            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }

        info!("receive loop stopped");
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received {} bytes from {:?}", datagram.len(), from);

        let packet = match Packet::deser(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed datagram from {:?}: {}", from, e);
                return;
            }
        };

        let session = self.get_or_create_session(from);
        if let Err(e) = session.process_packet(&packet).await {
            error!("error acknowledging packet from {:?}: {}", from, e);
        }

        if packet.payload.is_empty() {
            return;
        }

        let permit = match &self.handler_permits {
            None => None,
            Some(permits) => select! {
                _ = self.shutdown.cancelled() => return,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("handler permits closed, dropping payload from {:?}", from);
                        return;
                    }
                }
            },
        };

        let handler = self.handler.clone();
        let context = session.context();
        tokio::spawn(async move {
            let _permit = permit;
            let peer_addr = session.remote_addr();
            if let Err(e) = handler.handle(context, session, packet.payload).await {
                error!("handler failed for payload from {:?}: {:#}", peer_addr, e);
            }
        });
    }

    async fn resend_loop(self: Arc<Self>) {
        let mut resend_interval = interval(self.config.resend_interval);
        resend_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                _ = resend_interval.tick() => {
                    for session in self.sessions.snapshot() {
                        session.check_resends().await;
                    }
                }
            }
        }

        debug!("resend loop stopped");
    }

    async fn priority_loop(self: Arc<Self>) {
        loop {
            let message = select! {
                _ = self.shutdown.cancelled() => break,
                message = self.outbound.dequeue_blocking() => message,
            };

            match self.sessions.get(&message.target) {
                Some(session) => {
                    if let Err(e) = session.dispatch_priority(&message.data, message.priority).await {
                        error!("error sending {:?} priority message to {:?}: {}", message.priority, message.target, e);
                    }
                }
                None => debug!("dropping priority message for {:?}: no such session", message.target),
            }
        }

        debug!("priority dispatch loop stopped");
    }
}

/// Listens on a UDP socket, keeping a [`Session`] per peer address and dispatching received
///  payloads to a [`Handler`].
///
/// There are three background tasks: the receive loop, the resend sweep, and the dispatch of
///  priority messages queued by `Session::send_priority`.
pub struct Server {
    core: Arc<ServerCore>,
    local_addr: SocketAddr,
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Binds the socket and spawns the background tasks, returning without waiting for traffic
    pub async fn start(config: ServerConfig, handler: Arc<dyn Handler>) -> anyhow::Result<Server> {
        config.validate()?;

        let socket = UdpSocket::bind(config.listen_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound server socket to {:?}", local_addr);

        let handler_permits = if config.max_concurrent_handlers > 0 {
            Some(Arc::new(Semaphore::new(config.max_concurrent_handlers)))
        }
        else {
            warn!("handler concurrency is unbounded");
            None
        };

        let core = Arc::new(ServerCore {
            reliability: Arc::new(config.reliability.clone()),
            config: Arc::new(config),
            socket: Arc::new(SharedSocket::new(socket)),
            sessions: SessionRegistry::default(),
            outbound: Arc::new(PriorityQueue::new()),
            handler,
            handler_permits,
            shutdown: CancellationToken::new(),
        });

        let loops = vec![
            tokio::spawn(core.clone().recv_loop()),
            tokio::spawn(core.clone().resend_loop()),
            tokio::spawn(core.clone().priority_loop()),
        ];

        Ok(Server {
            core,
            local_addr,
            loops: std::sync::Mutex::new(loops),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server's top level context. Session contexts are derived from it.
    pub fn context(&self) -> CancellationToken {
        self.core.shutdown.clone()
    }

    pub fn session(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.core.sessions.get(addr)
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    /// Closes a session and removes it from the server. A later packet from the same address
    ///  creates a fresh session.
    pub fn remove_session(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let session = self.core.sessions.remove(addr)?;
        session.close();
        Some(session)
    }

    /// The queue that priority sends of all sessions go through
    pub fn outbound_queue(&self) -> &PriorityQueue<SocketAddr> {
        &self.core.outbound
    }

    /// Stops the background tasks, waits for them to finish and closes the socket. Handler
    ///  invocations that are already running are not aborted, but their contexts are cancelled
    ///  and their sends fail with `Closed`.
    pub async fn stop(&self) {
        info!("stopping server on {:?}", self.local_addr);
        self.core.shutdown.cancel();

        let loops: Vec<JoinHandle<()>> = self.loops.lock().unwrap().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!("server loop terminated abnormally: {}", e);
            }
        }

        self.core.socket.close();
        self.core.sessions.clear();
        info!("server on {:?} stopped", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
    }
}
