use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{ReliabilityConfig, RetryExhaustion};
use crate::error::RudpResult;
use crate::packet::{Packet, PacketKind};
use crate::priority_queue::{Priority, PriorityQueue};
use crate::send_socket::SendSocket;

/// A reliable packet that was sent and is waiting for its ACK
#[derive(Clone, Debug)]
struct PendingPacket {
    seq: u16,
    /// the serialized packet, resent as-is
    data: Bytes,
    sent_at: Instant,
    attempts: u32,
    exhausted: bool,
}

/// Sequence numbers within this distance of either end of the range are treated as wrapped
///  around when compared with a number at the other end
const WRAP_WINDOW: u16 = 0x4000;

/// `true` if `a` is more recent than `b`. This is a plain numeric comparison, except that a
///  number near 1 is newer than one near `u16::MAX` (and vice versa, older).
fn is_newer(a: u16, b: u16) -> bool {
    if b > u16::MAX - WRAP_WINDOW && a < WRAP_WINDOW {
        return true;
    }
    if a > u16::MAX - WRAP_WINDOW && b < WRAP_WINDOW {
        return false;
    }
    a > b
}

struct SessionInner {
    /// sequence number for the next reliable packet
    next_seq: u16,
    /// the highest reliable sequence number received from the peer, piggybacked on all
    ///  outgoing data packets
    last_ack_recv: u16,
    /// in order of first transmission
    send_queue: VecDeque<PendingPacket>,
}

impl SessionInner {
    fn take_next_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        // 0 means 'no ack' on the wire, so it is never used as a sequence number
        self.next_seq = match self.next_seq.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        seq
    }

    fn on_ack(&mut self, acked_seq: u16) {
        if let Some(idx) = self.send_queue.iter().position(|p| p.seq == acked_seq) {
            trace!("packet #{} acknowledged", acked_seq);
            self.send_queue.remove(idx);
        }
    }
}

/// The reliability state for a single peer.
///
/// All state changes (sending, processing incoming packets, the resend sweep) are serialized by
///  a single lock, which keeps ack processing and retransmission scheduling atomic relative to
///  each other.
pub struct Session {
    id: Uuid,
    peer_addr: SocketAddr,
    config: Arc<ReliabilityConfig>,
    send_socket: Arc<dyn SendSocket>,
    outbound: Option<Arc<PriorityQueue<SocketAddr>>>,
    context: CancellationToken,
    dropped_packets: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// `outbound` is the queue that `send_priority` goes through. Without it, priority sends
    ///  are dispatched immediately.
    pub fn new(
        peer_addr: SocketAddr,
        config: Arc<ReliabilityConfig>,
        send_socket: Arc<dyn SendSocket>,
        outbound: Option<Arc<PriorityQueue<SocketAddr>>>,
        parent_context: &CancellationToken,
    ) -> Session {
        let id = Uuid::new_v4();
        debug!("creating session {} for {:?}", id, peer_addr);

        Session {
            id,
            peer_addr,
            config,
            send_socket,
            outbound,
            context: parent_context.child_token(),
            dropped_packets: AtomicU64::new(0),
            inner: Mutex::new(SessionInner {
                next_seq: 1,
                last_ack_recv: 0,
                send_queue: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// This is cancelled when the session is closed or the server is stopped
    pub fn context(&self) -> CancellationToken {
        self.context.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_cancelled()
    }

    /// The number of reliable packets that were reported as dropped after exhausting their
    ///  retries
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.send_queue.len()
    }

    async fn write(&self, buf: &[u8]) -> RudpResult<()> {
        self.send_socket.do_send_packet(self.peer_addr, buf).await
    }

    /// alias for `send_unreliable`
    pub async fn send(&self, data: &[u8]) -> RudpResult<()> {
        self.send_unreliable(data).await
    }

    /// Fire and forget: no sequence number, no retry
    pub async fn send_unreliable(&self, data: &[u8]) -> RudpResult<()> {
        let last_ack_recv = self.inner.lock().await.last_ack_recv;

        let packet = Packet::unreliable(last_ack_recv, Bytes::copy_from_slice(data));
        trace!("sending {:?} to {:?}", packet, self.peer_addr);
        self.write(&packet.to_bytes()).await
    }

    /// Sends a packet that is retransmitted until it is acknowledged. This returns after the
    ///  first transmission, the result being that of the first write only.
    pub async fn send_reliable(&self, data: &[u8]) -> RudpResult<()> {
        let mut inner = self.inner.lock().await;

        let seq = inner.take_next_seq();
        let packet = Packet::reliable(seq, inner.last_ack_recv, Bytes::copy_from_slice(data));
        trace!("sending {:?} to {:?}", packet, self.peer_addr);

        let data = packet.to_bytes();
        inner.send_queue.push_back(PendingPacket {
            seq,
            data: data.clone(),
            sent_at: Instant::now(),
            attempts: 1,
            exhausted: false,
        });

        //NB: a failed first write stays in the queue and is picked up by the resend sweep
        self.write(&data).await
    }

    /// Queues `data` for sending according to its priority. High and critical priority
    ///  messages are sent reliably, the rest unreliably.
    pub async fn send_priority(&self, data: &[u8], priority: Priority) -> RudpResult<()> {
        match &self.outbound {
            Some(queue) => {
                queue.enqueue(Bytes::copy_from_slice(data), self.peer_addr, priority);
                Ok(())
            }
            None => self.dispatch_priority(data, priority).await,
        }
    }

    pub(crate) async fn dispatch_priority(&self, data: &[u8], priority: Priority) -> RudpResult<()> {
        if priority >= Priority::High {
            self.send_reliable(data).await
        }
        else {
            self.send_unreliable(data).await
        }
    }

    /// Updates acknowledgement state for an incoming packet, and acknowledges it if it is
    ///  reliable.
    pub async fn process_packet(&self, packet: &Packet) -> RudpResult<()> {
        let ack_seq = {
            let mut inner = self.inner.lock().await;

            if packet.ack != 0 {
                inner.on_ack(packet.ack);
            }

            if packet.kind != PacketKind::Reliable {
                return Ok(());
            }

            if inner.last_ack_recv == 0 || is_newer(packet.seq, inner.last_ack_recv) {
                inner.last_ack_recv = packet.seq;
            }
            packet.seq
        };

        trace!("acknowledging packet #{} from {:?}", ack_seq, self.peer_addr);
        self.write(&Packet::ack(ack_seq).to_bytes()).await
    }

    /// Resends all pending packets that were not acknowledged within the resend timeout, and
    ///  reports those that exhausted their retries.
    pub async fn check_resends(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let mut to_discard = Vec::new();
        for pending in inner.send_queue.iter_mut() {
            if now.duration_since(pending.sent_at) < self.config.resend_timeout {
                continue;
            }

            if pending.attempts >= self.config.max_retries {
                if !pending.exhausted {
                    warn!("reliable packet #{} to {:?} dropped after {} attempts", pending.seq, self.peer_addr, pending.attempts);
                    pending.exhausted = true;
                    self.dropped_packets.fetch_add(1, Ordering::Relaxed);
                }
                else {
                    debug!("reliable packet #{} to {:?} is still unacknowledged", pending.seq, self.peer_addr);
                }
                pending.sent_at = now;

                if self.config.on_retries_exhausted == RetryExhaustion::Discard {
                    to_discard.push(pending.seq);
                }
                continue;
            }

            pending.attempts += 1;
            pending.sent_at = now;
            trace!("resending packet #{} to {:?} (attempt {})", pending.seq, self.peer_addr, pending.attempts);

            //NB: a failed resend is handled like a lost packet
            if let Err(e) = self.write(&pending.data).await {
                trace!("resending packet #{} to {:?} failed: {}", pending.seq, self.peer_addr, e);
            }
        }

        if !to_discard.is_empty() {
            inner.send_queue.retain(|p| !to_discard.contains(&p.seq));
        }
    }

    /// Cancels the session's context. This does not remove the session from the server.
    pub fn close(&self) {
        debug!("closing session {} for {:?}", self.id, self.peer_addr);
        self.context.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RudpError;
    use crate::send_socket::MockSendSocket;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;

    const PEER: ([u8; 4], u16) = ([1, 2, 3, 4], 9);

    #[derive(Default)]
    struct RecordingSocket {
        sent: std::sync::Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl SendSocket for RecordingSocket {
        async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> RudpResult<()> {
            self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
            Ok(())
        }
    }

    impl RecordingSocket {
        fn packets(&self) -> Vec<Packet> {
            self.sent.lock().unwrap()
                .iter()
                .map(|(to, buf)| {
                    assert_eq!(*to, SocketAddr::from(PEER));
                    Packet::deser(buf).unwrap()
                })
                .collect()
        }
    }

    fn session_with(socket: Arc<dyn SendSocket>, config: ReliabilityConfig) -> Session {
        Session::new(SocketAddr::from(PEER), Arc::new(config), socket, None, &CancellationToken::new())
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    async fn pending_seqs(session: &Session) -> Vec<u16> {
        session.inner.lock().await
            .send_queue.iter()
            .map(|p| p.seq)
            .collect()
    }

    #[rstest]
    #[case::first(1, 2)]
    #[case::regular(17, 18)]
    #[case::before_wrap(u16::MAX - 1, u16::MAX)]
    #[case::wrap_skips_zero(u16::MAX, 1)]
    fn test_take_next_seq(#[case] next_seq: u16, #[case] expected_after: u16) {
        let mut inner = SessionInner { next_seq, last_ack_recv: 0, send_queue: VecDeque::new() };
        assert_eq!(inner.take_next_seq(), next_seq);
        assert_eq!(inner.next_seq, expected_after);
    }

    #[rstest]
    #[case::greater(5, 3, true)]
    #[case::equal(5, 5, false)]
    #[case::smaller(3, 5, false)]
    #[case::wrapped(2, u16::MAX - 2, true)]
    #[case::before_wrap(u16::MAX - 2, 2, false)]
    #[case::first(1, 0, true)]
    #[case::plain_max(40000, 100, true)]
    #[case::plain_max_smaller(100, 40000, false)]
    #[case::upper_half_not_wrapped(65000, 40000, true)]
    #[case::stale_before_wrap(u16::MAX, 10, false)]
    fn test_is_newer(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(is_newer(a, b), expected);
    }

    #[tokio::test]
    async fn test_send_unreliable() {
        let socket = Arc::new(RecordingSocket::default());
        let session = session_with(socket.clone(), ReliabilityConfig::default());

        session.send_unreliable(b"abc").await.unwrap();
        session.send(b"d").await.unwrap();

        assert_eq!(socket.packets(), vec![
            Packet::unreliable(0, Bytes::from_static(b"abc")),
            Packet::unreliable(0, Bytes::from_static(b"d")),
        ]);
        assert_eq!(session.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_reliable_assigns_sequence_numbers() {
        let socket = Arc::new(RecordingSocket::default());
        let session = session_with(socket.clone(), ReliabilityConfig::default());

        session.send_reliable(b"a").await.unwrap();
        session.send_reliable(b"b").await.unwrap();

        assert_eq!(socket.packets(), vec![
            Packet::reliable(1, 0, Bytes::from_static(b"a")),
            Packet::reliable(2, 0, Bytes::from_static(b"b")),
        ]);
        assert_eq!(pending_seqs(&session).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_ack_clears_exactly_one_pending() {
        let socket = Arc::new(RecordingSocket::default());
        let session = session_with(socket.clone(), ReliabilityConfig::default());

        for _ in 0..3 {
            session.send_reliable(b"x").await.unwrap();
        }
        assert_eq!(pending_seqs(&session).await, vec![1, 2, 3]);

        session.process_packet(&Packet::ack(2)).await.unwrap();
        assert_eq!(pending_seqs(&session).await, vec![1, 3]);

        // piggybacked on a data packet
        session.process_packet(&Packet::unreliable(3, Bytes::from_static(b"y"))).await.unwrap();
        assert_eq!(pending_seqs(&session).await, vec![1]);

        // unknown sequence numbers are ignored
        session.process_packet(&Packet::ack(77)).await.unwrap();
        assert_eq!(pending_seqs(&session).await, vec![1]);

        // no ACK packets were sent in response
        assert_eq!(socket.packets().len(), 3);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3], 3)]
    #[case::out_of_order(vec![3, 1, 2], 3)]
    #[case::duplicate(vec![2, 2], 2)]
    #[case::wrap_around(vec![u16::MAX, 1], 1)]
    #[case::first_in_upper_half(vec![40000, 100], 40000)]
    #[case::gap_in_lower_half(vec![100, 30000, 200], 30000)]
    fn test_process_reliable_acks_each_packet(#[case] seqs: Vec<u16>, #[case] expected_last_ack: u16) {
        paused_runtime().block_on(async {
            let socket = Arc::new(RecordingSocket::default());
            let session = session_with(socket.clone(), ReliabilityConfig::default());

            for &seq in &seqs {
                session.process_packet(&Packet::reliable(seq, 0, Bytes::from_static(b"p"))).await.unwrap();
            }

            let expected_acks: Vec<Packet> = seqs.iter()
                .map(|&seq| Packet::ack(seq))
                .collect();
            assert_eq!(socket.packets(), expected_acks);
            assert_eq!(session.inner.lock().await.last_ack_recv, expected_last_ack);

            // the highest sequence number is piggybacked on outgoing packets
            session.send_unreliable(b"u").await.unwrap();
            assert_eq!(socket.packets().last().unwrap().ack, expected_last_ack);
        });
    }

    #[test]
    fn test_resend_until_exhausted_then_retain() {
        paused_runtime().block_on(async {
            let socket = Arc::new(RecordingSocket::default());
            let session = session_with(socket.clone(), ReliabilityConfig::default());

            session.send_reliable(b"r").await.unwrap();

            let mut send_times = vec![Duration::ZERO];
            let start = Instant::now();
            for _ in 0..15 {
                tokio::time::advance(Duration::from_millis(100)).await;
                let before = socket.packets().len();
                session.check_resends().await;
                if socket.packets().len() > before {
                    send_times.push(start.elapsed());
                }
            }

            // initial send plus 4 resends at 300ms intervals
            assert_eq!(send_times, vec![0, 300, 600, 900, 1200].into_iter().map(Duration::from_millis).collect::<Vec<_>>());
            assert!(socket.packets().iter().all(|p| p == &Packet::reliable(1, 0, Bytes::from_static(b"r"))));

            assert_eq!(session.dropped_packets(), 1);
            assert_eq!(pending_seqs(&session).await, vec![1]);

            // reporting happens only once, and a late ACK still clears the packet
            tokio::time::advance(Duration::from_millis(1000)).await;
            session.check_resends().await;
            assert_eq!(session.dropped_packets(), 1);
            assert_eq!(socket.packets().len(), 5);

            session.process_packet(&Packet::ack(1)).await.unwrap();
            assert_eq!(session.pending_count().await, 0);
        });
    }

    #[test]
    fn test_exhausted_discard() {
        paused_runtime().block_on(async {
            let socket = Arc::new(RecordingSocket::default());
            let session = session_with(socket.clone(), ReliabilityConfig {
                resend_timeout: Duration::from_millis(300),
                max_retries: 2,
                on_retries_exhausted: RetryExhaustion::Discard,
            });

            session.send_reliable(b"r").await.unwrap();

            tokio::time::advance(Duration::from_millis(300)).await;
            session.check_resends().await;
            assert_eq!(socket.packets().len(), 2);
            assert_eq!(session.pending_count().await, 1);

            tokio::time::advance(Duration::from_millis(300)).await;
            session.check_resends().await;
            assert_eq!(socket.packets().len(), 2);
            assert_eq!(session.pending_count().await, 0);
            assert_eq!(session.dropped_packets(), 1);
        });
    }

    #[test]
    fn test_acked_packet_is_not_resent() {
        paused_runtime().block_on(async {
            let socket = Arc::new(RecordingSocket::default());
            let session = session_with(socket.clone(), ReliabilityConfig::default());

            session.send_reliable(b"a").await.unwrap();
            session.send_reliable(b"b").await.unwrap();
            session.process_packet(&Packet::ack(1)).await.unwrap();

            tokio::time::advance(Duration::from_millis(300)).await;
            session.check_resends().await;

            let packets = socket.packets();
            assert_eq!(packets.len(), 3);
            assert_eq!(packets[2].seq, 2);
        });
    }

    #[tokio::test]
    async fn test_write_error_is_returned_and_packet_stays_pending() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .withf(|to, buf| to == &SocketAddr::from(PEER) && buf == [1, 1, 0, 0, 0, b'x'].as_slice())
            .returning(|_, _| Err(RudpError::Io(std::io::Error::other("unreachable"))));

        let session = session_with(Arc::new(socket), ReliabilityConfig::default());

        assert!(matches!(session.send_reliable(b"x").await, Err(RudpError::Io(_))));
        assert_eq!(session.pending_count().await, 1);
    }

    #[test]
    fn test_failed_resend_is_retried_on_next_sweep() {
        paused_runtime().block_on(async {
            let mut num_writes = 0;
            let mut socket = MockSendSocket::new();
            socket.expect_do_send_packet()
                .times(3)
                .returning(move |_, _| {
                    num_writes += 1;
                    if num_writes == 2 {
                        Err(RudpError::Io(std::io::Error::other("unreachable")))
                    }
                    else {
                        Ok(())
                    }
                });

            let session = session_with(Arc::new(socket), ReliabilityConfig::default());
            session.send_reliable(b"x").await.unwrap();

            tokio::time::advance(Duration::from_millis(300)).await;
            session.check_resends().await;
            assert_eq!(session.pending_count().await, 1);

            tokio::time::advance(Duration::from_millis(300)).await;
            session.check_resends().await;
            assert_eq!(session.pending_count().await, 1);
            assert_eq!(session.inner.lock().await.send_queue[0].attempts, 3);
        });
    }

    #[rstest]
    #[case::low(Priority::Low, PacketKind::Unreliable)]
    #[case::normal(Priority::Normal, PacketKind::Unreliable)]
    #[case::high(Priority::High, PacketKind::Reliable)]
    #[case::critical(Priority::Critical, PacketKind::Reliable)]
    fn test_send_priority_without_queue(#[case] priority: Priority, #[case] expected_kind: PacketKind) {
        paused_runtime().block_on(async {
            let socket = Arc::new(RecordingSocket::default());
            let session = session_with(socket.clone(), ReliabilityConfig::default());

            session.send_priority(b"p", priority).await.unwrap();

            let packets = socket.packets();
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].kind, expected_kind);
        });
    }

    #[tokio::test]
    async fn test_send_priority_with_queue() {
        let socket = Arc::new(RecordingSocket::default());
        let queue = Arc::new(PriorityQueue::new());
        let session = Session::new(SocketAddr::from(PEER), Arc::new(ReliabilityConfig::default()), socket.clone(), Some(queue.clone()), &CancellationToken::new());

        session.send_priority(b"low", Priority::Low).await.unwrap();
        session.send_priority(b"critical", Priority::Critical).await.unwrap();

        assert!(socket.packets().is_empty());
        let msg = queue.dequeue().unwrap();
        assert_eq!(msg.data.as_ref(), b"critical");
        assert_eq!(msg.target, SocketAddr::from(PEER));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_cancels_context() {
        let parent = CancellationToken::new();
        let session = Session::new(SocketAddr::from(PEER), Arc::new(ReliabilityConfig::default()), Arc::new(RecordingSocket::default()), None, &parent);
        let other = Session::new(SocketAddr::from(([5, 6, 7, 8], 9)), Arc::new(ReliabilityConfig::default()), Arc::new(RecordingSocket::default()), None, &parent);

        assert_ne!(session.id(), other.id());
        assert!(!session.context().is_cancelled());

        session.close();
        assert!(session.is_closed());
        assert!(!other.is_closed());

        parent.cancel();
        assert!(other.context().is_cancelled());
    }
}
