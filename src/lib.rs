//! A small reliability layer on top of raw UDP, offering three delivery modes over a single
//!  datagram socket:
//!
//! * *unreliable*: fire-and-forget, no bookkeeping, no retry. This is the fast path for
//!    high-frequency traffic that tolerates loss
//! * *reliable*: every packet gets a sequence number and is retransmitted until the peer
//!    acknowledges it
//! * *priority*: messages go through an outbound priority queue and are drained strictly by
//!    priority (critical before high before normal before low), the upper two levels reliably
//!
//! ## Design goals
//!
//! * Server / client asymmetry: a [`server::Server`] listens on one UDP socket and tracks one
//!    [`session::Session`] per peer address, a [`client::Client`] is a connected socket
//! * No handshake - sessions are created lazily on the first packet from an unknown address
//! * Per-packet acknowledgement: every reliable packet is acked eagerly by a dedicated ACK
//!    packet, and every outgoing packet piggybacks the highest sequence number seen from the peer
//! * Retransmission is time based: a periodic sweep resends everything that was not acknowledged
//!    within a timeout, up to a maximum number of attempts
//! * Explicitly *not* covered: congestion control, ordering / de-duplication on the receiver
//!    side, encryption, authentication, idle session eviction
//!
//! ## Wire format
//!
//! All numbers little endian:
//!
//! ```ascii
//! 0: packet kind (u8): 0 = UNRELIABLE, 1 = RELIABLE, 2 = ACK, 3 = HELLO
//! 1: sequence number (u16) - assigned by the sender for RELIABLE packets, 0 otherwise
//! 3: ack (u16) - for data packets, the highest RELIABLE sequence number received from the
//!     peer (piggybacked); for ACK packets, the sequence number being acknowledged.
//!     0 means 'nothing acknowledged'
//! 5: payload (0..n bytes)
//! ```
//!
//! There is no length field and no MTU check: a packet is exactly one datagram, and it is the
//!  sender's responsibility to keep datagrams below the path MTU.
//!
//! ## Sequence numbers
//!
//! Sequence numbers are u16 and wrap around, skipping 0 because 0 is reserved for 'no ack'.
//!  The receiver tracks the highest sequence number seen. This is a plain numeric maximum,
//!  except that a number near 1 following one near `u16::MAX` counts as higher, so wrap-around
//!  does not freeze the piggybacked ack.
//!
//! NB: Acknowledgement is *not* cumulative. An ACK clears exactly the pending packet with the
//!      same sequence number, and a piggybacked ack clears exactly one as well.
//!
//! ## Retransmission
//!
//! A pending reliable packet that was not acknowledged within `resend_timeout` is resent as-is.
//!  After `max_retries` transmissions it is reported as dropped. What happens then is a
//!  configurable [`config::RetryExhaustion`] policy: by default the packet stays in the pending
//!  queue (without further resends) so that a late ack still clears it.
//!
//! ## Batching
//!
//! The [`batch_sender::BatchSender`] coalesces many small buffers into a single datagram. This
//!  concatenates raw bytes without framing, so it is meant for payloads that are self-delimiting
//!  or for peers that know the record size.

pub mod batch_sender;
pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod priority_queue;
pub mod send_socket;
pub mod server;
pub mod session;
