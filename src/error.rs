use thiserror::Error;

use crate::packet::Packet;

#[derive(Debug, Error)]
pub enum RudpError {
    #[error("packet too small: {len} bytes, the header alone has {} bytes", Packet::HEADER_LEN)]
    PacketTooSmall { len: usize },

    #[error("unknown packet kind {0}")]
    UnknownPacketKind(u8),

    #[error("closed")]
    Closed,

    #[error("cancelled")]
    Cancelled,

    #[error("timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RudpResult<T> = Result<T, RudpError>;
