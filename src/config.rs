use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// What happens to a pending reliable packet after it was sent `max_retries` times without
///  being acknowledged. In both cases the event is logged and counted, and the original sender
///  does not get an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum RetryExhaustion {
    /// Keep the packet in the pending queue without resending it, re-reporting it once per
    ///  resend timeout. A late ACK still clears it.
    #[default]
    Retain,
    /// Remove the packet from the pending queue.
    Discard,
}

#[derive(Clone, Debug)]
pub struct ReliabilityConfig {
    /// A pending reliable packet is resent if it was not acknowledged for this long
    pub resend_timeout: Duration,
    /// Total number of transmissions (including the first one) before a reliable packet is
    ///  reported as dropped
    pub max_retries: u32,
    pub on_retries_exhausted: RetryExhaustion,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            resend_timeout: Duration::from_millis(300),
            max_retries: 5,
            on_retries_exhausted: RetryExhaustion::default(),
        }
    }
}

impl ReliabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resend_timeout.is_zero() {
            bail!("resend timeout must be positive");
        }
        if self.max_retries == 0 {
            bail!("max retries must be at least 1 to allow the initial transmission");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// Size of the (single, reused) receive buffer. Datagrams longer than this are truncated by
    ///  the OS, so this should be at least the biggest datagram any peer sends.
    pub read_buffer_size: usize,

    /// Interval of the resend sweep over all sessions. This should be significantly smaller
    ///  than the resend timeout since it determines the timeout's granularity.
    pub resend_interval: Duration,

    /// Upper bound for concurrently running handler invocations. If all are busy, the read
    ///  loop stops reading from the socket until one finishes, pushing back onto the OS receive
    ///  buffer. `0` means no bound.
    pub max_concurrent_handlers: usize,

    pub reliability: ReliabilityConfig,
}

impl ServerConfig {
    pub const MAX_DATAGRAM_SIZE: usize = 65535;

    pub fn new(listen_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            listen_addr,
            read_buffer_size: Self::MAX_DATAGRAM_SIZE,
            resend_interval: Duration::from_millis(100),
            max_concurrent_handlers: 1024,
            reliability: ReliabilityConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_buffer_size < crate::packet::Packet::HEADER_LEN {
            bail!("read buffer size {} cannot hold a packet header", self.read_buffer_size);
        }
        if self.resend_interval.is_zero() {
            bail!("resend interval must be positive");
        }
        self.reliability.validate()
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub target_addr: SocketAddr,
    /// applied by `Client::receive`, not by `Client::receive_into`
    pub read_timeout: Option<Duration>,
    /// applied by `Client::send`, not by `Client::send_raw`
    pub write_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(target_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            target_addr,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// maximum number of buffers in a batch
    pub max_batch_size: usize,
    /// maximum number of bytes in a batch, i.e. in the combined datagram
    pub max_batch_bytes: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_batch_size: 32,
            max_batch_bytes: 1400,
            flush_interval: Duration::from_millis(5),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_batch_size == 0 {
            bail!("max batch size must be at least 1");
        }
        if self.max_batch_bytes == 0 {
            bail!("max batch bytes must be positive");
        }
        if self.flush_interval.is_zero() {
            bail!("flush interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        assert!(config.validate().is_ok());
        assert_eq!(config.resend_interval, Duration::from_millis(100));
        assert_eq!(config.reliability.resend_timeout, Duration::from_millis(300));
        assert_eq!(config.reliability.max_retries, 5);
        assert_eq!(config.reliability.on_retries_exhausted, RetryExhaustion::Retain);
    }

    #[rstest]
    #[case::tiny_read_buffer(4, 100, 5, false)]
    #[case::no_resend_interval(1500, 0, 5, false)]
    #[case::no_retries(1500, 100, 0, false)]
    #[case::ok(1500, 100, 1, true)]
    fn test_server_validate(#[case] read_buffer_size: usize, #[case] resend_interval_millis: u64, #[case] max_retries: u32, #[case] expected_ok: bool) {
        let mut config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.read_buffer_size = read_buffer_size;
        config.resend_interval = Duration::from_millis(resend_interval_millis);
        config.reliability.max_retries = max_retries;

        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    #[case::default(BatchConfig::default(), true)]
    #[case::no_size(BatchConfig { max_batch_size: 0, ..BatchConfig::default() }, false)]
    #[case::no_bytes(BatchConfig { max_batch_bytes: 0, ..BatchConfig::default() }, false)]
    #[case::no_interval(BatchConfig { flush_interval: Duration::ZERO, ..BatchConfig::default() }, false)]
    fn test_batch_validate(#[case] config: BatchConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
