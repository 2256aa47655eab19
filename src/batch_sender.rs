use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::BatchConfig;
use crate::error::RudpResult;

/// The primitive 'send one datagram' operation that a [`BatchSender`] coalesces writes into
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn send_datagram(&self, datagram: &[u8]) -> RudpResult<()>;
}

struct BatchInner {
    sink: Arc<dyn DatagramSink>,
    batch: Vec<Vec<u8>>,
    batch_bytes: usize,
    last_flush: Instant,
}

impl BatchInner {
    /// Sends everything that is batched as a single datagram. The batch is reset whether the
    ///  send succeeds or not.
    async fn flush(&mut self) -> RudpResult<()> {
        self.last_flush = Instant::now();
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut combined = Vec::with_capacity(self.batch_bytes);
        for buf in self.batch.drain(..) {
            combined.extend_from_slice(&buf);
        }
        self.batch_bytes = 0;

        trace!("flushing batch of {} bytes", combined.len());
        self.sink.send_datagram(&combined).await
    }
}

/// Coalesces many small outbound buffers into fewer datagrams. A batch is flushed when adding to
///  it would exceed the configured size limits, when `flush_interval` passed since the previous
///  flush, or explicitly.
pub struct BatchSender {
    config: Arc<BatchConfig>,
    inner: Arc<Mutex<BatchInner>>,
    shutdown: CancellationToken,
    flush_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchSender {
    /// NB: This spawns the periodic flush task, so it must be called from inside a tokio runtime
    pub fn new(sink: Arc<dyn DatagramSink>, config: BatchConfig) -> anyhow::Result<BatchSender> {
        config.validate()?;
        let config = Arc::new(config);

        let inner = Arc::new(Mutex::new(BatchInner {
            sink,
            batch: Vec::with_capacity(config.max_batch_size),
            batch_bytes: 0,
            last_flush: Instant::now(),
        }));
        let shutdown = CancellationToken::new();

        let flush_loop = tokio::spawn(Self::do_flush_loop(config.clone(), inner.clone(), shutdown.clone()));

        Ok(BatchSender {
            config,
            inner,
            shutdown,
            flush_loop: std::sync::Mutex::new(Some(flush_loop)),
        })
    }

    /// Adds a copy of `data` to the current batch, flushing the batch first if adding `data`
    ///  would exceed the configured limits. A flush error is returned, and `data` is batched
    ///  regardless.
    pub async fn send_batched(&self, data: &[u8]) -> RudpResult<()> {
        let mut inner = self.inner.lock().await;

        let would_overflow = inner.batch.len() + 1 > self.config.max_batch_size
            || inner.batch_bytes + data.len() > self.config.max_batch_bytes;

        let flush_result = if would_overflow && !inner.batch.is_empty() {
            debug!("batch is full - flushing {} buffers", inner.batch.len());
            inner.flush().await
        }
        else {
            Ok(())
        };

        inner.batch.push(data.to_vec());
        inner.batch_bytes += data.len();
        flush_result
    }

    pub async fn flush(&self) -> RudpResult<()> {
        self.inner.lock().await
            .flush().await
    }

    pub async fn batched_len(&self) -> usize {
        self.inner.lock().await.batch.len()
    }

    /// Stops the periodic flush task and flushes whatever is left. Calling this more than once
    ///  is harmless.
    pub async fn close(&self) -> RudpResult<()> {
        self.shutdown.cancel();

        let handle = self.flush_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("batch flush loop terminated abnormally: {}", e);
            }
        }

        self.flush().await
    }

    async fn do_flush_loop(config: Arc<BatchConfig>, inner: Arc<Mutex<BatchInner>>, shutdown: CancellationToken) {
        let mut flush_interval = interval(config.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    debug!("shutting down batch flush loop");
                    break;
                }
                _ = flush_interval.tick() => {
                    let mut inner = inner.lock().await;
                    if !inner.batch.is_empty() && inner.last_flush.elapsed() >= config.flush_interval {
                        if let Err(e) = inner.flush().await {
                            error!("error sending batch: {}", e);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for BatchSender {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
