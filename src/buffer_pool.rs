use std::sync::{Mutex, OnceLock};
use tracing::{debug, trace};

use crate::config::ServerConfig;

/// A pool of fixed-size receive buffers. Buffers are handed out at their full length so they
///  can be passed to `recv` directly; their content is stale data from previous use.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> Vec<u8> {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        vec![0; self.buf_size]
    }

    pub fn return_to_pool(&self, buffer: Vec<u8>) {
        assert_eq!(buffer.len(), self.buf_size,
                   "returned buffer does not have the regular length of {} bytes, it was probably not taken from this pool"
                   , self.buf_size);

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// The process wide pool of receive buffers, each big enough for the biggest possible datagram
pub fn receive_buffer_pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(ServerConfig::MAX_DATAGRAM_SIZE, 64))
}
