use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::buffers::fixed_buffer::FixedBuf;
use crate::encryption::PacketEncryption;

/// A pool of reusable packet-sized send buffers. Buffers handed out by the pool already carry a
///  fresh encryption envelope prefix, so callers can serialize the packet header directly.
pub struct SendBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
    encryption: Arc<dyn PacketEncryption>,
}

impl SendBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize, encryption: Arc<dyn PacketEncryption>) -> SendBufferPool {
        SendBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            encryption,
        }
    }

    pub fn envelope_overhead(&self) -> usize {
        self.encryption.envelope_overhead()
    }

    pub fn get_from_pool(&self) -> FixedBuf {
        let mut result = self._get_from_pool();
        self.encryption.init_buffer(&mut result);
        result
    }

    fn _get_from_pool(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes, maybe a packet exceeding the configured packet size was sent",
                   self.buf_size);

        buffer.clear();

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
