use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::Read;

use crate::error::{ClientError, Result};

const MAX_POOLED: usize = 4;

/// Copy buffers reused across saves of one context.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            free: Mutex::new(Vec::new()),
        }
    }

    fn rent(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; self.buffer_size])
    }

    fn give_back(&self, buffer: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }

    /// Drain `reader` into one contiguous body.
    pub fn read_to_bytes(&self, reader: &mut dyn Read) -> Result<Bytes> {
        let mut buffer = self.rent();
        let mut out = BytesMut::new();
        let result = loop {
            match reader.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => out.extend_from_slice(&buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    break Err(ClientError::invalid_operation(format!(
                        "failed to read the save stream: {}",
                        e
                    )))
                }
            }
        };
        self.give_back(buffer);
        result.map(|_| out.freeze())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}
