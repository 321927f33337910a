//! An in-memory back end: a zeroed byte buffer of fixed size, used as the
//! spec's literal `mem` export in the handshake and framing test scenarios.
//! Read/write complete synchronously, but still post through the session's
//! completion channel rather than replying directly, so its dispatch path
//! is identical to an asynchronous back end's.

use async_trait::async_trait;
use nbd_backend::{
    BackendFactory, CompletionSink, EINVAL, ExportDescriptor, Handler,
};
use parking_lot::Mutex;
use tracing::debug;

/// Builds a fresh, independent memory buffer of `size_bytes` for every
/// session that selects the `mem` back end. The size is a server-side
/// configuration value, not something the client's handshake controls.
pub struct MemBackendFactory {
    size_bytes: u64,
}

impl MemBackendFactory {
    #[must_use]
    pub fn new(size_bytes: u64) -> Self {
        Self { size_bytes }
    }
}

#[async_trait]
impl BackendFactory for MemBackendFactory {
    async fn construct(&self, _descriptor: &ExportDescriptor) -> Result<Box<dyn Handler>, String> {
        Ok(Box::new(MemHandler::new(self.size_bytes)))
    }
}

/// A memory-backed [`Handler`].
pub struct MemHandler {
    data: Mutex<Vec<u8>>,
    size: u64,
}

impl MemHandler {
    #[must_use]
    pub fn new(size_bytes: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size_bytes as usize]),
            size: size_bytes,
        }
    }

    /// Seed the buffer's contents, for tests that need a known initial
    /// image (spec.md's READ-reply-framing scenario).
    pub fn seed(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
    }

    fn range_ok(&self, offset: u64, length: u64) -> bool {
        offset
            .checked_add(length)
            .is_some_and(|end| end <= self.size)
    }
}

impl Handler for MemHandler {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, sink: CompletionSink, cookie: u64, offset: u64, length: u32) {
        if !self.range_ok(offset, u64::from(length)) {
            sink.err(cookie, EINVAL);
            return;
        }
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + length as usize;
        sink.ok_read(cookie, data[start..end].to_vec());
    }

    fn write(&self, sink: CompletionSink, cookie: u64, offset: u64, payload: Vec<u8>) {
        if !self.range_ok(offset, payload.len() as u64) {
            sink.err(cookie, EINVAL);
            return;
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        data[start..start + payload.len()].copy_from_slice(&payload);
        sink.ok(cookie);
    }

    fn flush(&self, sink: CompletionSink, cookie: u64) {
        sink.ok(cookie);
    }

    fn close(&self) {
        debug!("mem backend closed");
    }
}
