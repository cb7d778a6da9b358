//! Scripted in-memory transport for exercising the connection engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::transport::errors::TransportError;
use crate::transport::tls::{Readiness, Transport};

#[derive(Default)]
struct Inbound {
    bytes: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
pub struct MemoryTransport {
    inbound: Mutex<Inbound>,
    arrived: Condvar,
    written: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    shut_down: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut inbound = self.inbound.lock();
        inbound.bytes.extend(bytes.iter().copied());
        self.arrived.notify_all();
    }

    pub fn close_inbound(&self) {
        self.inbound.lock().closed = true;
        self.arrived.notify_all();
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn wait_readable(&self, timeout: Duration) -> Result<Readiness, TransportError> {
        let mut inbound = self.inbound.lock();
        if inbound.bytes.is_empty() && !inbound.closed {
            self.arrived.wait_for(&mut inbound, timeout);
        }
        Ok(if !inbound.bytes.is_empty() {
            Readiness::Readable
        } else if inbound.closed {
            Readiness::Closed
        } else {
            Readiness::Idle
        })
    }

    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut inbound = self.inbound.lock();
        if inbound.bytes.is_empty() {
            return Ok(if inbound.closed { Some(0) } else { None });
        }
        let count = buf.len().min(inbound.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.bytes.drain(..count)) {
            *slot = byte;
        }
        Ok(Some(count))
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("write failed".to_string()));
        }
        self.written.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.close_inbound();
    }
}
