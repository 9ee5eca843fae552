//! Byte-stream transport abstraction a [`crate::port::Port`] writes encoded
//! records to (§1 "talks to a byte-stream transport").

use std::io;

/// A byte-stream sink/source a port multiplexes its records over.
///
/// Implementations stand in for what the original line discipline reaches
/// through `tty->ops->write` and the `TTY_DO_WRITE_WAKEUP` flag: a real
/// serial port, a socket, or (in tests) an in-memory loopback buffer.
pub trait Transport: Send + Sync {
    /// Writes as many leading bytes of `buf` as the transport currently
    /// accepts, returning the number written. Callers retry the remainder
    /// on a later write-wakeup, mirroring a tty driver's partial-write
    /// contract.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Requests a callback once more write capacity is available. A
    /// transport that is always immediately writable may leave this a
    /// no-op.
    fn request_write_wakeup(&self) {}
}

/// An in-memory [`Transport`] that always accepts the full write, used by
/// tests and the loopback demos in `demos/`.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    written: std::sync::Mutex<Vec<u8>>,
}

impl LoopbackTransport {
    /// Creates an empty loopback transport.
    pub fn new() -> Self {
        LoopbackTransport::default()
    }

    /// Returns and clears everything written so far, in order.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.written.lock().unwrap())
    }
}

impl Transport for LoopbackTransport {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_accumulates_full_writes() {
        let t = LoopbackTransport::new();
        assert_eq!(t.write(b"abc").unwrap(), 3);
        assert_eq!(t.write(b"def").unwrap(), 3);
        assert_eq!(t.take_written(), b"abcdef".to_vec());
        assert_eq!(t.take_written(), Vec::<u8>::new());
    }
}
