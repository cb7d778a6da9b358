use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use openssl::ssl::SslStream;
use parking_lot::Mutex;

use crate::transport::errors::TransportError;

/// Longest single wait for the socket to drain before a write is retried.
const WRITE_WAIT: Duration = Duration::from_millis(50);

/// Outcome of waiting for inbound bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Idle,
    Closed,
}

/// Duplex byte transport shared between the receive loop and any number of senders.
///
/// Implementations must allow `write_all` to run while another thread is parked
/// in `wait_readable` or `read`.
pub trait Transport: Send + Sync {
    /// Blocks for at most `timeout` until bytes can be read.
    fn wait_readable(&self, timeout: Duration) -> Result<Readiness, TransportError>;

    /// Reads what is available. `Ok(None)` means nothing arrived in time, `Ok(Some(0))` is end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError>;

    fn shutdown(&self);
}

/// TLS over a non-blocking TCP socket.
///
/// The session lock is only held for single `SSL_read`/`SSL_write` calls,
/// which return at once with nothing to do. All waiting happens in `poll`
/// on a cloned handle with no lock held.
pub struct TlsTransport {
    socket: TcpStream,
    stream: Mutex<SslStream<TcpStream>>,
    /// Held across a whole `write_all`; a retried `SSL_write` must resend the same bytes.
    writer: Mutex<()>,
}

impl TlsTransport {
    /// Takes over a completed handshake and switches the socket to non-blocking.
    pub fn new(stream: SslStream<TcpStream>) -> io::Result<Self> {
        stream.get_ref().set_nonblocking(true)?;
        let socket = stream.get_ref().try_clone()?;
        Ok(Self {
            socket,
            stream: Mutex::new(stream),
            writer: Mutex::new(()),
        })
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[derive(Clone, Copy, Debug)]
enum Interest {
    Read,
    Write,
}

/// Waits up to `timeout` for the socket to become ready. Hang-ups and errors
/// count as ready so the next read or write reports them.
#[cfg(unix)]
fn wait_for(socket: &TcpStream, interest: Interest, timeout: Duration) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };
    let mut pollfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis())
        .unwrap_or(libc::c_int::MAX)
        .max(1);
    // SAFETY: `pollfd` is a valid, exclusively borrowed array of one entry.
    let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if ready < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(error);
    }
    Ok(ready > 0)
}

#[cfg(not(unix))]
fn wait_for(_socket: &TcpStream, _interest: Interest, timeout: Duration) -> io::Result<bool> {
    std::thread::sleep(timeout.min(Duration::from_millis(5)));
    Ok(true)
}

impl Transport for TlsTransport {
    fn wait_readable(&self, timeout: Duration) -> Result<Readiness, TransportError> {
        // Decrypted bytes may already sit in the TLS buffer with nothing left on the socket.
        if self.stream.lock().ssl().pending() > 0 {
            return Ok(Readiness::Readable);
        }
        if wait_for(&self.socket, Interest::Read, timeout)? {
            Ok(Readiness::Readable)
        } else {
            Ok(Readiness::Idle)
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut stream = self.stream.lock();
        match stream.read(buf) {
            Ok(read) => Ok(Some(read)),
            Err(error) if is_timeout(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let _writer = self.writer.lock();
        let mut sent = 0;
        while sent < bytes.len() {
            let result = self.stream.lock().write(&bytes[sent..]);
            match result {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(count) => sent += count,
                Err(error) if is_timeout(&error) => {
                    wait_for(&self.socket, Interest::Write, WRITE_WAIT)?;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(error) = self.socket.shutdown(Shutdown::Both) {
            log::debug!("socket shutdown failed: {error}");
        }
    }
}
