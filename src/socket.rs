//! Client socket layer: abort-checked, timeout-bounded TCP I/O.
//!
//! The state machine talks to a `ClientSocket` trait object so tests can
//! substitute scripted sockets; `TcpClientSocket` is the real thing. Reads
//! and writes are sliced into abort-check intervals so a stuck peer cannot
//! hold a thread past one interval once an abort lands.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ErrorCode;
use crate::options::WdtOptions;
use crate::transfer_request::{EncryptionParams, EncryptionType};

/// Polled between socket operations, retry sleeps and data chunks.
pub trait AbortChecker: Send + Sync {
    fn should_abort(&self) -> bool;
}

/// One sender-side connection. See the collaborator contract in the design
/// notes: reads return the byte count actually obtained (callers compare
/// against what they asked for), `Ok(0)` is EOF, `ErrorKind::TimedOut` is a
/// timeout with nothing read and `ErrorKind::Interrupted` is an abort.
pub trait ClientSocket: Send {
    fn connect(&mut self) -> ErrorCode;

    fn port(&self) -> i32;

    /// Read up to `buf.len()` bytes within the default read timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Like `read` with an explicit overall timeout.
    fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write the whole buffer within the write timeout; returns bytes
    /// actually written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Bytes sitting unacknowledged in the kernel send buffer, -1 when the
    /// platform cannot tell.
    fn unacked_bytes(&mut self) -> i64;

    fn shutdown_writes(&mut self) -> ErrorCode;

    /// After shutting down writes, expect the peer to close cleanly.
    fn expect_end_of_stream(&mut self) -> ErrorCode;

    fn encryption_type(&self) -> EncryptionType;

    /// Current authentication tag of the encryption layer; empty without
    /// encryption.
    fn compute_cur_encryption_tag(&mut self) -> Vec<u8>;

    /// Sticky error that makes reconnecting pointless (e.g. a corrupt
    /// encryption stream).
    fn non_retryable_err_code(&self) -> ErrorCode;

    fn close(&mut self);
}

/// Seam for substituting socket implementations (tests, encrypted sockets).
pub trait SocketCreator: Send + Sync {
    fn make_socket(
        &self,
        dest_host: &str,
        port: i32,
        options: &WdtOptions,
        encryption: &EncryptionParams,
        abort_checker: Arc<dyn AbortChecker>,
    ) -> Box<dyn ClientSocket>;
}

pub struct TcpSocketCreator;

impl SocketCreator for TcpSocketCreator {
    fn make_socket(
        &self,
        dest_host: &str,
        port: i32,
        options: &WdtOptions,
        encryption: &EncryptionParams,
        abort_checker: Arc<dyn AbortChecker>,
    ) -> Box<dyn ClientSocket> {
        if encryption.is_set() {
            tracing::warn!(
                port,
                "plain TCP socket cannot encrypt, ignoring encryption parameters"
            );
        }
        Box::new(TcpClientSocket::new(dest_host, port, options, abort_checker))
    }
}

pub struct TcpClientSocket {
    dest_host: String,
    port: i32,
    stream: Option<TcpStream>,
    read_timeout: Duration,
    write_timeout: Duration,
    abort_check_interval: Duration,
    connect_timeout: Duration,
    socket_buffer_size: i32,
    abort_checker: Arc<dyn AbortChecker>,
}

impl TcpClientSocket {
    pub fn new(
        dest_host: &str,
        port: i32,
        options: &WdtOptions,
        abort_checker: Arc<dyn AbortChecker>,
    ) -> TcpClientSocket {
        TcpClientSocket {
            dest_host: dest_host.to_string(),
            port,
            stream: None,
            read_timeout: Duration::from_millis(options.read_timeout_millis),
            write_timeout: Duration::from_millis(options.write_timeout_millis),
            abort_check_interval: Duration::from_millis(options.abort_check_interval_millis.max(1)),
            connect_timeout: Duration::from_millis(options.connect_timeout_millis),
            socket_buffer_size: options.socket_buffer_size,
            abort_checker,
        }
    }

    fn read_internal(&mut self, buf: &mut [u8], total_timeout: Duration) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        };
        let deadline = Instant::now() + total_timeout;
        let mut total = 0usize;
        loop {
            if self.abort_checker.should_abort() {
                if total > 0 {
                    return Ok(total);
                }
                return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer aborted"));
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = self.abort_check_interval.min(deadline - now);
            stream.set_read_timeout(Some(slice))?;
            match stream.read(&mut buf[total..]) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        return Ok(total);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if total > 0 {
            Ok(total)
        } else {
            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
        }
    }
}

impl ClientSocket for TcpClientSocket {
    fn connect(&mut self) -> ErrorCode {
        self.close();
        let addrs: Vec<SocketAddr> =
            match (self.dest_host.as_str(), self.port as u16).to_socket_addrs() {
                Ok(iter) => iter.collect(),
                Err(e) => {
                    tracing::error!(host = %self.dest_host, port = self.port, error = %e,
                        "address resolution failed");
                    return ErrorCode::ConnError;
                }
            };
        if addrs.is_empty() {
            return ErrorCode::ConnError;
        }
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    tune_socket(&stream, self.socket_buffer_size);
                    self.stream = Some(stream);
                    return ErrorCode::Ok;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                }
            }
        }
        // Resolvable but unreachable: worth retrying.
        ErrorCode::Error
    }

    fn port(&self) -> i32 {
        self.port
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.read_timeout;
        self.read_internal(buf, timeout)
    }

    fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.read_internal(buf, timeout)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        };
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0usize;
        while written < buf.len() {
            if self.abort_checker.should_abort() {
                return Ok(written);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(written);
            }
            let slice = self.abort_check_interval.min(deadline - now);
            stream.set_write_timeout(Some(slice))?;
            match stream.write(&buf[written..]) {
                Ok(0) => return Ok(written),
                Ok(n) => {
                    written += n;
                    // Progress resets the clock: keep writing as long as the
                    // peer drains something within each timeout window.
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn unacked_bytes(&mut self) -> i64 {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            if let Some(stream) = self.stream.as_ref() {
                let fd = stream.as_raw_fd();
                let mut outq: libc::c_int = 0;
                let ret = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut outq) };
                if ret == 0 {
                    return i64::from(outq);
                }
            }
            -1
        }
        #[cfg(not(target_os = "linux"))]
        {
            -1
        }
    }

    fn shutdown_writes(&mut self) -> ErrorCode {
        match self.stream.as_ref() {
            Some(stream) => match stream.shutdown(Shutdown::Write) {
                Ok(()) => ErrorCode::Ok,
                Err(e) => {
                    tracing::warn!(port = self.port, error = %e, "shutdown failed");
                    ErrorCode::Error
                }
            },
            None => ErrorCode::Error,
        }
    }

    fn expect_end_of_stream(&mut self) -> ErrorCode {
        let mut byte = [0u8; 1];
        let timeout = self.read_timeout;
        match self.read_internal(&mut byte, timeout) {
            Ok(0) => ErrorCode::Ok,
            Ok(_) => {
                tracing::warn!(port = self.port, "unexpected data instead of EOF");
                ErrorCode::SocketReadError
            }
            Err(_) => ErrorCode::SocketReadError,
        }
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::None
    }

    fn compute_cur_encryption_tag(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn non_retryable_err_code(&self) -> ErrorCode {
        ErrorCode::Ok
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

// Socket tuning: disable Nagle, optionally enlarge kernel buffers.
#[allow(unused_variables)]
fn tune_socket(stream: &TcpStream, buffer_bytes: i32) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        if buffer_bytes > 0 {
            let fd = stream.as_raw_fd();
            let sz: libc::c_int = buffer_bytes as libc::c_int;
            let p = &sz as *const _ as *const libc::c_void;
            unsafe {
                let _ = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    p,
                    std::mem::size_of_val(&sz) as libc::socklen_t,
                );
                let _ = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    p,
                    std::mem::size_of_val(&sz) as libc::socklen_t,
                );
            }
        }
    }
}
