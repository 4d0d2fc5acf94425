//! OpenSSL-backed stream
//!
//! The concrete [`Stream`] variant: a connect-only transport built from a
//! TCP socket and, for encrypted streams, an OpenSSL session. The stream
//! owns the transport exclusively and keeps a borrowed copy of its raw
//! descriptor, used only for readiness waiting, never for direct I/O.
//!
//! Peer verification is configured but deferred: the handshake runs with
//! `SslVerifyMode::NONE` so it completes even against an untrusted peer,
//! and `connect` reads the recorded verify result back afterwards. An
//! encrypted stream whose peer did not verify reports
//! [`Handshake::UntrustedPeer`] and stays connected; the caller decides
//! whether to keep talking.
//!
//! All I/O after connect is non-blocking with manual retry loops: wait for
//! readiness in whichever direction the backend asks for, attempt a
//! transfer, retry on would-block. Writes uphold the full-write contract;
//! reads return the first successful receive.

use super::wait::{wait, Direction};
use super::{Certificate, Error, Handshake, Result, Stream};
use openssl::ssl::{
    ErrorCode, HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream,
    SslVerifyMode,
};
use openssl::x509::{X509, X509VerifyResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

/// Stream over TCP with optional OpenSSL encryption
///
/// Created disconnected; `connect` dials and, when encrypted, performs the
/// TLS handshake. Not internally synchronized. Dropping the stream closes
/// the transport if `close` was not called.
pub struct OpensslStream {
    host: String,
    port: u16,
    /// TLS client context, present exactly when the stream is encrypted.
    /// Built and fully configured at construction time.
    ctx: Option<SslContext>,
    /// Live connection; `None` before connect and after close.
    transport: Option<Transport>,
    /// Raw descriptor borrowed from the transport for readiness waiting.
    /// Valid only while `transport` is `Some`; reset together with it.
    socket: RawFd,
    failed_cert: bool,
    /// Peer certificate record, populated lazily on first request.
    cert: Option<Certificate>,
}

enum Transport {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(tls) => tls.get_ref(),
        }
    }

    /// Non-blocking send.
    fn send(&mut self, buf: &[u8]) -> std::result::Result<usize, TransferError> {
        match self {
            Transport::Plain(tcp) => tcp.write(buf).map_err(|e| io_transfer_error(e, Direction::Write)),
            Transport::Tls(tls) => match tls.ssl_write(buf) {
                Ok(n) => Ok(n),
                Err(e) => Err(tls_transfer_error(e)),
            },
        }
    }

    /// True when the TLS layer holds already-decrypted bytes; the socket
    /// may show nothing readable, so the wait must be skipped.
    fn pending(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => tls.ssl().pending() > 0,
        }
    }

    /// Non-blocking receive; returns 0 at EOF (including TLS close-notify).
    fn recv(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransferError> {
        match self {
            Transport::Plain(tcp) => tcp.read(buf).map_err(|e| io_transfer_error(e, Direction::Read)),
            Transport::Tls(tls) => match tls.ssl_read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(0),
                // Peer dropped the socket without a close-notify
                Err(e) if e.code() == ErrorCode::SYSCALL && e.io_error().is_none() => Ok(0),
                Err(e) => Err(tls_transfer_error(e)),
            },
        }
    }

    /// Best-effort teardown; close at this layer never fails.
    fn shutdown(self) {
        match self {
            Transport::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
            Transport::Tls(mut tls) => {
                // Back to blocking so the close-notify can flush
                let _ = tls.get_ref().set_nonblocking(false);
                let _ = tls.shutdown();
                let _ = tls.get_ref().shutdown(Shutdown::Both);
            }
        }
    }
}

/// Outcome of a failed non-blocking transfer attempt
#[derive(Debug)]
enum TransferError {
    /// Not an error: retry once the descriptor is ready in this
    /// direction. TLS may need to read during a write (and vice versa),
    /// so the direction is the one the backend asked for, not the one
    /// the caller's operation implies.
    Retry(Direction),
    Fatal(io::Error),
}

fn io_transfer_error(e: io::Error, dir: Direction) -> TransferError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => TransferError::Retry(dir),
        _ => TransferError::Fatal(e),
    }
}

fn tls_transfer_error(e: openssl::ssl::Error) -> TransferError {
    match e.code() {
        ErrorCode::WANT_READ => TransferError::Retry(Direction::Read),
        ErrorCode::WANT_WRITE => TransferError::Retry(Direction::Write),
        _ => TransferError::Fatal(match e.into_io_error() {
            Ok(ioe) => ioe,
            Err(e) => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|e| Error::Config(format!("invalid port '{}': {}", port, e)))
}

fn build_ctx(roots_pem: Option<&[u8]>) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
    builder.set_default_verify_paths()?;

    if let Some(pem) = roots_pem {
        for root in X509::stack_from_pem(pem)? {
            builder.cert_store_mut().add_cert(root)?;
        }
    }

    // Verification runs and is recorded, but must not abort the handshake:
    // connect() reads the verify result back and reports UntrustedPeer.
    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}

/// Resolve `host:port` and connect, trying each address in turn.
fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Network(format!("failed to resolve '{}': {}", host, e)))?;

    let mut last_err = None;
    for addr in addrs {
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(socket) => socket,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        match socket.connect(&addr.into()) {
            Ok(()) => return Ok(socket.into()),
            Err(e) => last_err = Some(e),
        }
    }

    Err(Error::Network(match last_err {
        Some(e) => format!("failed to connect to '{}:{}': {}", host, port, e),
        None => format!("no addresses found for '{}'", host),
    }))
}

impl OpensslStream {
    /// Create a disconnected stream for `host:port`.
    ///
    /// `port` is parsed as a base-10 port number; a malformed value fails
    /// with [`Error::Config`] before any transport state is created. For
    /// encrypted streams the TLS context is built here, configured for
    /// deferred peer verification against the system trust store.
    pub fn new(host: &str, port: &str, encrypted: bool) -> Result<Self> {
        let port = parse_port(port)?;
        let ctx = if encrypted {
            Some(build_ctx(None)?)
        } else {
            None
        };

        Ok(OpensslStream {
            host: host.to_string(),
            port,
            ctx,
            transport: None,
            socket: -1,
            failed_cert: false,
            cert: None,
        })
    }

    /// Create an encrypted stream that additionally trusts the PEM roots
    /// in `roots_pem`, for peers signed by a private CA.
    pub fn with_root_certificates(host: &str, port: &str, roots_pem: &[u8]) -> Result<Self> {
        let port = parse_port(port)?;
        let ctx = Some(build_ctx(Some(roots_pem))?);

        Ok(OpensslStream {
            host: host.to_string(),
            port,
            ctx,
            transport: None,
            socket: -1,
            failed_cert: false,
            cert: None,
        })
    }

    fn lookup_certificate(&self) -> Result<Certificate> {
        if let Some(Transport::Tls(tls)) = &self.transport {
            if let Some(peer) = tls.ssl().peer_certificate() {
                return Ok(Certificate::from_der(peer.to_der()?));
            }
        }
        Ok(Certificate::empty())
    }
}

impl Stream for OpensslStream {
    fn encrypted(&self) -> bool {
        self.ctx.is_some()
    }

    fn connect(&mut self) -> Result<Handshake> {
        // Per-connection state; nothing from an earlier connection (or a
        // pre-connect certificate() call) may carry over.
        self.failed_cert = false;
        self.cert = None;

        let tcp = dial(&self.host, self.port)?;

        let transport = match &self.ctx {
            None => Transport::Plain(tcp),
            Some(ctx) => {
                let mut ssl = Ssl::new(ctx)?;

                // SNI plus the matching verify-time identity check
                match self.host.parse::<IpAddr>() {
                    Ok(ip) => ssl.param_mut().set_ip(ip)?,
                    Err(_) => {
                        ssl.set_hostname(&self.host)?;
                        ssl.param_mut().set_host(&self.host)?;
                    }
                }

                let tls = ssl.connect(tcp).map_err(|e| match e {
                    HandshakeError::SetupFailure(stack) => Error::Tls(stack),
                    HandshakeError::Failure(mid) => {
                        Error::Network(format!("TLS handshake failed: {}", mid.error()))
                    }
                    HandshakeError::WouldBlock(_) => {
                        Error::Network("TLS handshake interrupted".to_string())
                    }
                })?;

                if tls.ssl().verify_result() != X509VerifyResult::OK {
                    self.failed_cert = true;
                }

                Transport::Tls(tls)
            }
        };

        // The descriptor is needed for I/O and close even when the peer
        // did not verify.
        transport.tcp().set_nonblocking(true)?;
        self.socket = transport.tcp().as_raw_fd();
        self.transport = Some(transport);

        if self.encrypted() && self.failed_cert {
            return Ok(Handshake::UntrustedPeer);
        }

        Ok(Handshake::Verified)
    }

    fn certificate(&mut self) -> Result<&Certificate> {
        if self.cert.is_none() {
            let record = self.lookup_certificate()?;
            self.cert = Some(record);
        }

        Ok(self.cert.get_or_insert_with(Certificate::empty))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket;
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        let mut dir = Direction::Read;
        loop {
            if !transport.pending() {
                wait(socket, dir)?;
            }

            match transport.recv(buf) {
                Ok(n) => return Ok(n),
                Err(TransferError::Retry(d)) => dir = d,
                Err(TransferError::Fatal(e)) => return Err(Error::Network(e.to_string())),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let socket = self.socket;
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        let mut off = 0;
        let mut dir = Direction::Write;
        while off < buf.len() {
            wait(socket, dir)?;

            match transport.send(&buf[off..]) {
                Ok(n) => {
                    off += n;
                    dir = Direction::Write;
                }
                Err(TransferError::Retry(d)) => dir = d,
                Err(TransferError::Fatal(e)) => return Err(Error::Network(e.to_string())),
            }
        }

        // Full-write contract: success means every byte was accepted
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        let transport = match self.transport.take() {
            None => return Ok(()),
            Some(transport) => transport,
        };

        self.socket = -1;
        transport.shutdown();

        Ok(())
    }
}

impl Drop for OpensslStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn plain_stream(addr: std::net::SocketAddr) -> OpensslStream {
        OpensslStream::new(&addr.ip().to_string(), &addr.port().to_string(), false).unwrap()
    }

    #[test]
    fn test_plain_connect_write_read_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").unwrap();
        });

        let mut stream = plain_stream(addr);
        assert!(!stream.encrypted());

        assert_eq!(stream.connect().unwrap(), Handshake::Verified);

        assert_eq!(stream.write(b"hello").unwrap(), 5);

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");

        stream.close().unwrap();
        // Idempotent
        stream.close().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn test_read_short_then_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"abc").unwrap();
        });

        let mut stream = plain_stream(addr);
        assert_eq!(stream.connect().unwrap(), Handshake::Verified);

        // Short read: fewer bytes than the buffer holds
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");

        server.join().unwrap();

        // Peer closed: EOF is 0, not an error
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_write_full_contract_over_slow_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        const LEN: usize = 1 << 20;

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut total = 0;
            let mut buf = [0u8; 4096];
            while total < LEN {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0);
                total += n;
            }
            assert_eq!(total, LEN);
        });

        let mut stream = plain_stream(addr);
        assert_eq!(stream.connect().unwrap(), Handshake::Verified);

        // Larger than any socket buffer, so the send loop has to retry
        // through would-block; success must mean every byte went out.
        let data = vec![0x5au8; LEN];
        assert_eq!(stream.write(&data).unwrap(), LEN);

        server.join().unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn test_io_rejected_when_not_connected() {
        let mut stream = OpensslStream::new("127.0.0.1", "80", false).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(stream.read(&mut buf), Err(Error::NotConnected)));
        assert!(matches!(stream.write(b"x"), Err(Error::NotConnected)));

        // And again after a connect/close cycle
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut stream = plain_stream(addr);
        assert_eq!(stream.connect().unwrap(), Handshake::Verified);
        stream.close().unwrap();

        assert!(matches!(stream.read(&mut buf), Err(Error::NotConnected)));
        assert!(matches!(stream.write(b"x"), Err(Error::NotConnected)));

        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused_is_network_error() {
        // Grab a port that nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut stream = plain_stream(addr);
        let result = stream.connect();
        assert!(matches!(result, Err(Error::Network(_))));

        // A failed connect leaves the stream safely closable
        stream.close().unwrap();
    }

    #[test]
    fn test_certificate_empty_on_plain_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut stream = plain_stream(addr);
        assert_eq!(stream.connect().unwrap(), Handshake::Verified);

        let cert = stream.certificate().unwrap();
        assert!(cert.is_empty());

        server.join().unwrap();
    }

    #[test]
    fn test_certificate_before_connect_is_empty() {
        let mut stream = OpensslStream::new("example.org", "443", true).unwrap();
        let cert = stream.certificate().unwrap();
        assert!(cert.is_empty());
    }

    #[test]
    fn test_transfer_error_mapping() {
        let e = io::Error::new(io::ErrorKind::WouldBlock, "try again");
        assert!(matches!(
            io_transfer_error(e, Direction::Write),
            TransferError::Retry(Direction::Write)
        ));

        let e = io::Error::new(io::ErrorKind::Interrupted, "interrupted");
        assert!(matches!(
            io_transfer_error(e, Direction::Read),
            TransferError::Retry(Direction::Read)
        ));

        let e = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            io_transfer_error(e, Direction::Read),
            TransferError::Fatal(_)
        ));
    }

    #[test]
    fn test_zero_length_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut stream = plain_stream(addr);
        assert_eq!(stream.connect().unwrap(), Handshake::Verified);
        assert_eq!(stream.write(b"").unwrap(), 0);

        server.join().unwrap();
    }
}
