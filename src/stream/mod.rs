//! Stream operations abstraction
//!
//! This module defines the capability set every transport variant must
//! satisfy: connect, fetch the peer certificate, read, write, close, plus
//! a fixed "is this connection encrypted" flag. Callers program only
//! against the [`Stream`] trait; the concrete backend is selected by the
//! [`new_stream`] factory.
//!
//! # Architecture
//!
//! - The `Stream` trait defines the operations (connect, certificate,
//!   read, write, close) and the encryption flag.
//! - [`OpensslStream`] is the concrete variant: a connect-only transport
//!   (TCP plus an optional OpenSSL session) driven with manual readiness
//!   waits and non-blocking retry loops.
//! - Releasing a stream is ordinary ownership: dropping it closes the
//!   transport first, so "free" cannot be called twice by construction.
//!
//! Certificate verification failures on encrypted streams are deliberately
//! non-fatal at this layer: `connect` reports them as the distinct
//! [`Handshake::UntrustedPeer`] outcome instead of an error, so the caller
//! can make the trust decision (continue for a pinning workflow, or abort).

#[cfg(feature = "openssl")]
mod wait;

#[cfg(feature = "openssl")]
mod openssl_stream;

#[cfg(feature = "openssl")]
pub use openssl_stream::OpensslStream;

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stream operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed; carries the backend's own diagnostic text.
    #[error("network error: {0}")]
    Network(String),

    /// The OS-level readiness wait could not be set up.
    #[error("I/O error: {0}")]
    Os(#[from] std::io::Error),

    /// Malformed connection parameter, e.g. a port that is not a number.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The TLS backend was not compiled in.
    #[error("TLS support is not available in this build")]
    Unsupported,

    /// Read or write on a stream that is not connected (never connected,
    /// or already closed).
    #[error("stream is not connected")]
    NotConnected,

    /// TLS library failure while building or driving a session.
    #[cfg(feature = "openssl")]
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
}

/// Outcome of a successful transport handshake.
///
/// `connect` is tri-state: a hard failure is an `Err`, while a completed
/// handshake is either `Verified` or, for encrypted streams whose peer
/// certificate did not verify, `UntrustedPeer`. The stream is connected
/// and usable in both `Ok` cases; whether `UntrustedPeer` is acceptable
/// is the caller's decision.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Connection established; for encrypted streams, the peer verified.
    Verified,
    /// Connection established, but peer certificate verification failed.
    /// Only possible on encrypted streams.
    UntrustedPeer,
}

/// Kind tag of a [`Certificate`] record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    /// X.509 certificate material
    X509,
}

/// Opaque peer certificate record
///
/// Carries whatever certificate material the transport exposed: the DER
/// encoding of the peer certificate when one was presented, or an empty
/// payload when the transport has none (plain streams, or before a
/// handshake reached the TLS layer). The bytes are not parsed here;
/// callers that pin certificates compare the blob themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    kind: CertificateKind,
    data: Vec<u8>,
}

impl Certificate {
    pub(crate) fn empty() -> Self {
        Certificate {
            kind: CertificateKind::X509,
            data: Vec::new(),
        }
    }

    #[cfg(feature = "openssl")]
    pub(crate) fn from_der(data: Vec<u8>) -> Self {
        Certificate {
            kind: CertificateKind::X509,
            data,
        }
    }

    /// Kind of the certificate material
    pub fn kind(&self) -> CertificateKind {
        self.kind
    }

    /// Raw certificate bytes (DER); empty if the transport exposed none
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True if no certificate material is available
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Transport stream capability set
///
/// Every transport variant implements these operations. The expected call
/// sequence is: `connect`, optionally `certificate` to decide whether an
/// untrusted peer is acceptable, any number of `write`/`read` calls, then
/// `close`. Dropping the stream closes it if the caller did not.
///
/// Streams are not internally synchronized; a single instance must not be
/// used from multiple threads without external locking.
pub trait Stream {
    /// Whether this stream encrypts the connection. Fixed at construction.
    fn encrypted(&self) -> bool;

    /// Perform the transport-level handshake.
    ///
    /// Certificate-verification failure on an encrypted stream is not a
    /// connect failure: it is reported as [`Handshake::UntrustedPeer`]
    /// and the stream stays connected.
    fn connect(&mut self) -> Result<Handshake>;

    /// Borrow the peer certificate record.
    ///
    /// Succeeds after any connect attempt that reached the TLS layer,
    /// even if verification failed. The record may carry an empty payload
    /// when the transport exposes no certificate.
    fn certificate(&mut self) -> Result<&Certificate>;

    /// Read up to `buf.len()` bytes.
    ///
    /// Blocks until at least one byte is available, the peer closes
    /// (returns 0), or an error occurs. Short reads are normal.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf`.
    ///
    /// On success every byte was accepted by the transport; partial sends
    /// are retried internally. Never reports a partial count as success.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Release the transport-level connection. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Create a stream for `host:port`, encrypted when requested.
///
/// `port` is parsed as a base-10 port number; a malformed value fails with
/// [`Error::Config`] before any transport handle is created.
#[cfg(feature = "openssl")]
pub fn new_stream(host: &str, port: &str, encrypted: bool) -> Result<Box<dyn Stream>> {
    Ok(Box::new(OpensslStream::new(host, port, encrypted)?))
}

/// Stub factory for builds without the TLS backend: always fails.
#[cfg(not(feature = "openssl"))]
pub fn new_stream(_host: &str, _port: &str, _encrypted: bool) -> Result<Box<dyn Stream>> {
    Err(Error::Unsupported)
}
