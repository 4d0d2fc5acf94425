//! netstream - Transport stream abstraction
//!
//! This crate provides the byte-stream layer a protocol client programs
//! against, hiding whether the bytes travel over a raw TCP socket or a
//! TLS session. Higher layers pick a target and an encryption flag; the
//! stream takes care of dialing, handshaking, partial transfers and
//! teardown.

pub mod stream;

pub use stream::{new_stream, Certificate, CertificateKind, Error, Handshake, Result, Stream};
