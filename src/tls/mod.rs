//! TLS capabilities.
//!
//! The client does not ship a TLS stack. It consumes a [`TlsConnector`]
//! capability that performs the handshake and hands back an encrypted
//! stream plus a [`Handshake`] record. Chain cleaning and hostname
//! verification (the parts with protocol-level rules of their own) live in
//! [`verify`].

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::connect::{ConnectionSpec, Protocol};

pub mod verify;

pub use self::verify::{CertificateChainCleaner, StrictHostnameVerifier};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An encrypted stream produced by a [`TlsConnector`].
pub trait TlsStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// The handshake that produced this stream.
    fn handshake(&self) -> Handshake;
}

/// Performs TLS handshakes on freshly-dialed TCP streams.
///
/// `host` is the SNI / verification name (the origin host even when
/// tunneling through a proxy), `alpn` the protocol preference list, and
/// `spec` the parameter bundle to offer.
pub trait TlsConnector: Send + Sync {
    fn connect(
        &self,
        stream: TcpStream,
        host: &str,
        alpn: &[Protocol],
        spec: &ConnectionSpec,
    ) -> BoxFuture<io::Result<Box<dyn TlsStream>>>;
}

/// Decides whether the peer's verified certificate is acceptable for a
/// hostname. Consulted once per handshake and again for HTTP/2 coalescing.
pub trait HostnameVerifier: Send + Sync {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

/// Pins hosts to known certificates. The default pins nothing.
pub trait CertificatePinner: Send + Sync {
    fn check(&self, host: &str, chain: &[PeerCertificate]) -> crate::Result<()>;
}

/// A pinner with no pins; every chain passes.
#[derive(Debug, Default)]
pub struct NoPins;

impl CertificatePinner for NoPins {
    fn check(&self, _host: &str, _chain: &[PeerCertificate]) -> crate::Result<()> {
        Ok(())
    }
}

/// Looks up issuers when cleaning a peer-supplied chain.
pub trait TrustStore: Send + Sync {
    /// Returns a trusted certificate whose subject and key signed `cert`,
    /// if the store has one.
    fn find_issuer(&self, cert: &PeerCertificate) -> Option<PeerCertificate>;
}

/// The peer's certificate as the TLS capability presented it: raw DER plus
/// the handful of parsed fields the verification rules need. The client
/// never parses X.509 itself.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    der: Bytes,
    subject: String,
    issuer: String,
    dns_sans: Vec<String>,
}

impl PeerCertificate {
    pub fn new(
        der: impl Into<Bytes>,
        subject: impl Into<String>,
        issuer: impl Into<String>,
        dns_sans: Vec<String>,
    ) -> PeerCertificate {
        PeerCertificate {
            der: der.into(),
            subject: subject.into(),
            issuer: issuer.into(),
            dns_sans,
        }
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// `subjectAlternativeName` entries of type DNS.
    pub fn dns_sans(&self) -> &[String] {
        &self.dns_sans
    }

    /// A certificate is self-issued when it names itself as issuer.
    pub(crate) fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

impl fmt::Debug for PeerCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCertificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("dns_sans", &self.dns_sans)
            .finish()
    }
}

/// A record of a completed TLS handshake: what was negotiated and what the
/// peer presented. Attached to every response served over TLS.
#[derive(Clone, Debug)]
pub struct Handshake {
    protocol: Option<Protocol>,
    cipher_suite: String,
    peer_certificates: Vec<PeerCertificate>,
}

impl Handshake {
    pub fn new(
        protocol: Option<Protocol>,
        cipher_suite: impl Into<String>,
        peer_certificates: Vec<PeerCertificate>,
    ) -> Handshake {
        Handshake {
            protocol,
            cipher_suite: cipher_suite.into(),
            peer_certificates,
        }
    }

    /// The ALPN-selected protocol, if any was negotiated.
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    /// The peer's chain, leaf first, as cleaned during the handshake.
    pub fn peer_certificates(&self) -> &[PeerCertificate] {
        &self.peer_certificates
    }

    pub(crate) fn leaf(&self) -> Option<&PeerCertificate> {
        self.peer_certificates.first()
    }
}

/// The TLS half of an [`Address`](crate::connect::Address): the connector
/// plus the verification capabilities that must match for connection reuse.
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) connector: Arc<dyn TlsConnector>,
    pub(crate) hostname_verifier: Arc<dyn HostnameVerifier>,
    pub(crate) certificate_pinner: Arc<dyn CertificatePinner>,
    pub(crate) connection_specs: Vec<ConnectionSpec>,
}

impl TlsConfig {
    pub fn new(connector: Arc<dyn TlsConnector>) -> TlsConfig {
        TlsConfig {
            connector,
            hostname_verifier: Arc::new(StrictHostnameVerifier),
            certificate_pinner: Arc::new(NoPins),
            connection_specs: vec![ConnectionSpec::modern_tls(), ConnectionSpec::compatible_tls()],
        }
    }

    pub fn hostname_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> TlsConfig {
        self.hostname_verifier = verifier;
        self
    }

    pub fn certificate_pinner(mut self, pinner: Arc<dyn CertificatePinner>) -> TlsConfig {
        self.certificate_pinner = pinner;
        self
    }

    pub fn connection_specs(mut self, specs: Vec<ConnectionSpec>) -> TlsConfig {
        self.connection_specs = specs;
        self
    }

    /// Capability-identity equality: connection reuse must not assume two
    /// distinct verifier or pinner instances behave alike.
    pub(crate) fn equivalent(&self, other: &TlsConfig) -> bool {
        Arc::ptr_eq(&self.connector, &other.connector)
            && Arc::ptr_eq(&self.hostname_verifier, &other.hostname_verifier)
            && Arc::ptr_eq(&self.certificate_pinner, &other.certificate_pinner)
            && self.connection_specs == other.connection_specs
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("connection_specs", &self.connection_specs)
            .finish()
    }
}
