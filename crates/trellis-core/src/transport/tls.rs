//! TLS material for the TCP-based transports and QUIC.
//!
//! Certificate verification is off by default: listeners come up on an
//! ephemeral self-signed certificate and dialers accept any chain, because
//! the E2E stream layer is the authoritative security boundary. Strict mode
//! (CA verification, optionally mutual) is opt-in per listener/peer.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::{TlsClientSettings, TlsServerSettings};
use crate::error::AgentError;

/// ALPN for the QUIC transport; H2 uses the standard `h2`.
pub const ALPN_TRELLIS: &[u8] = b"trellis";
pub const ALPN_H2: &[u8] = b"h2";

fn provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::ring::default_provider()
}

/// Generate an ephemeral self-signed certificate and key.
pub fn ephemeral_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), AgentError> {
    let cert = rcgen::generate_simple_self_signed(vec!["trellis".into()])
        .map_err(|e| AgentError::Tls(format!("certificate generation failed: {}", e)))?;
    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    Ok((cert_der, key_der.into()))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, AgentError> {
    let pem = std::fs::read(path)
        .map_err(|e| AgentError::Tls(format!("reading {}: {}", path, e)))?;
    let certs: Result<Vec<_>, io::Error> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.map_err(|e| AgentError::Tls(format!("parsing {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(AgentError::Tls(format!("{} contains no certificates", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, AgentError> {
    let pem = std::fs::read(path)
        .map_err(|e| AgentError::Tls(format!("reading {}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| AgentError::Tls(format!("parsing {}: {}", path, e)))?
        .ok_or_else(|| AgentError::Tls(format!("{} contains no private key", path)))
}

fn load_roots(path: &str) -> Result<RootCertStore, AgentError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| AgentError::Tls(format!("bad root in {}: {}", path, e)))?;
    }
    Ok(roots)
}

/// Build the rustls server config for one listener.
pub fn server_config(
    settings: &TlsServerSettings,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig, AgentError> {
    let (certs, key) = match (&settings.cert_file, &settings.key_file) {
        (Some(cert), Some(key)) => (load_certs(cert)?, load_key(key)?),
        _ => {
            let (cert, key) = ephemeral_cert()?;
            (vec![cert], key)
        }
    };

    let builder = rustls::ServerConfig::builder_with_provider(Arc::new(provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    let builder = if settings.verify_client {
        let ca = settings.ca_file.as_deref().expect("validated: verify_client has ca_file");
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?))
            .build()
            .map_err(|e| AgentError::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| AgentError::Tls(e.to_string()))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Build the rustls client config for one peer link.
pub fn client_config(
    settings: &TlsClientSettings,
    alpn: &[&[u8]],
) -> Result<rustls::ClientConfig, AgentError> {
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    let mut config = if settings.verify {
        let ca = settings.ca_file.as_deref().expect("validated: verify has ca_file");
        builder
            .with_root_certificates(load_roots(ca)?)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Server name used for SNI (and verification in strict mode).
pub fn server_name(
    settings: &TlsClientSettings,
    dialed_host: &str,
) -> Result<ServerName<'static>, AgentError> {
    let name = settings.server_name.as_deref().unwrap_or(dialed_host);
    ServerName::try_from(name.to_string())
        .map_err(|_| AgentError::Tls(format!("{} is not a valid server name", name)))
}

/// Accepts every certificate chain. Transport TLS then only provides
/// confidentiality against passive observers; peer authentication happens in
/// the PEER_HELLO pinning check and the E2E layer.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        provider().signature_verification_algorithms.supported_schemes()
    }
}

/// The byte stream under an H2 or WebSocket link: plain TCP or either
/// direction of TLS. A closed set, so a tagged variant rather than a boxed
/// trait object.
pub enum TcpOrTls {
    Plain(TcpStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for TcpOrTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TcpOrTls::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TcpOrTls::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpOrTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TcpOrTls::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TcpOrTls::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_flush(cx),
            TcpOrTls::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TcpOrTls::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpOrTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TcpOrTls::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TcpOrTls::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
