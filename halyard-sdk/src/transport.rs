//! TCP/TLS transport.
//!
//! Sessions talk to a boxed `AsyncRead + AsyncWrite` stream obtained from a
//! [`Connector`], so tests can hand the engine an in-memory duplex pipe
//! instead of a socket.

use std::io::BufReader as StdBufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Byte stream a session runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Where and how to connect. Secure-transport policies rewrite this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_insecure: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Endpoint {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.effective_port(),
            tls: config.tls,
            tls_insecure: config.tls_insecure,
            client_cert: config.client_cert.clone(),
            client_key: config.client_key.clone(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub struct Connection {
    pub stream: BoxedStream,
    /// True when the transport is encrypted.
    pub secure: bool,
}

/// Opens transports for the supervisor.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<Connection>>;
}

/// Real network connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(establish_connection(endpoint))
    }
}

/// Establish TCP (and optionally TLS) connection to the server.
pub async fn establish_connection(endpoint: &Endpoint) -> Result<Connection> {
    let addr = endpoint.addr();
    let mode = if endpoint.tls { "TLS" } else { "plain" };

    tracing::debug!(%addr, "Resolving");
    let tcp = TcpStream::connect(&addr).await?;
    tcp.set_nodelay(true)?;
    tracing::debug!(%addr, mode, "TCP connected");

    if !endpoint.tls {
        return Ok(Connection {
            stream: Box::new(tcp),
            secure: false,
        });
    }

    let tls_config = tls_config(endpoint)?;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let dns_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| Error::ServerName(format!("{}: {e}", endpoint.host)))?;
    let tls_stream = connector.connect(dns_name, tcp).await?;
    tracing::debug!(%addr, "TLS handshake complete");
    Ok(Connection {
        stream: Box::new(tls_stream),
        secure: true,
    })
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("halyard-sdk needs the `ring` or `aws-lc-rs` feature");

/// Client config for `endpoint`: webpki roots, or no chain check when
/// `tls_insecure` is set, plus the CertFP identity if configured.
fn tls_config(endpoint: &Endpoint) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(crypto_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let builder = if endpoint.tls_insecure {
        tracing::warn!(host = %endpoint.host, "TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyServerCert { algorithms }))
    } else {
        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    };

    match (&endpoint.client_cert, &endpoint.client_key) {
        (Some(cert), Some(key)) => {
            let (chain, key) = load_client_identity(cert, key)?;
            tracing::debug!(host = %endpoint.host, "Presenting client certificate");
            Ok(builder.with_client_auth_cert(chain, key)?)
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Read a PEM certificate chain and private key for CertFP.
pub fn load_client_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = StdBufReader::new(std::fs::File::open(cert_path)?);
    let chain = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;
    if chain.is_empty() {
        return Err(Error::Config(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let mut key_reader = StdBufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Config(format!("no private key in {}", key_path.display())))?;
    Ok((chain, key))
}

/// Verifier for `tls_insecure` endpoints.
///
/// Any certificate chain and name is accepted, but the handshake signature
/// must still come from the key in the presented certificate.
#[derive(Debug)]
struct AnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
