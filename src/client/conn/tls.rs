//! TLS client configuration and handshakes.
//!
//! Two client configurations exist per client: one which validates the
//! downstream certificate chain, and a relaxed one which accepts any
//! certificate. Each is built the first time a call needs it.

use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::Error;

/// Lazily built TLS client configurations.
#[derive(Default)]
pub(crate) struct TlsConfigs {
    roots: Option<Arc<RootCertStore>>,
    strict: OnceLock<Arc<rustls::ClientConfig>>,
    relaxed: OnceLock<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for TlsConfigs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfigs")
            .field("custom_roots", &self.roots.is_some())
            .field("strict", &self.strict.get().is_some())
            .field("relaxed", &self.relaxed.get().is_some())
            .finish()
    }
}

impl TlsConfigs {
    pub(crate) fn new(roots: Option<Arc<RootCertStore>>) -> Self {
        Self {
            roots,
            ..Default::default()
        }
    }

    /// The client configuration for the given validation mode.
    pub(crate) fn get(&self, relaxed: bool) -> Result<Arc<rustls::ClientConfig>, Error> {
        let cell = if relaxed { &self.relaxed } else { &self.strict };
        if let Some(config) = cell.get() {
            return Ok(config.clone());
        }

        let config = Arc::new(if relaxed {
            relaxed_config()?
        } else {
            strict_config(self.roots.as_deref())?
        });
        tracing::debug!(relaxed, "built downstream tls client config");

        Ok(cell.get_or_init(|| config).clone())
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn strict_config(roots: Option<&RootCertStore>) -> Result<rustls::ClientConfig, Error> {
    let roots = match roots {
        Some(roots) => roots.clone(),
        None => native_roots(),
    };

    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|error| Error::setup("invalid tls protocol versions", error))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn relaxed_config() -> Result<rustls::ClientConfig, Error> {
    let provider = provider();
    let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|error| Error::setup("invalid tls protocol versions", error))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        tracing::warn!("error loading platform certificates: {error}");
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");
    roots
}

/// Perform a client handshake over `stream`.
pub(crate) async fn handshake(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> io::Result<TlsStream<TcpStream>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let name = ServerName::try_from(host.to_owned())
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    TlsConnector::from(config).connect(name, stream).await
}

/// Accepts any server certificate, while still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
