//! TLS configuration.
use std::{io, path::PathBuf, sync::Arc};

use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{
    self, ClientConfig, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};

/// Requested SSL behavior, `sslmode` in the connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never negotiate TLS.
    Disable,
    /// Try plaintext first; retry the whole connection with TLS if the
    /// server turns the plaintext attempt away.
    Allow,
    /// Try TLS first; continue in plaintext if the server declines.
    #[default]
    Prefer,
    /// TLS or nothing.
    Require,
}

impl SslMode {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "disable" => Self::Disable,
            "allow" => Self::Allow,
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            _ => return None,
        })
    }
}

/// TLS material and mode for one connection attempt.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub mode: SslMode,
    /// Client certificate, PEM.
    pub cert_file: Option<PathBuf>,
    /// Client private key, PEM.
    pub key_file: Option<PathBuf>,
    /// Trusted roots, PEM. Without it the server certificate is accepted
    /// unverified, which matches the behavior of `sslmode=require`.
    pub root_file: Option<PathBuf>,
}

impl TlsSettings {
    pub(crate) fn connector(&self) -> io::Result<TlsConnector> {
        let builder = match &self.root_file {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                for cert in CertificateDer::pem_file_iter(path).map_err(pem_error)? {
                    roots
                        .add(cert.map_err(pem_error)?)
                        .map_err(tls_error)?;
                }
                ClientConfig::builder().with_root_certificates(roots)
            }
            None => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new())),
        };

        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let certs = CertificateDer::pem_file_iter(cert)
                    .map_err(pem_error)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(pem_error)?;
                let key = PrivateKeyDer::from_pem_file(key).map_err(pem_error)?;
                builder.with_client_auth_cert(certs, key).map_err(tls_error)?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }
}

fn pem_error(err: rustls::pki_types::pem::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::other(err)
}

/// Verifier used when no root certificate was configured.
///
/// Signatures are still checked; only the chain of trust is skipped.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
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
        dss: &rustls::DigitallySignedStruct,
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
        dss: &rustls::DigitallySignedStruct,
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
