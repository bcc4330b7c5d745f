//! mTLS transport to the target agents.
//!
//! The gateway presents a client certificate and validates the agent either
//! against a configured CA root or against a pinned certificate. Plain HTTP
//! is only built when no TLS material is configured at all (dev/test mode).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rustls::client::danger::{ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

/// Upper bound on a single proxied exchange with an agent.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Paths to the gateway's client certificate and key.
pub struct ClientIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_file_iter(path)
        .with_context(|| format!("Failed reading certificates from {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed parsing certificates from {}", path.display()))
}

fn load_identity(
    identity: &ClientIdentity,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = load_certs(&identity.cert_path)?;
    let key = PrivateKeyDer::from_pem_file(&identity.key_path).with_context(|| {
        format!(
            "Failed parsing the client private key from {}",
            identity.key_path.display()
        )
    })?;
    Ok((certs, key))
}

fn into_client(tls_config: rustls::ClientConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .timeout(UPSTREAM_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("Failed building the upstream HTTP client")
}

/// Client that validates the agent certificate against the given CA root and
/// presents the gateway's identity for mutual TLS.
pub fn mtls_client(agent_ca: &Path, identity: &ClientIdentity) -> anyhow::Result<reqwest::Client> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(agent_ca)? {
        roots
            .add(cert)
            .context("Failed adding an agent CA certificate to the root store")?;
    }
    let (certs, key) = load_identity(identity)?;

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("Failed building the rustls ClientConfig")?;
    into_client(tls_config)
}

/// Client that accepts exactly one agent certificate, pinned byte for byte,
/// and presents the gateway's identity for mutual TLS.
pub fn pinned_client(
    pinned_cert: &Path,
    identity: &ClientIdentity,
) -> anyhow::Result<reqwest::Client> {
    let pinned = load_certs(pinned_cert)?
        .into_iter()
        .next()
        .context("The pinned certificate file contains no certificate")?;
    let verifier = PinnedAgentVerifier::new_with_default_provider(pinned);
    let (certs, key) = load_identity(identity)?;

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .context("Failed building the rustls ClientConfig")?;
    into_client(tls_config)
}

/// Plain HTTP client for deployments without agent TLS material.
pub fn plain_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("Failed building the upstream HTTP client")
}

/// Accepts only the pinned agent certificate.
#[derive(Debug)]
pub struct PinnedAgentVerifier {
    agent_cert: CertificateDer<'static>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl PinnedAgentVerifier {
    pub fn new_with_default_provider(agent_cert: CertificateDer<'static>) -> PinnedAgentVerifier {
        PinnedAgentVerifier {
            agent_cert,
            supported_algs: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedAgentVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if &self.agent_cert != end_entity {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::Other(rustls::OtherError(Arc::from(Box::from(
                    "certificate presented by the agent differs from the pinned one",
                )))),
            ));
        }
        // A pinned end-entity certificate has no chain
        if !intermediates.is_empty() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}
