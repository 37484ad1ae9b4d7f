pub mod client;
pub mod pool;

pub use client::{Capabilities, Connector, Reply, SmtpConnection};
pub use pool::{ConnectionPool, PoolKey};

use crate::classify::{TrailDir, TrailLine};
use tokio_rustls::rustls::{
    self, ClientConfig, RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use std::sync::Arc;

/// Bounded capture of every line sent and received on one SMTP session,
/// attached to the error or success outcome.
#[derive(Debug, Clone, Default)]
pub struct LogTrail {
    lines: Vec<TrailLine>,
}

impl LogTrail {
    const MAX_LINES: usize = 150;

    fn push(&mut self, dir: TrailDir, line: &str) {
        if self.lines.len() >= Self::MAX_LINES {
            return;
        }
        self.lines.push(TrailLine {
            dir,
            line: line.trim_end_matches(['\r', '\n']).to_string(),
        });
    }

    pub fn sent(&mut self, line: &str) {
        self.push(TrailDir::Sent, line);
    }

    pub fn received(&mut self, line: &str) {
        self.push(TrailDir::Received, line);
    }

    pub fn note(&mut self, line: &str) {
        self.push(TrailDir::Received, line);
    }

    pub fn lines(&self) -> &[TrailLine] {
        &self.lines
    }

    pub fn snapshot(&self) -> Vec<TrailLine> {
        self.lines.clone()
    }

    pub fn render(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|entry| {
                let prefix = match entry.dir {
                    TrailDir::Sent => "C:",
                    TrailDir::Received => "S:",
                };
                format!("{prefix} {}", entry.line)
            })
            .collect()
    }
}

/// TLS posture of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRequirement {
    /// STARTTLS when advertised, plaintext fallback on handshake failure.
    Opportunistic,
    /// MTA-STS enforce or `mxSecure`: no plaintext fallback, verified
    /// certificates, TLS 1.2 minimum.
    Required,
    /// Host is on the worker's `tls_disabled` list.
    Disabled,
}

/// Client TLS configuration. `strict` verifies against the webpki roots;
/// opportunistic TLS accepts whatever certificate the exchange presents,
/// matching what the rest of the ecosystem does for port 25.
pub(crate) fn tls_client_config(strict: bool) -> Arc<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .expect("tls protocol versions");

    let config = if strict {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth()
    };
    Arc::new(config)
}

/// Certificate verifier for opportunistic STARTTLS: signatures are still
/// checked, identity is not.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
