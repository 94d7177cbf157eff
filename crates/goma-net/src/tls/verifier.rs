//! Certificate verification, generalized from OpenSSL's verify-callback
//! model: delegate chain/hostname verification to rustls's own WebPKI
//! verifier, then additionally require that no certificate in the chain
//! appears on a loaded CRL (spec §4.D handshake step (b)).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use tracing::warn;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::{parse_x509_crl, FromDer, X509Certificate};

use crate::tls::crl::CrlCache;

#[derive(Debug)]
pub struct CrlCheckingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    crl: Arc<CrlCache>,
}

impl CrlCheckingVerifier {
    pub fn new(roots: RootCertStore, crl: Arc<CrlCache>) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| TlsError::General(err.to_string()))?;
        Ok(CrlCheckingVerifier { inner, crl })
    }

    /// Extracts CRL distribution-point URLs from an end-entity certificate.
    /// Best-effort: certificates without the extension (or a malformed
    /// one) are treated as having no distribution points to check.
    fn crl_distribution_points(der: &[u8]) -> Vec<String> {
        let Ok((_, cert)) = X509Certificate::from_der(der) else { return Vec::new() };
        let mut urls = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
                for point in points.points.iter() {
                    if let Some(name) = &point.distribution_point {
                        if let x509_parser::extensions::DistributionPointName::FullName(names) = name {
                            for general_name in names {
                                if let x509_parser::extensions::GeneralName::URI(uri) = general_name {
                                    urls.push(uri.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
        urls
    }

    fn check_crls(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        let Ok((_, cert)) = X509Certificate::from_der(end_entity.as_ref()) else {
            return Err(TlsError::General("end-entity certificate is not valid DER".into()));
        };
        let serial = cert.raw_serial();

        for url in Self::crl_distribution_points(end_entity.as_ref()) {
            if self.crl.is_poisoned(&url) {
                return Err(TlsError::General(format!("CRL endpoint {url} is poisoned")));
            }
            let entry = match self.crl.get(&url) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(url, error = %err, "certificate chain fails closed: no valid CRL");
                    return Err(TlsError::General(format!("no valid CRL for {url}: {err}")));
                }
            };
            let (_, crl) = parse_x509_crl(&entry.der)
                .map_err(|err| TlsError::General(format!("malformed CRL from {url}: {err}")))?;
            if crl.iter_revoked_certificates().any(|revoked| revoked.raw_serial() == serial) {
                return Err(TlsError::General(format!("certificate serial is revoked per CRL {url}")));
            }
        }
        Ok(())
    }
}

impl ServerCertVerifier for CrlCheckingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let verified = self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        self.check_crls(end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
