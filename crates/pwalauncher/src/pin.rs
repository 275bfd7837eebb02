//! Client certificate pinning.
//!
//! A pinned listener only serves clients that present the server's own
//! certificate. The TLS layer asks for a client certificate without
//! validating it against any CA; after the handshake the peer's serial is
//! compared against the server leaf serial.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("client presented no certificate")]
    NoCertificate,

    #[error("client certificate could not be parsed: {0}")]
    Unparsable(String),

    #[error("certificate serial is empty")]
    EmptySerial,

    #[error("client certificate serial {presented} does not match")]
    SerialMismatch { presented: String },
}

impl PinError {
    pub fn reason(&self) -> &'static str {
        match self {
            PinError::NoCertificate => "no_certificate",
            PinError::Unparsable(_) => "unparsable",
            PinError::EmptySerial => "empty_serial",
            PinError::SerialMismatch { .. } => "serial_mismatch",
        }
    }
}

/// The serial of the server leaf certificate, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePin {
    serial: Vec<u8>,
}

impl CertificatePin {
    pub fn from_der(cert: &CertificateDer<'_>) -> Result<Self, PinError> {
        Ok(Self {
            serial: serial_of(cert)?,
        })
    }

    /// Pin the first certificate of a PEM bundle.
    pub fn from_pem(pem: &[u8]) -> Result<Self, PinError> {
        let leaf = rustls_pemfile::certs(&mut &pem[..])
            .next()
            .ok_or(PinError::NoCertificate)?
            .map_err(|e| PinError::Unparsable(e.to_string()))?;
        Self::from_der(&leaf)
    }

    pub fn serial_hex(&self) -> String {
        hex::encode(&self.serial)
    }

    /// Check the peer chain of one connection. Only the end-entity
    /// certificate is compared.
    pub fn verify(&self, peer: Option<&[CertificateDer<'_>]>) -> Result<(), PinError> {
        let leaf = peer
            .and_then(|chain| chain.first())
            .ok_or(PinError::NoCertificate)?;

        let presented = serial_of(leaf)?;
        if presented == self.serial {
            Ok(())
        } else {
            Err(PinError::SerialMismatch {
                presented: hex::encode(presented),
            })
        }
    }
}

fn serial_of(der: &CertificateDer<'_>) -> Result<Vec<u8>, PinError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| PinError::Unparsable(e.to_string()))?;
    let serial = cert.tbs_certificate.raw_serial();
    if serial.is_empty() {
        return Err(PinError::EmptySerial);
    }
    Ok(serial.to_vec())
}

/// Requests a client certificate, proves the client holds its key, and
/// leaves the trust decision to [`CertificatePin::verify`].
#[derive(Debug)]
pub struct PinningClientVerifier {
    provider: Arc<CryptoProvider>,
}

impl PinningClientVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for PinningClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    // Anonymous clients finish the handshake and get 404s afterwards.
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
