//! TLS material loading and `rustls` server configuration.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;

use crate::config::SslConfig;
use crate::pin::{CertificatePin, PinError, PinningClientVerifier};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid PEM in {path}: {source}")]
    Pem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot pin server certificate: {0}")]
    Pin(#[from] PinError),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Which protocols a TLS listener advertises over ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    Http1,
    /// `h2`, falling back to `http/1.1`.
    Http2,
}

impl Alpn {
    fn protocols(self) -> Vec<Vec<u8>> {
        match self {
            Alpn::Http1 => vec![b"http/1.1".to_vec()],
            Alpn::Http2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        }
    }
}

/// Certificate chain and key for the TLS listeners.
#[derive(Debug)]
pub struct TlsMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Read the files named in `ssl`. The optional CA bundle is appended to
    /// the served chain.
    pub fn load(ssl: &SslConfig) -> Result<Self, TlsError> {
        let mut chain = load_certificates(&ssl.cert)?;
        if chain.is_empty() {
            return Err(TlsError::NoCertificate(ssl.cert.display().to_string()));
        }
        if let Some(ca) = &ssl.ca {
            chain.extend(load_certificates(ca)?);
        }
        let key = load_private_key(&ssl.key)?;
        Ok(Self { chain, key })
    }

    /// The server's own certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn pin(&self) -> Result<CertificatePin, TlsError> {
        Ok(CertificatePin::from_der(self.leaf())?)
    }

    /// Build a server config. With `pinned`, clients are asked for a
    /// certificate that [`CertificatePin::verify`] checks after the
    /// handshake.
    pub fn server_config(&self, alpn: Alpn, pinned: bool) -> Result<Arc<ServerConfig>, TlsError> {
        let provider = Arc::new(crypto_provider());

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = if pinned {
            builder.with_client_cert_verifier(Arc::new(PinningClientVerifier::new(provider)))
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder.with_single_cert(self.chain.clone(), self.key.clone_key())?;
        config.alpn_protocols = alpn.protocols();
        Ok(Arc::new(config))
    }
}

/// The crypto backend for every TLS listener.
pub fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn material_from_pem(cert_pem: &str, key_pem: &str) -> TlsMaterial {
        let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .unwrap()
            .unwrap();
        TlsMaterial { chain, key }
    }

    fn write_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
        (cert, key)
    }

    #[test]
    fn loads_files_and_appends_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pair(dir.path());
        let ca_dir = tempfile::tempdir().unwrap();
        let (ca, _) = write_pair(ca_dir.path());

        let material = TlsMaterial::load(&SslConfig {
            key: key.clone(),
            cert: cert.clone(),
            ca: None,
        })
        .unwrap();
        assert_eq!(material.chain.len(), 1);

        let material = TlsMaterial::load(&SslConfig {
            key,
            cert,
            ca: Some(ca),
        })
        .unwrap();
        assert_eq!(material.chain.len(), 2);
        material.pin().unwrap();
    }

    #[test]
    fn missing_files_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = write_pair(dir.path());

        let err = TlsMaterial::load(&SslConfig {
            key: dir.path().join("absent.pem"),
            cert: cert.clone(),
            ca: None,
        })
        .unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));

        let err = TlsMaterial::load(&SslConfig {
            key: cert.clone(),
            cert,
            ca: None,
        })
        .unwrap_err();
        assert!(matches!(err, TlsError::NoPrivateKey(_)));
    }

    #[test]
    fn builds_configs_with_alpn() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let material =
            material_from_pem(&generated.cert.pem(), &generated.key_pair.serialize_pem());

        let h1 = material.server_config(Alpn::Http1, false).unwrap();
        assert_eq!(h1.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let h2 = material.server_config(Alpn::Http2, true).unwrap();
        assert_eq!(h2.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
