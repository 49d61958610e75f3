//! TLS listener support: PEM certificate/key loading for the optional
//! HTTPS front.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use thiserror::Error;
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig},
    TlsAcceptor,
};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to read {path}: {source}")]
    Read {
        source: std::io::Error,
        path: String,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid certificate or key: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

pub fn acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            source,
            path: path.to_string(),
        })
}

fn load_certs(path: &str) -> Result<Vec<Certificate>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?).map_err(|source| TlsError::Read {
        source,
        path: path.to_string(),
    })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey, TlsError> {
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut open(path)?).map_err(|source| TlsError::Read {
            source,
            path: path.to_string(),
        })?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open(path)?).map_err(|source| {
            TlsError::Read {
                source,
                path: path.to_string(),
            }
        })?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}
