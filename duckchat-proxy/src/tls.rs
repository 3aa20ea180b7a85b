//! HTTPS support: a listener that hands axum connections only after the
//! TLS handshake has finished.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::serve::Listener;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::server::TlsStream;

use crate::error::ProxyError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a TLS acceptor from PEM cert and key files.
pub fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| ProxyError::Config(format!("Open TLS cert {}: {}", cert_path.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Parse TLS cert: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Config(format!(
            "No certificate found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| ProxyError::Config(format!("Parse TLS key {}: {}", key_path.display(), e)))?;

    let tls_config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("TLS config: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("TLS config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Accepts TCP connections and finishes each handshake in its own task, so
/// one slow client cannot hold up the others.
pub struct TlsListener {
    local_addr: SocketAddr,
    handshaken: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, handshaken) = mpsc::channel(64);
        tokio::spawn(accept_loop(listener, acceptor, tx));
        Ok(Self {
            local_addr,
            handshaken,
        })
    }
}

async fn accept_loop(
    mut listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = tx.closed() => break,
            accepted = Listener::accept(&mut listener) => accepted,
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, peer)).await;
                }
                Ok(Err(e)) => tracing::warn!("TLS handshake failed from {}: {}", peer, e),
                Err(_) => tracing::warn!("TLS handshake from {} timed out", peer),
            }
        });
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.handshaken.recv().await {
            Some(connection) => connection,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_cert_file_is_a_config_error() {
        let key = pem_file("");
        let err = build_tls_acceptor(Path::new("/nonexistent/cert.pem"), key.path()).err().expect("expected an error");
        assert!(matches!(err, ProxyError::Config(ref msg) if msg.contains("Open TLS cert")));
    }

    #[test]
    fn cert_file_without_certificates_is_rejected() {
        let cert = pem_file("not a pem file\n");
        let key = pem_file("");
        let err = build_tls_acceptor(cert.path(), key.path()).err().expect("expected an error");
        assert!(matches!(err, ProxyError::Config(ref msg) if msg.contains("No certificate")));
    }

    #[test]
    fn key_file_without_a_key_is_rejected() {
        let cert = pem_file(CERT_PEM);
        let key = pem_file(CERT_PEM);
        let err = build_tls_acceptor(cert.path(), key.path()).err().expect("expected an error");
        assert!(matches!(err, ProxyError::Config(ref msg) if msg.contains("Parse TLS key")));
    }

    #[tokio::test]
    async fn listener_reports_the_bound_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(
                tokio_rustls::rustls::server::ResolvesServerCertUsingSni::new(),
            ));
        let tls = TlsListener::new(listener, TlsAcceptor::from(Arc::new(config))).unwrap();
        assert_eq!(Listener::local_addr(&tls).unwrap(), addr);
    }
}
