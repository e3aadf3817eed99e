// src/connection/stream.rs

//! The transport under a connection: plain TCP or TLS over TCP.

use crate::config::ClientConfig;
use crate::core::ClientError;
use std::fs::File;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsConnector, rustls};
use tracing::debug;

/// An enum to wrap the supported stream types into a single type.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientStream {
    /// Dials the configured address and, if enabled, performs the TLS handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.addr();
        let dial = TcpStream::connect(&addr);
        let tcp_stream = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial).await??,
            None => dial.await?,
        };
        tcp_stream.set_nodelay(true)?;

        if !config.tls.enabled {
            return Ok(ClientStream::Tcp(tcp_stream));
        }

        debug!("Establishing TLS connection with {addr}");
        let connector = build_tls_connector(config)?;
        let domain = rustls::pki_types::ServerName::try_from(config.tls_server_name())
            .map_err(|_| ClientError::Tls("Invalid TLS domain name".into()))?
            .to_owned();
        let tls_stream = connector.connect(domain, tcp_stream).await?;
        Ok(ClientStream::Tls(Box::new(tls_stream)))
    }
}

/// Builds a connector trusting the bundled web PKI roots plus any
/// certificates from `tls.ca_cert_path`.
fn build_tls_connector(config: &ClientConfig) -> Result<TlsConnector, ClientError> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.tls.ca_cert_path {
        let file = File::open(path)
            .map_err(|e| ClientError::Tls(format!("Cannot open CA file '{path}': {e}")))?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert =
                cert.map_err(|e| ClientError::Tls(format!("Invalid CA file '{path}': {e}")))?;
            root_cert_store.add(cert)?;
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

// --- Trait Implementations for ClientStream ---
// These implementations simply delegate the calls to the underlying stream type.

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
