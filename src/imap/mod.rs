//! IMAP connector (LOGIN) using async-imap 0.11 with optional tokio-rustls.
use anyhow::{Context, Result};
use async_imap::{Client, Session};
use rustls_native_certs::load_native_certs;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::debug;

use crate::config::ImapCredentials;
use crate::errors::AppError;

/// Transport under the IMAP session: plain TCP or TLS over TCP.
pub trait MailIo: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> MailIo for T {}

pub type ImapSession = Session<Compat<Box<dyn MailIo>>>;

pub struct ImapClient;

impl ImapClient {
    pub async fn connect(creds: &ImapCredentials) -> Result<ImapSession> {
        let tcp = TcpStream::connect((creds.host.as_str(), creds.port))
            .await
            .map_err(|e| AppError::Network(format!("connecting to {}:{}: {e}", creds.host, creds.port)))?;

        let stream: Box<dyn MailIo> = if creds.tls {
            Box::new(Self::start_tls(&creds.host, tcp).await?)
        } else {
            Box::new(tcp)
        };

        // Convert tokio AsyncRead/AsyncWrite to futures AsyncRead/AsyncWrite
        let mut client = Client::new(stream.compat());

        let _greeting = client
            .read_response()
            .await
            .context("reading IMAP greeting")?
            .ok_or_else(|| AppError::Network("unexpected end of stream, expected greeting".into()))?;

        let session = client
            .login(&creds.username, &creds.password)
            .await
            .map_err(|(err, _client)| AppError::Network(format!("LOGIN rejected: {err}")))?;

        debug!(host = %creds.host, port = creds.port, tls = creds.tls, "IMAP session established");
        Ok(session)
    }

    async fn start_tls(
        host: &str,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let mut root_store = RootCertStore::empty();
        for cert in load_native_certs().context("failed to load native certs")? {
            root_store
                .add(&tokio_rustls::rustls::Certificate(cert.0))
                .context("failed to add cert to root store")?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host).context("invalid DNS name")?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| AppError::Network(format!("TLS handshake with {host}: {e}")))?;

        Ok(tls_stream)
    }
}
