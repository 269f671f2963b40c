//! Reconnecting syslog writer for UDP, TCP and TCP+TLS collectors.
//!
//! The connection is opened lazily on the first write. A failed write tears
//! the connection down and reports the error; the next write dials again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, instrument};

use crate::config::{SyslogConfig, SyslogProtocol};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SyslogError {
    #[error("failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {0} timed out")]
    Timeout(String),

    #[error("'{0}' is not a valid TLS server name")]
    InvalidServerName(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Udp(socket) => socket.send(bytes).await.map(|_| ()),
            Connection::Tcp(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Connection::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
        }
    }
}

pub struct SyslogClient {
    protocol: SyslogProtocol,
    server: String,
    skip_verify: bool,
    hostname: String,
    conn: Option<Connection>,
}

impl SyslogClient {
    pub fn new(config: &SyslogConfig) -> Self {
        Self {
            protocol: config.protocol,
            server: config.server.clone(),
            skip_verify: config.skip_verify,
            hostname: crate::util::host_name(),
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Format and send one message, dialling first if there is no live
    /// connection.
    #[instrument(skip(self, content), fields(server = %self.server, protocol = %self.protocol))]
    pub async fn write(
        &mut self,
        priority: u8,
        timestamp: DateTime<Utc>,
        tag: &str,
        content: &str,
    ) -> Result<(), SyslogError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let message = format_message(priority, timestamp, &self.hostname, tag, content);
        match conn.send(message.as_bytes()).await {
            Ok(()) => {
                self.conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                debug!("write failed, dropping connection: {e}");
                Err(SyslogError::Write(e))
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn {
                Connection::Tcp(mut stream) => {
                    let _ = stream.shutdown().await;
                }
                Connection::Tls(mut stream) => {
                    let _ = stream.shutdown().await;
                }
                Connection::Udp(_) => {}
            }
        }
    }

    async fn connect(&self) -> Result<Connection, SyslogError> {
        debug!("dialling syslog collector");
        tokio::time::timeout(CONNECT_TIMEOUT, self.dial())
            .await
            .map_err(|_| SyslogError::Timeout(self.server.clone()))?
    }

    async fn dial(&self) -> Result<Connection, SyslogError> {
        let connect_error = |source| SyslogError::Connect {
            server: self.server.clone(),
            source,
        };

        match self.protocol {
            SyslogProtocol::Udp => {
                let target = tokio::net::lookup_host(&self.server)
                    .await
                    .map_err(connect_error)?
                    .next()
                    .ok_or_else(|| {
                        connect_error(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no address resolved",
                        ))
                    })?;
                let local: SocketAddr = if target.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket = UdpSocket::bind(local).await.map_err(connect_error)?;
                socket.connect(target).await.map_err(connect_error)?;
                Ok(Connection::Udp(socket))
            }
            SyslogProtocol::Tcp => {
                let stream = TcpStream::connect(&self.server)
                    .await
                    .map_err(connect_error)?;
                Ok(Connection::Tcp(stream))
            }
            SyslogProtocol::TcpTls => {
                let host = server_host(&self.server);
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| SyslogError::InvalidServerName(host.to_string()))?;
                let connector = TlsConnector::from(Arc::new(tls_config(self.skip_verify)?));

                let tcp = TcpStream::connect(&self.server)
                    .await
                    .map_err(connect_error)?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(connect_error)?;
                Ok(Connection::Tls(Box::new(stream)))
            }
        }
    }
}

/// `<priority>timestamp hostname tag: content\n`
pub fn format_message(
    priority: u8,
    timestamp: DateTime<Utc>,
    hostname: &str,
    tag: &str,
    content: &str,
) -> String {
    format!(
        "<{priority}>{} {hostname} {tag}: {content}\n",
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}


fn server_host(server: &str) -> &str {
    // [v6]:port, host:port or a bare host
    if let Some(rest) = server.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => server,
    }
}

fn tls_config(skip_verify: bool) -> Result<ClientConfig, SyslogError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
