//! One LDAP session to the directory server: transport setup, framing and close.

use crate::config::{LdapConfig, SecurityMode};
use crate::error::{GatewayError, Result};
use crate::ldap_protocol::{
    BindAuthentication, BindRequest, BindResponse, Control, ExtendedRequest, ExtendedResponse, LdapMessage, NOTICE_OF_DISCONNECTION_OID,
    ProtocolOp, START_TLS_OID, encode_ldap_message, frame_length, parse_ldap_message,
};
use crate::sequencer::next_message_id;
use crate::tls;
use anyhow::{Context, bail};
use bytes::BytesMut;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tracing::{debug, info, warn};

/// Upper bound for one inbound LDAP message.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Stream to the directory server: plain TCP or TLS (ldaps:// or after StartTLS).
pub enum WireStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for WireStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            WireStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WireStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            WireStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            WireStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            WireStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            WireStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection used by exactly one batch. Close it with [`WireConnection::close`];
/// dropping it without closing only releases the socket.
pub struct WireConnection {
    stream: Option<WireStream>,
    read_buf: BytesMut,
    address: String,
    broken: bool,
}

/// The unsolicited notice of disconnection, if `msg` is one.
pub fn notice_of_disconnection(msg: &LdapMessage) -> Option<&ExtendedResponse> {
    match &msg.protocol_op {
        ProtocolOp::ExtendedResponse(r)
            if msg.message_id == 0
                && r.response_name.as_deref().map_or(true, |name| name == NOTICE_OF_DISCONNECTION_OID) =>
        {
            Some(r)
        }
        _ => None,
    }
}

fn unusable(address: &str) -> GatewayError {
    GatewayError::CouldNotConnect(format!("connection to {} is no longer usable", address))
}

impl WireConnection {
    /// Open the transport (TCP, ldaps or StartTLS) within `network_timeout`.
    pub async fn connect(config: &LdapConfig) -> Result<Self> {
        let address = config.address();
        let conn = tokio::time::timeout(config.connect_timeout(), Self::open(config))
            .await
            .map_err(|_| GatewayError::CouldNotConnect(format!("timed out connecting to {}", address)))??;
        info!("Connected to directory server {} ({:?})", address, config.security);
        Ok(conn)
    }

    async fn open(config: &LdapConfig) -> Result<Self> {
        let address = config.address();
        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|e| GatewayError::CouldNotConnect(format!("failed to connect to {}: {}", address, e)))?;
        let stream = match config.security {
            SecurityMode::Ldaps => WireStream::Tls(Box::new(handshake(config, tcp).await?)),
            _ => WireStream::Tcp(tcp),
        };
        let mut conn = Self {
            stream: Some(stream),
            read_buf: BytesMut::new(),
            address,
            broken: false,
        };
        if config.security == SecurityMode::Starttls {
            if let Err(e) = conn.start_tls(config).await {
                conn.close().await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    async fn start_tls(&mut self, config: &LdapConfig) -> Result<()> {
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: START_TLS_OID.to_string(),
            request_value: None,
        });
        match self.request(op, Vec::new()).await? {
            ProtocolOp::ExtendedResponse(r) if r.result.result_code == 0 => {}
            ProtocolOp::ExtendedResponse(r) => {
                return Err(GatewayError::CouldNotConnect(format!(
                    "StartTLS refused by {}: code {} {}",
                    self.address, r.result.result_code, r.result.diagnostic_message
                )));
            }
            other => {
                return Err(GatewayError::Internal(format!("unexpected {} in reply to StartTLS", other.name())));
            }
        }
        let tcp = match self.stream.take() {
            Some(WireStream::Tcp(tcp)) => tcp,
            _ => return Err(GatewayError::Internal("StartTLS on a stream that is not plain TCP".to_string())),
        };
        let tls_stream = handshake(config, tcp).await?;
        self.stream = Some(WireStream::Tls(Box::new(tls_stream)));
        debug!("StartTLS completed with {}", self.address);
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// No further traffic is attempted once the server has gone away.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Send one request with a fresh message id; returns that id.
    pub async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<i32> {
        let message_id = next_message_id();
        let name = op.name();
        let message = LdapMessage {
            message_id,
            protocol_op: op,
            controls,
        };
        let bytes = encode_ldap_message(&message).map_err(|e| GatewayError::Internal(format!("{:#}", e)))?;
        if self.broken {
            return Err(unusable(&self.address));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(unusable(&self.address));
        };
        let written = write_frame(stream, &bytes).await;
        if let Err(e) = written {
            self.broken = true;
            return Err(GatewayError::CouldNotConnect(format!("{:#}", e)));
        }
        debug!("Sent {} message_id={} to {}", name, message_id, self.address);
        Ok(message_id)
    }

    /// Next message from the server, or `None` once the server has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<LdapMessage>> {
        if self.broken {
            return Err(unusable(&self.address));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(unusable(&self.address));
        };
        let frame = read_frame(stream, &mut self.read_buf).await;
        match frame {
            Ok(Some(frame)) => parse_ldap_message(&frame)
                .map(Some)
                .map_err(|e| GatewayError::Internal(format!("undecodable message from {}: {:#}", self.address, e))),
            Ok(None) => {
                debug!("{} closed the connection", self.address);
                self.broken = true;
                Ok(None)
            }
            Err(e) => {
                self.broken = true;
                Err(GatewayError::CouldNotConnect(format!("{:#}", e)))
            }
        }
    }

    /// Send a request and wait for the message answering it. Messages with other ids are skipped.
    pub async fn request(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<ProtocolOp> {
        let message_id = self.send(op, controls).await?;
        loop {
            let Some(message) = self.recv().await? else {
                return Err(GatewayError::CouldNotConnect(format!(
                    "{} closed the connection before answering message {}",
                    self.address, message_id
                )));
            };
            if message.message_id == message_id {
                return Ok(message.protocol_op);
            }
            if let Some(notice) = notice_of_disconnection(&message) {
                self.broken = true;
                return Err(GatewayError::CouldNotConnect(format!(
                    "{} is disconnecting: {}",
                    self.address, notice.result.diagnostic_message
                )));
            }
            debug!(
                "Skipping {} message_id={} while waiting for {}",
                message.protocol_op.name(),
                message.message_id,
                message_id
            );
        }
    }

    pub async fn bind(&mut self, name: &str, authentication: BindAuthentication) -> Result<BindResponse> {
        let op = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: name.to_string(),
            authentication,
        });
        match self.request(op, Vec::new()).await? {
            ProtocolOp::BindResponse(r) => Ok(r),
            other => Err(GatewayError::Internal(format!("unexpected {} in reply to bind", other.name()))),
        }
    }

    /// Unbind (when the session is still usable) and shut the stream down. Idempotent.
    pub async fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if !self.broken {
            let unbind = LdapMessage {
                message_id: next_message_id(),
                protocol_op: ProtocolOp::UnbindRequest,
                controls: Vec::new(),
            };
            match encode_ldap_message(&unbind) {
                Ok(bytes) => {
                    if let Err(e) = write_frame(&mut stream, &bytes).await {
                        debug!("Unbind to {} failed: {:#}", self.address, e);
                    }
                }
                Err(e) => warn!("Failed to encode unbind: {:#}", e),
            }
        }
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown of connection to {} failed: {}", self.address, e);
        }
        debug!("Closed connection to {}", self.address);
    }
}

impl Drop for WireConnection {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            warn!("Connection to {} dropped without unbind", self.address);
        }
    }
}

async fn handshake(config: &LdapConfig, tcp: TcpStream) -> Result<ClientTlsStream<TcpStream>> {
    let address = config.address();
    let result: anyhow::Result<ClientTlsStream<TcpStream>> = async {
        let tls_config = tls::client_config(config.ca_file.as_deref(), config.trust_all.unwrap_or(false))?;
        let server_name = tls::server_name(&config.host)?;
        TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {} failed", address))
    }
    .await;
    result.map_err(|e| GatewayError::CouldNotConnect(format!("{:#}", e)))
}

async fn write_frame(stream: &mut WireStream, bytes: &[u8]) -> anyhow::Result<()> {
    stream.write_all(bytes).await.context("Write to directory server")?;
    stream.flush().await.context("Flush to directory server")?;
    Ok(())
}

/// Read exactly one BER-framed LDAP message. `Ok(None)` on a clean close between messages.
async fn read_frame(stream: &mut WireStream, buf: &mut BytesMut) -> anyhow::Result<Option<Vec<u8>>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(total) = frame_length(buf)? {
            if total > MAX_MESSAGE_SIZE {
                bail!("Message of {} bytes exceeds limit", total);
            }
            if buf.len() >= total {
                return Ok(Some(buf.split_to(total).to_vec()));
            }
        }
        let n = stream.read(&mut chunk).await.context("Read from directory server")?;
        if n == 0 {
            if !buf.is_empty() {
                bail!("Connection closed in the middle of a message ({} bytes buffered)", buf.len());
            }
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
