//! Tor connection handling.
//!
//! Outbound streams go through tor's SOCKS5 listener. Hostnames are always
//! resolved by tor. Passing a stream id isolates the connection: tor puts
//! streams with different SOCKS credentials on different circuits, so each
//! stream id gets its own credential derived from it.

use super::controller::TorController;
use super::LOCALHOST;
use crate::error::{Error, Result};
use crate::logging::Redacted;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const BASE26_DIGITS: &[u8; 26] = b"0123456789abcdefghijklmnop";

/// SOCKS username/password derived from a stream id.
///
/// The SHA-256 digest of the id, read as a signed big-endian integer and
/// written in base 26. Used as both username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct IsolationCredential(String);

impl IsolationCredential {
    /// Derive the credential for `stream_id`.
    pub fn derive(stream_id: &str) -> Self {
        let digest = Sha256::digest(stream_id.as_bytes());
        Self(signed_base26(&digest))
    }

    /// Username sent in the RFC 1929 sub-negotiation.
    pub fn username(&self) -> &str {
        &self.0
    }

    /// Password sent in the RFC 1929 sub-negotiation.
    pub fn password(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IsolationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IsolationCredential({})", Redacted(&self.0))
    }
}

/// Render big-endian two's-complement bytes in base 26.
fn signed_base26(bytes: &[u8]) -> String {
    let negative = bytes.first().map_or(false, |b| b & 0x80 != 0);
    let mut magnitude = bytes.to_vec();
    if negative {
        // Two's complement negation: invert, then add one.
        for byte in magnitude.iter_mut() {
            *byte = !*byte;
        }
        for byte in magnitude.iter_mut().rev() {
            let (sum, carry) = byte.overflowing_add(1);
            *byte = sum;
            if !carry {
                break;
            }
        }
    }

    let mut digits = Vec::new();
    while magnitude.iter().any(|&b| b != 0) {
        let mut remainder = 0u32;
        for byte in magnitude.iter_mut() {
            let value = (remainder << 8) | u32::from(*byte);
            *byte = (value / 26) as u8;
            remainder = value % 26;
        }
        digits.push(BASE26_DIGITS[remainder as usize]);
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// A resolved SOCKS5 proxy, optionally with an isolation credential.
#[derive(Debug, Clone)]
pub struct SocksProxy {
    addr: SocketAddr,
    credential: Option<IsolationCredential>,
}

impl SocksProxy {
    /// Proxy at `addr`, isolated when `credential` is set.
    pub fn new(addr: SocketAddr, credential: Option<IsolationCredential>) -> Self {
        Self { addr, credential }
    }

    /// Proxy listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Isolation credential, if any.
    pub fn credential(&self) -> Option<&IsolationCredential> {
        self.credential.as_ref()
    }

    /// Hostnames are never resolved locally.
    pub fn resolve_locally(&self) -> bool {
        false
    }

    /// `socks5h://` URL for clients that take a proxy URL.
    pub fn url(&self) -> String {
        match &self.credential {
            Some(credential) => format!(
                "socks5h://{}:{}@{}",
                credential.username(),
                credential.password(),
                self.addr
            ),
            None => format!("socks5h://{}", self.addr),
        }
    }

    /// Open a stream to `host:port` through the proxy.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TorConnection> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| Error::ProxyUnavailable(format!("failed to connect to {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;

        socks5_handshake(&mut stream, host, port, self.credential.as_ref()).await?;
        tracing::debug!(port, isolated = self.credential.is_some(), "SOCKS5 stream established");

        Ok(TorConnection {
            stream,
            host: host.to_string(),
            port,
        })
    }
}

/// Perform the SOCKS5 greeting, optional RFC 1929 authentication, and
/// CONNECT on `stream`. The stream is left open for the caller.
pub(crate) async fn socks5_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credential: Option<&IsolationCredential>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = match credential {
        Some(_) => METHOD_USERNAME_PASSWORD,
        None => METHOD_NO_AUTH,
    };
    stream.write_all(&[SOCKS_VERSION, 0x01, method]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!("unexpected SOCKS version {}", choice[0])));
    }
    if choice[1] != method {
        return Err(Error::Authentication(format!(
            "proxy selected method {:#04x}, offered {:#04x}",
            choice[1], method
        )));
    }

    if let Some(credential) = credential {
        let user = credential.username().as_bytes();
        let pass = credential.password().as_bytes();
        let mut request = Vec::with_capacity(3 + user.len() + pass.len());
        request.push(AUTH_VERSION);
        request.push(user.len() as u8);
        request.extend_from_slice(user);
        request.push(pass.len() as u8);
        request.extend_from_slice(pass);
        stream.write_all(&request).await?;

        let mut status = [0u8; 2];
        stream
            .read_exact(&mut status)
            .await
            .map_err(|e| Error::Authentication(format!("no authentication reply: {}", e)))?;
        if status[1] != 0x00 {
            return Err(Error::Authentication(format!("proxy rejected credentials ({})", status[1])));
        }
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(Error::Protocol(format!("invalid hostname length {}", name.len())));
            }
            request.push(ATYP_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!("unexpected SOCKS version {}", header[0])));
    }
    if header[1] != 0x00 {
        return Err(Error::Socks { code: header[1] });
    }

    // Bound address; unused but must be consumed.
    let remaining = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => return Err(Error::Protocol(format!("invalid SOCKS address type {}", other))),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// A connected stream through tor.
#[derive(Debug)]
pub struct TorConnection {
    stream: TcpStream,
    host: String,
    port: u16,
}

impl TorConnection {
    /// Destination host as requested.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The underlying socket.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    /// Split into read and write halves.
    pub fn split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

impl AsyncRead for TorConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TorConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Opens connections that all share one proxy descriptor (and so one
/// circuit isolation class).
#[derive(Debug, Clone)]
pub struct TorConnector {
    proxy: SocksProxy,
}

impl TorConnector {
    /// Connector over `proxy`.
    pub fn new(proxy: SocksProxy) -> Self {
        Self { proxy }
    }

    /// The proxy descriptor.
    pub fn proxy(&self) -> &SocksProxy {
        &self.proxy
    }

    /// Open a new stream to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TorConnection> {
        self.proxy.connect(host, port).await
    }
}

/// Hands out SOCKS descriptors for the daemon behind a control session.
#[derive(Debug, Clone)]
pub struct TorProxyClient {
    controller: Arc<TorController>,
}

impl TorProxyClient {
    /// Client asking `controller` for the SOCKS port.
    pub fn new(controller: Arc<TorController>) -> Self {
        Self { controller }
    }

    /// Proxy descriptor, isolated when `stream_id` is set.
    ///
    /// The SOCKS port is looked up on every call.
    pub async fn proxy(&self, stream_id: Option<&str>) -> Result<SocksProxy> {
        let port = self
            .controller
            .socks_port()
            .await
            .map_err(|e| Error::ProxyUnavailable(e.to_string()))?;
        Ok(SocksProxy::new(
            SocketAddr::new(LOCALHOST, port),
            stream_id.map(IsolationCredential::derive),
        ))
    }

    /// Connected stream to `host:port`.
    pub async fn socks_stream(&self, host: &str, port: u16, stream_id: Option<&str>) -> Result<TorConnection> {
        self.proxy(stream_id).await?.connect(host, port).await
    }

    /// Connector bound to one isolation class.
    pub async fn connector(&self, stream_id: Option<&str>) -> Result<TorConnector> {
        Ok(TorConnector::new(self.proxy(stream_id).await?))
    }
}
