//! Transport layer abstraction for MQTT connections.
//!
//! This module provides a unified interface for different transport types:
//! - TCP (plain)
//! - TLS (secure)
//! - WebSocket
//! - WebSocket over TLS

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

#[cfg(feature = "websocket")]
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
    /// TLS encrypted connection.
    #[cfg(feature = "tls")]
    Tls,
    /// WebSocket connection.
    #[cfg(feature = "websocket")]
    WebSocket,
    /// WebSocket over TLS connection.
    #[cfg(all(feature = "websocket", feature = "tls"))]
    WebSocketTls,
}

impl TransportType {
    /// Parse transport type from URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some(TransportType::Tcp),
            #[cfg(feature = "tls")]
            "tls" | "mqtts" | "ssl" => Some(TransportType::Tls),
            #[cfg(feature = "websocket")]
            "ws" => Some(TransportType::WebSocket),
            #[cfg(all(feature = "websocket", feature = "tls"))]
            "wss" => Some(TransportType::WebSocketTls),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tcp => 1883,
            #[cfg(feature = "tls")]
            TransportType::Tls => 8883,
            #[cfg(feature = "websocket")]
            TransportType::WebSocket => 80,
            #[cfg(all(feature = "websocket", feature = "tls"))]
            TransportType::WebSocketTls => 443,
        }
    }
}

/// A parsed `scheme://host[:port][/path]` transport URL.
struct ParsedUrl<'a> {
    scheme: &'a str,
    host: &'a str,
    port: Option<u16>,
    path: &'a str,
}

fn parse_url(url: &str) -> crate::error::Result<ParsedUrl<'_>> {
    let (scheme, rest) = url.split_once("://").unwrap_or(("tcp", url));
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| crate::error::Error::InvalidConfig(format!("bad port in {url}")))?;
            (h, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(crate::error::Error::InvalidConfig(format!(
            "missing host in {url}"
        )));
    }
    Ok(ParsedUrl {
        scheme,
        host,
        port,
        path,
    })
}

/// Dial a transport URL: `tcp://`, `tls://`/`mqtts://`, or `ws://`/`wss://`.
pub async fn dial(url: &str) -> crate::error::Result<Transport> {
    let parsed = parse_url(url)?;
    let kind = TransportType::from_scheme(parsed.scheme).ok_or_else(|| {
        crate::error::Error::InvalidConfig(format!("unsupported scheme in {url}"))
    })?;
    let port = parsed.port.unwrap_or_else(|| kind.default_port());

    match kind {
        TransportType::Tcp => {
            let stream = TcpStream::connect((parsed.host, port)).await?;
            Ok(Transport::Tcp(stream))
        }
        #[cfg(feature = "tls")]
        TransportType::Tls => {
            let stream = TcpStream::connect((parsed.host, port)).await?;
            let config = tls::TlsConfig::new()?;
            let tls_stream = config.connect(stream, parsed.host).await?;
            Ok(Transport::Tls(Box::new(tls_stream)))
        }
        #[cfg(feature = "websocket")]
        TransportType::WebSocket => {
            let ws_url = format!("ws://{}:{}/{}", parsed.host, port, parsed.path);
            let stream = websocket::connect(&ws_url).await?;
            Ok(Transport::WebSocket(Box::new(stream)))
        }
        #[cfg(all(feature = "websocket", feature = "tls"))]
        TransportType::WebSocketTls => {
            let ws_url = format!("wss://{}:{}/{}", parsed.host, port, parsed.path);
            let stream = websocket::connect(&ws_url).await?;
            Ok(Transport::WebSocket(Box::new(stream)))
        }
    }
}

/// A unified transport that wraps different connection types.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    /// WebSocket stream, presented as a byte stream.
    #[cfg(feature = "websocket")]
    WebSocket(Box<websocket::WsByteStream>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS configuration and utilities.

    use std::io;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    /// TLS configuration for client connections.
    #[derive(Clone)]
    pub struct TlsConfig {
        /// The TLS connector.
        pub connector: TlsConnector,
    }

    impl TlsConfig {
        /// Create a new TLS config with default settings.
        pub fn new() -> io::Result<Self> {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };

            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            Ok(Self {
                connector: TlsConnector::from(Arc::new(config)),
            })
        }

        /// Create a TLS config that skips certificate verification.
        /// **WARNING: This is insecure and should only be used for testing!**
        pub fn insecure() -> Self {
            use tokio_rustls::rustls::client::danger::{
                HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
            };
            use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
            use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

            #[derive(Debug)]
            struct InsecureVerifier;

            impl ServerCertVerifier for InsecureVerifier {
                fn verify_server_cert(
                    &self,
                    _end_entity: &CertificateDer<'_>,
                    _intermediates: &[CertificateDer<'_>],
                    _server_name: &ServerName<'_>,
                    _ocsp_response: &[u8],
                    _now: UnixTime,
                ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
                    Ok(ServerCertVerified::assertion())
                }

                fn verify_tls12_signature(
                    &self,
                    _message: &[u8],
                    _cert: &CertificateDer<'_>,
                    _dss: &DigitallySignedStruct,
                ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                    Ok(HandshakeSignatureValid::assertion())
                }

                fn verify_tls13_signature(
                    &self,
                    _message: &[u8],
                    _cert: &CertificateDer<'_>,
                    _dss: &DigitallySignedStruct,
                ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                    Ok(HandshakeSignatureValid::assertion())
                }

                fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                    vec![
                        SignatureScheme::RSA_PKCS1_SHA256,
                        SignatureScheme::RSA_PKCS1_SHA384,
                        SignatureScheme::RSA_PKCS1_SHA512,
                        SignatureScheme::ECDSA_NISTP256_SHA256,
                        SignatureScheme::ECDSA_NISTP384_SHA384,
                        SignatureScheme::RSA_PSS_SHA256,
                        SignatureScheme::RSA_PSS_SHA384,
                        SignatureScheme::RSA_PSS_SHA512,
                        SignatureScheme::ED25519,
                    ]
                }
            }

            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth();

            Self {
                connector: TlsConnector::from(Arc::new(config)),
            }
        }

        /// Connect to a TLS server.
        pub async fn connect(
            &self,
            stream: TcpStream,
            domain: &str,
        ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
            use tokio_rustls::rustls::pki_types::ServerName;

            let domain = ServerName::try_from(domain.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;

            self.connector.connect(domain, stream).await
        }
    }

    impl Default for TlsConfig {
        fn default() -> Self {
            Self::new().expect("failed to create default TLS config")
        }
    }
}


#[cfg(feature = "websocket")]
pub mod websocket {
    //! WebSocket utilities.
    //!
    //! [`WsByteStream`] presents a binary-framed WebSocket connection as a
    //! plain [`AsyncRead`]/[`AsyncWrite`] byte stream: reads buffer the
    //! remainder of a binary frame between calls, writes are accumulated and
    //! flushed as a single binary frame on `poll_flush`.

    use futures_util::{Sink, Stream};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::protocol::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    /// Connect to a WebSocket server, returning a byte-stream view.
    pub async fn connect(url: &str) -> io::Result<WsByteStream> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
        Ok(WsByteStream::new(ws_stream))
    }

    fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    /// A byte-stream adapter over a binary-framed WebSocket connection.
    pub struct WsByteStream {
        inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
        read_buf: Vec<u8>,
        read_pos: usize,
        write_buf: Vec<u8>,
    }

    impl WsByteStream {
        pub fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
            Self {
                inner,
                read_buf: Vec::new(),
                read_pos: 0,
                write_buf: Vec::new(),
            }
        }
    }

    impl AsyncRead for WsByteStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                if self.read_pos < self.read_buf.len() {
                    let n = std::cmp::min(buf.remaining(), self.read_buf.len() - self.read_pos);
                    let start = self.read_pos;
                    buf.put_slice(&self.read_buf[start..start + n]);
                    self.read_pos += n;
                    return Poll::Ready(Ok(()));
                }

                let this = self.as_mut().get_mut();
                match Pin::new(&mut this.inner).poll_next(cx) {
                    Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                        this.read_buf = data;
                        this.read_pos = 0;
                    }
                    Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                        return Poll::Ready(Ok(())); // EOF
                    }
                    Poll::Ready(Some(Ok(_))) => continue, // ignore text/ping/pong frames
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_err(e))),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }

    impl AsyncWrite for WsByteStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.get_mut().write_buf.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.write_buf.is_empty() {
                return Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_err);
            }
            match Pin::new(&mut this.inner).poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_err(e))),
                Poll::Pending => return Poll::Pending,
            }
            let frame = Message::Binary(std::mem::take(&mut this.write_buf));
            if let Err(e) = Pin::new(&mut this.inner).start_send(frame) {
                return Poll::Ready(Err(ws_err(e)));
            }
            Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_err)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_close(cx).map_err(ws_err)
        }
    }

}
