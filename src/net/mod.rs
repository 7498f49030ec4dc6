//! Transport: a bidirectional byte pipe over TCP, unix socket, or TLS.
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;

use crate::postgres::frontend::SslRequest;

mod tls;

pub use tls::{SslMode, TlsSettings};

/// an either `TcpStream`, `UnixStream` or TLS wrapped `TcpStream`, which
/// implement `AsyncRead` and `AsyncWrite` transparently
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tls(Box<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>),
}

/// Outcome of an [`SslRequest`] negotiation.
pub enum TlsAttempt {
    /// Server answered `S`; the stream is TLS from here on.
    Secured(Socket),
    /// Server answered `N`; the stream stays plaintext.
    Refused(Socket),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Socket> {
        let socket = tokio::net::TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        Ok(Socket { kind: Kind::Tcp(socket) })
    }

    pub async fn connect_unix(path: &str) -> io::Result<Socket> {
        #[cfg(unix)]
        {
            let socket = tokio::net::UnixStream::connect(path).await?;
            Ok(Socket { kind: Kind::Unix(socket) })
        }

        #[cfg(not(unix))]
        {
            let _ = path;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            ))
        }
    }

    /// Send an `SSLRequest` and, if the server accepts, run the TLS
    /// handshake.
    ///
    /// Only valid immediately after connecting, before any protocol byte
    /// is exchanged.
    pub async fn request_tls(mut self, settings: &TlsSettings, host: &str) -> io::Result<TlsAttempt> {
        let Kind::Tcp(ref mut tcp) = self.kind else {
            // unix sockets and already-secured streams never negotiate
            return Ok(TlsAttempt::Refused(self));
        };

        let mut buf = BytesMut::with_capacity(8);
        SslRequest.write(&mut buf);
        tcp.write_all(&buf).await?;

        let mut answer = [0u8; 1];
        tcp.read_exact(&mut answer).await?;

        match answer[0] {
            b'S' => {
                let connector = settings.connector()?;
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let Kind::Tcp(tcp) = self.kind else { unreachable!() };
                let stream = connector.connect(name, tcp).await?;
                Ok(TlsAttempt::Secured(Socket { kind: Kind::Tls(Box::new(stream)) }))
            }
            b'N' => Ok(TlsAttempt::Refused(self)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected ssl negotiation answer: 0x{other:02x}"),
            )),
        }
    }

    /// Wait until the socket is readable.
    ///
    /// For a TLS stream readiness is reported for the underlying TCP
    /// stream; already-buffered TLS records must be drained first by the
    /// caller.
    pub async fn readable(&self) -> io::Result<()> {
        match &self.kind {
            Kind::Tcp(tcp) => tcp.readable().await,
            #[cfg(unix)]
            Kind::Unix(unix) => unix.readable().await,
            Kind::Tls(tls) => tls.get_ref().0.readable().await,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.kind, Kind::Tls(_))
    }
}

impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_read(cx, buf),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write(cx, buf),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write_vectored(cx, bufs),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.kind {
            Kind::Tcp(t) => t.is_write_vectored(),
            #[cfg(unix)]
            Kind::Unix(u) => u.is_write_vectored(),
            Kind::Tls(t) => t.is_write_vectored(),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_flush(cx),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_shutdown(cx),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::Unix(unix) => std::fmt::Debug::fmt(unix, f),
            Kind::Tls(_) => f.write_str("TlsStream"),
        }
    }
}
