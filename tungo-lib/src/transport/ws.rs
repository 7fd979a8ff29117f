use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, TunnelError};

use super::map_ws_error;

/// Byte-stream view of a WebSocket connection.
///
/// Tunnel records ride in binary messages; this adapter flattens them
/// back into a byte stream so the same framing codec runs over TCP and
/// WS alike. Text, ping, and pong messages are skipped; a close frame
/// reads as EOF.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner, read_buf: Bytes::new() }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.read_buf.has_remaining() {
                let n = self.read_buf.remaining().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    self.read_buf = data;
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    return Poll::Ready(Err(std::io::Error::other(err)));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(std::io::Error::other)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(data)))
            .map_err(std::io::Error::other)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(std::io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(std::io::Error::other)
    }
}

/// Dial a `ws://` or `wss://` endpoint.
pub async fn connect(url: &str) -> Result<WsByteStream<MaybeTlsStream<TcpStream>>> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(map_ws_error)?;
    Ok(WsByteStream::new(stream))
}

/// Run the server side of the WebSocket upgrade on an accepted socket.
pub async fn accept<S>(stream: S) -> Result<WsByteStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(map_ws_error)?;
    Ok(WsByteStream::new(stream))
}

/// Build a TLS acceptor for WSS listeners from PEM files.
pub fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = {
        let bytes = std::fs::read(cert_path)
            .map_err(|e| TunnelError::Tls(format!("failed to read certificate: {e}")))?;
        CertificateDer::pem_slice_iter(&bytes)
            .collect::<std::result::Result<Vec<_>, rustls_pki_types::pem::Error>>()
            .map_err(|e| TunnelError::Tls(format!("failed to parse certificates: {e}")))?
    };

    let key = {
        let bytes = std::fs::read(key_path)
            .map_err(|e| TunnelError::Tls(format!("failed to read key: {e}")))?;
        let mut keys: Vec<PrivateKeyDer<'_>> = PrivateKeyDer::pem_slice_iter(&bytes)
            .collect::<std::result::Result<Vec<_>, rustls_pki_types::pem::Error>>()
            .map_err(|e| TunnelError::Tls(format!("failed to parse private key: {e}")))?;
        let Some(key) = keys.pop() else {
            return Err(TunnelError::Tls("no private key found in key file".into()));
        };
        key
    };

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("failed to build TLS config: {e}")))?;

    Ok(TlsAcceptor::from(std::sync::Arc::new(server)))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn byte_stream_round_trip_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            let mut stream = WsByteStream::new(ws);
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        let mut stream = WsByteStream::new(ws);
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_frame_reads_as_eof() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            let mut stream = WsByteStream::new(ws);
            stream.shutdown().await.unwrap();
        });

        let (ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        let mut stream = WsByteStream::new(ws);
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        server.await.unwrap();
    }
}
