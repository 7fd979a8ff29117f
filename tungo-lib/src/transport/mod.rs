//! Transport plumbing: byte-stream transports feed the framing codec,
//! datagram transports carry one record per datagram.
//!
//! The transport is selected once at connection establishment; the wire
//! differences between stream and datagram records live at the crypto
//! layer's nonce mode, not behind a common nonce API.

pub mod tcp;
pub mod udp;
pub mod ws;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::error::{Result, TunnelError};
use crate::framing::{FrameCap, FrameReader, FrameWriter};

pub use udp::{DatagramReader, DatagramWriter};

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}
pub type BoxedIo = Box<dyn IoStream>;

/// Receive half of an established link: framed records on streams, raw
/// datagrams on UDP.
pub enum LinkReader {
    Stream(FrameReader<ReadHalf<BoxedIo>>),
    Datagram(DatagramReader),
}

/// Send half of an established link.
pub enum LinkWriter {
    Stream(FrameWriter<WriteHalf<BoxedIo>>),
    Datagram(DatagramWriter),
}

impl LinkReader {
    /// Read one record into `buf`, returning its length.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            LinkReader::Stream(reader) => Ok(reader.read_frame(buf).await?),
            LinkReader::Datagram(reader) => reader.recv(buf).await,
        }
    }
}

impl LinkWriter {
    /// Send one record.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            LinkWriter::Stream(writer) => Ok(writer.write_frame(payload).await?),
            LinkWriter::Datagram(writer) => writer.send(payload).await,
        }
    }

    /// Close the underlying transport. Safe to call more than once; a
    /// datagram writer shares its socket and closing is a no-op.
    pub async fn shutdown(&mut self) {
        if let LinkWriter::Stream(writer) = self {
            writer.shutdown().await;
        }
    }
}

/// Split a byte-stream transport into framed link halves.
pub fn stream_link(io: BoxedIo, cap: FrameCap) -> (LinkReader, LinkWriter) {
    let (read_half, write_half) = tokio::io::split(io);
    (
        LinkReader::Stream(FrameReader::new(read_half, cap)),
        LinkWriter::Stream(FrameWriter::new(write_half, cap)),
    )
}

pub(crate) fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> TunnelError {
    match err {
        tokio_tungstenite::tungstenite::Error::Io(io) => TunnelError::Io(io),
        other => TunnelError::Io(std::io::Error::other(other)),
    }
}
