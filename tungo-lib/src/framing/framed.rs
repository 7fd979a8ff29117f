use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameCap, FrameError};

pub const LENGTH_PREFIX_LEN: usize = 2;

/// Read side of the length-prefixed record codec.
pub struct FrameReader<R> {
    inner: R,
    cap: FrameCap,
}

/// Write side of the length-prefixed record codec.
pub struct FrameWriter<W> {
    inner: W,
    cap: FrameCap,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, cap: FrameCap) -> Self {
        Self { inner, cap }
    }

    /// Read one record into `buf`, returning its length.
    ///
    /// A frame longer than `buf` is reported as `ShortBuffer` without
    /// draining the payload; the stream is desynchronized afterwards and
    /// the caller must close it rather than retry.
    pub async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        read_exact_loop(&mut self.inner, &mut prefix)
            .await
            .map_err(|_| FrameError::InvalidLengthPrefix)?;

        let len = usize::from(u16::from_be_bytes(prefix));
        if len == 0 {
            return Err(FrameError::ZeroLengthFrame);
        }
        self.cap.validate_len(len as i64)?;
        if len > buf.len() {
            return Err(FrameError::ShortBuffer { frame: len, buf: buf.len() });
        }

        read_exact_loop(&mut self.inner, &mut buf[..len]).await?;
        Ok(len)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, cap: FrameCap) -> Self {
        Self { inner, cap }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.is_empty() {
            return Err(FrameError::ZeroLengthFrame);
        }
        self.cap.validate_len(payload.len() as i64)?;

        let prefix = (payload.len() as u16).to_be_bytes();
        write_all_loop(&mut self.inner, &prefix).await?;
        write_all_loop(&mut self.inner, payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

async fn write_all_loop<W: AsyncWrite + Unpin>(
    inner: &mut W,
    mut data: &[u8],
) -> Result<(), FrameError> {
    while !data.is_empty() {
        let n = inner.write(data).await?;
        if n == 0 {
            return Err(FrameError::ShortWrite);
        }
        data = &data[n..];
    }
    Ok(())
}

async fn read_exact_loop<R: AsyncRead + Unpin>(
    inner: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = inner.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    Ok(())
}
