use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// Read-deadline decorator for byte-stream transports.
///
/// Arms a deadline of `now + timeout` when a read begins; if the inner
/// transport stays silent past it, the read fails with `TimedOut`. This
/// gives idle-connection detection without a separate timer task.
/// Writes pass through untouched.
pub struct DeadlineStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout, deadline: None }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.deadline.is_none() {
            let at = Instant::now() + self.timeout;
            self.deadline = Some(Box::pin(sleep_until(at)));
        }

        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                self.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some(ref mut deadline) = self.deadline {
                    if deadline.as_mut().poll(cx).is_ready() {
                        self.deadline = None;
                        return Poll::Ready(Err(std::io::ErrorKind::TimedOut.into()));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silent_stream_times_out() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut guarded = DeadlineStream::new(rx, Duration::from_secs(60));

        let mut buf = [0u8; 8];
        let read = guarded.read(&mut buf);
        tokio::pin!(read);

        // nothing arrives; virtual time runs past the deadline
        let err = read.await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        // the write side is unaffected
        tx.write_all(b"late").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_rearms_per_read() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut guarded = DeadlineStream::new(rx, Duration::from_secs(60));

        tx.write_all(b"ab").await.unwrap();
        let mut buf = [0u8; 2];
        guarded.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");

        // a second read gets a fresh deadline
        tokio::time::advance(Duration::from_secs(30)).await;
        tx.write_all(b"cd").await.unwrap();
        guarded.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
    }
}
