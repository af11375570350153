//! Guarded object write stream
//!
//! A [`WriteStream`] owns the backend writer for one upload. `finish` commits
//! the object and `close` aborts it. Dropping a stream that was neither
//! finished nor closed schedules the abort in the background.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::ObjectWriter;
use crate::error::Result;

/// Write stream that is released on every exit path
pub struct WriteStream {
    name: String,
    inner: Option<Box<dyn ObjectWriter>>,
}

impl WriteStream {
    pub(crate) fn new(name: String, inner: Box<dyn ObjectWriter>) -> Self {
        Self {
            name,
            inner: Some(inner),
        }
    }

    /// Object name this stream writes to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush buffered bytes and make the object durable.
    ///
    /// The backend writer is released whether or not the commit succeeds;
    /// a failed commit leaves no object behind. It is not aborted after a
    /// failed commit: `object_store`'s `BufWriter` cannot abort once shutdown
    /// has started. If the commit fails after a multipart upload began, its
    /// parts stay on the server until the bucket's lifecycle rules expire
    /// incomplete uploads.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!("Commit of {} failed, upload not aborted: {}", self.name, e);
                return Err(e.into());
            }
        }
        tracing::debug!("Committed object {}", self.name);
        Ok(())
    }

    /// Abort the upload. Errors are logged, not returned.
    pub async fn close(mut self) {
        if let Some(mut writer) = self.inner.take() {
            if let Err(e) = writer.abort().await {
                tracing::debug!("Failed to abort upload of {}: {}", self.name, e);
            }
        }
    }

    fn writer(&mut self) -> io::Result<&mut Box<dyn ObjectWriter>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write stream is closed"))
    }
}

impl AsyncWrite for WriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().writer() {
            Ok(writer) => Pin::new(writer.as_mut()).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer() {
            Ok(writer) => Pin::new(writer.as_mut()).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer() {
            Ok(writer) => Pin::new(writer.as_mut()).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        let Some(mut writer) = self.inner.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let name = std::mem::take(&mut self.name);
                handle.spawn(async move {
                    if let Err(e) = writer.abort().await {
                        tracing::debug!("Failed to abort upload of {}: {}", name, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Dropped upload of {} outside a runtime, not aborted", self.name);
            }
        }
    }
}
