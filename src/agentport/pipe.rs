// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use tokio::io::{AsyncWrite, DuplexStream};

const PIPE_CAPACITY: usize = 4096;

/// Creates a one-way, bounded in-process pipe. Writes wait for the reader to
/// drain the buffer, and closing the writer delivers end-of-stream to the
/// reader once it has consumed everything already written.
pub(crate) fn pipe() -> (DuplexStream, PipeWriter) {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    (
        reader,
        PipeWriter {
            inner: Arc::new(Mutex::new(Some(writer))),
        },
    )
}

/// The writing end of a [`pipe`]. Clones share the same end, so any holder
/// can close it.
#[derive(Clone, Debug)]
pub(crate) struct PipeWriter {
    inner: Arc<Mutex<Option<DuplexStream>>>,
}

impl PipeWriter {
    pub(crate) fn close(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            _ = guard.take();
        }
    }

    fn with_writer<F, R>(&self, f: F) -> Poll<io::Result<R>>
    where
        F: FnOnce(Pin<&mut DuplexStream>) -> Poll<io::Result<R>>,
    {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))),
        };

        match guard.as_mut() {
            Some(writer) => f(Pin::new(writer)),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.with_writer(|writer| writer.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.with_writer(|writer| writer.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.with_writer(|writer| writer.poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn close_delivers_end_of_stream_after_buffered_data() -> io::Result<()> {
        let (mut reader, mut writer) = pipe();
        writer.write_all(b"buffered").await?;
        writer.clone().close();

        let mut received = Vec::new();
        _ = reader.read_to_end(&mut received).await?;
        assert_eq!(received, b"buffered");

        let err = writer.write_all(b"late").await.err();
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::BrokenPipe));
        Ok(())
    }
}
