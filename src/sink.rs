//! Backpressure-aware output writer.
//!
//! Each call to [`SinkWriter::write`] queues one line (a JSON array of
//! documents) for a background task that owns the underlying writer. Writes
//! are never dropped; a `false` return only tells the caller that the queue is
//! above its high-water mark and it should stop producing until
//! [`SinkWriter::drained`] resolves.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SINK_HIGH_WATER_MARK;

pub struct SinkWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<watch::Sender<usize>>,
    high_water_mark: usize,
    task: JoinHandle<io::Result<u64>>,
}

impl SinkWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_high_water_mark(writer, SINK_HIGH_WATER_MARK)
    }

    pub fn with_high_water_mark<W>(writer: W, high_water_mark: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let task = tokio::spawn(pump(writer, rx, Arc::clone(&pending)));
        Self {
            tx,
            pending,
            high_water_mark,
            task,
        }
    }

    /// Queues `line` followed by a newline.
    ///
    /// Returns `false` when the queued bytes exceed the high-water mark. The
    /// line is queued either way.
    pub fn write(&self, line: String) -> bool {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        let len = bytes.len();

        self.pending.send_modify(|p| *p += len);
        if self.tx.send(bytes).is_err() {
            // Writer task is gone; its error is reported by `finish`
            self.pending.send_modify(|p| *p = p.saturating_sub(len));
            return true;
        }
        *self.pending.borrow() < self.high_water_mark
    }

    /// Bytes queued but not yet written.
    pub fn pending_bytes(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolves once every queued byte has been written.
    pub fn drained(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.pending.subscribe();
        async move {
            let _ = rx.wait_for(|pending| *pending == 0).await;
        }
    }

    /// Writes the terminating blank line, flushes and closes the writer.
    ///
    /// Returns the total number of bytes written.
    pub async fn finish(self) -> io::Result<u64> {
        let _ = self.tx.send(b"\n".to_vec());
        drop(self.tx);
        self.task.await.map_err(io::Error::other)?
    }
}

async fn pump<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<watch::Sender<usize>>,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    while let Some(buf) = rx.recv().await {
        let len = buf.len();
        let result = writer.write_all(&buf).await;
        pending.send_modify(|p| *p = p.saturating_sub(len));
        if let Err(e) = result {
            log::error!("Failed to write to the output sink: {}", e);
            rx.close();
            // Wake anyone waiting for a drain that will never come
            pending.send_replace(0);
            return Err(e);
        }
        written += len as u64;
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_lines_and_trailing_newline() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let out = tokio::fs::File::create(file.path()).await.unwrap();

        let sink = SinkWriter::new(out);
        assert!(sink.write("[{\"_id\":\"a\"}]".to_string()));
        assert!(sink.write("[]".to_string()));
        let written = sink.finish().await.unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "[{\"_id\":\"a\"}]\n[]\n\n");
        assert_eq!(written, contents.len() as u64);
    }

    #[tokio::test]
    async fn test_empty_output_is_single_newline() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let out = tokio::fs::File::create(file.path()).await.unwrap();

        SinkWriter::new(out).finish().await.unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "\n");
    }

    #[tokio::test]
    async fn test_backpressure_then_drain() {
        // A tiny pipe that only empties when we read from it
        let (writer, mut reader) = tokio::io::duplex(8);
        let sink = SinkWriter::with_high_water_mark(writer, 16);

        assert!(!sink.write("x".repeat(64)));
        assert!(sink.pending_bytes() > 0);

        let drained = tokio::spawn(sink.drained());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drained.is_finished());

        let mut buf = vec![0u8; 65];
        reader.read_exact(&mut buf).await.unwrap();
        drained.await.unwrap();
        assert_eq!(sink.pending_bytes(), 0);

        let finish = tokio::spawn(sink.finish());
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        finish.await.unwrap().unwrap();
        assert_eq!(rest, b"\n");
    }

    #[tokio::test]
    async fn test_write_error_surfaces_on_finish() {
        let (writer, reader) = tokio::io::duplex(8);
        drop(reader);
        let sink = SinkWriter::new(writer);

        sink.write("[1,2,3]".to_string());
        sink.drained().await;
        assert!(sink.finish().await.is_err());
    }
}
